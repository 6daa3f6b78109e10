//! Fault injection for store adapters.
//!
//! [`FaultyStore`] forwards every call to an inner store unless a fault has
//! been scripted for that operation, in which case the next call consumes it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use driftsync_core::{
    ApplyOutcome, ChangeBatch, ChangeRecord, Collection, ErrorClass, Origin, PairId, SyncMarker,
    Version,
};
use driftsync_store::{Query, Result, StoreAdapter, StoreError};

/// Store operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Set,
    Remove,
    Query,
    ChangesSince,
    ApplyChanges,
    GetMarker,
    SetMarker,
}

/// What happens to a scripted call.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail with a transport error.
    Transient,
    /// Fail with a malformed-payload error.
    Fatal,
    /// Fail with a quota error.
    Quota,
    /// Fail with an authentication error.
    Authentication,
    /// Sleep, then perform the call normally.
    Delay(Duration),
    /// Never complete.
    Hang,
    /// Panic inside the call.
    Panic,
    /// `ApplyChanges` only: report every record as failed with this class,
    /// applying nothing.
    RejectRecords(ErrorClass),
}

/// A store wrapper that injects scripted faults.
pub struct FaultyStore<S> {
    inner: S,
    script: Mutex<HashMap<Op, VecDeque<Fault>>>,
    calls: Mutex<HashMap<Op, usize>>,
}

impl<S: StoreAdapter> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Script one fault for the next call to `op`.
    pub fn fail(&self, op: Op, fault: Fault) -> &Self {
        self.fail_times(op, fault, 1)
    }

    /// Script the same fault for the next `times` calls to `op`.
    pub fn fail_times(&self, op: Op, fault: Fault, times: usize) -> &Self {
        let mut script = self.script.lock();
        let queue = script.entry(op).or_default();
        queue.extend(std::iter::repeat(fault).take(times));
        self
    }

    /// Drop every scripted fault that has not fired yet.
    pub fn clear(&self) {
        self.script.lock().clear();
    }

    /// Calls made to `op` so far, faulted or not.
    pub fn calls(&self, op: Op) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    /// Consume the next fault for `op`. Returns the fault that should shape
    /// the call's result, if any; delays are served here.
    async fn inject(&self, op: Op) -> Result<Option<Fault>> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let fault = self.script.lock().get_mut(&op).and_then(VecDeque::pop_front);

        let what = format!("injected fault in {op:?}");
        match fault {
            None => Ok(None),
            Some(Fault::Transient) => Err(StoreError::Transport(what)),
            Some(Fault::Fatal) => Err(StoreError::Malformed(what)),
            Some(Fault::Quota) => Err(StoreError::Quota(what)),
            Some(Fault::Authentication) => Err(StoreError::Authentication(what)),
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(None)
            }
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            Some(Fault::Panic) => panic!("{what}"),
            Some(fault @ Fault::RejectRecords(_)) => Ok(Some(fault)),
        }
    }
}

#[async_trait]
impl<S: StoreAdapter> StoreAdapter for FaultyStore<S> {
    fn origin(&self) -> Origin {
        self.inner.origin()
    }

    async fn get(&self, collection: &Collection, key: &str) -> Result<Option<Bytes>> {
        self.inject(Op::Get).await?;
        self.inner.get(collection, key).await
    }

    async fn set(&self, collection: &Collection, key: &str, value: Bytes) -> Result<Version> {
        self.inject(Op::Set).await?;
        self.inner.set(collection, key, value).await
    }

    async fn remove(&self, collection: &Collection, key: &str) -> Result<Option<Version>> {
        self.inject(Op::Remove).await?;
        self.inner.remove(collection, key).await
    }

    async fn query(&self, collection: &Collection, query: &Query) -> Result<Vec<(String, Bytes)>> {
        self.inject(Op::Query).await?;
        self.inner.query(collection, query).await
    }

    async fn changes_since(
        &self,
        collection: &Collection,
        marker: Option<SyncMarker>,
        limit: usize,
    ) -> Result<ChangeBatch> {
        self.inject(Op::ChangesSince).await?;
        self.inner.changes_since(collection, marker, limit).await
    }

    async fn apply_changes(
        &self,
        collection: &Collection,
        records: &[ChangeRecord],
    ) -> Result<Vec<ApplyOutcome>> {
        if let Some(Fault::RejectRecords(class)) = self.inject(Op::ApplyChanges).await? {
            return Ok(records
                .iter()
                .map(|_| ApplyOutcome::Failed {
                    class,
                    reason: "injected record rejection".into(),
                })
                .collect());
        }
        self.inner.apply_changes(collection, records).await
    }

    async fn get_marker(&self, pair: &PairId) -> Result<Option<SyncMarker>> {
        self.inject(Op::GetMarker).await?;
        self.inner.get_marker(pair).await
    }

    async fn set_marker(&self, pair: &PairId, marker: SyncMarker) -> Result<()> {
        self.inject(Op::SetMarker).await?;
        self.inner.set_marker(pair, marker).await
    }
}
