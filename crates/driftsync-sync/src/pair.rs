//! SyncPair: a bound (local, remote) adapter pair for one collection.
//!
//! A pull moves changes from remote to local, a push from local to remote.
//! Both run the same transfer loop with source and destination swapped:
//!
//! ```text
//! marker = destination.get_marker(pair)
//! loop:
//!     checkpoint (cancellation)
//!     batch = source.changes_since(collection, marker, batch_size)
//!     outcomes = destination.apply_changes(collection, batch.records)
//!     any failed? -> PartialApply, marker untouched
//!     destination.set_marker(pair, batch.next_marker)
//!     until !batch.has_more
//! ```

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use driftsync_core::{ApplyOutcome, Collection, Direction, PairId, SyncMarker};
use driftsync_store::{StoreAdapter, StoreError};

use crate::cancel::CancelFlag;
use crate::config::PairConfig;
use crate::error::{Result, SyncError};

/// Counters for one pull or push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Records read from the source.
    pub received: usize,
    /// Records that changed the destination.
    pub applied: usize,
    /// Records the destination already had.
    pub duplicates: usize,
    /// Records that lost a last-writer-wins conflict.
    pub superseded: usize,
    /// Batches fully applied.
    pub batches: usize,
    /// Destination marker after the transfer.
    pub marker: Option<SyncMarker>,
}

/// Result of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub pull: Option<TransferReport>,
    pub push: Option<TransferReport>,
}

impl SyncReport {
    /// Records applied in either direction.
    pub fn applied(&self) -> usize {
        self.transfers().map(|t| t.applied).sum()
    }

    /// Records received in either direction.
    pub fn received(&self) -> usize {
        self.transfers().map(|t| t.received).sum()
    }

    fn transfers(&self) -> impl Iterator<Item = &TransferReport> {
        self.pull.iter().chain(self.push.iter())
    }
}

/// A local and a remote store bound together for one collection.
///
/// The pair never reinterprets a store's error classification; it only
/// decides whether a batch counts as durably applied.
pub struct SyncPair {
    collection: Collection,
    local: Arc<dyn StoreAdapter>,
    remote: Arc<dyn StoreAdapter>,
    config: PairConfig,
}

impl SyncPair {
    /// Bind `local` and `remote` for `collection` with default config.
    ///
    /// Marker slots are keyed by the stores' origins, so both stores must
    /// report different ones.
    pub fn new(
        collection: Collection,
        local: Arc<dyn StoreAdapter>,
        remote: Arc<dyn StoreAdapter>,
    ) -> Result<Self> {
        if local.origin() == remote.origin() {
            return Err(SyncError::InvalidPair(format!(
                "both stores for {collection} report origin {}",
                local.origin()
            )));
        }
        Ok(Self {
            collection,
            local,
            remote,
            config: PairConfig::default(),
        })
    }

    pub fn with_config(mut self, config: PairConfig) -> Self {
        self.config = config;
        self
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    pub fn config(&self) -> &PairConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<dyn StoreAdapter> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<dyn StoreAdapter> {
        &self.remote
    }

    /// Marker slot for remote-to-local transfers, kept by the local store.
    pub fn pull_id(&self) -> PairId {
        PairId::derive(&self.collection, self.remote.origin(), self.local.origin())
    }

    /// Marker slot for local-to-remote transfers, kept by the remote store.
    pub fn push_id(&self) -> PairId {
        PairId::derive(&self.collection, self.local.origin(), self.remote.origin())
    }

    /// Run a cycle in the given direction. Bidirectional pulls first, so
    /// local changes are resolved against the freshest remote state before
    /// they are pushed.
    pub async fn run(&self, direction: Direction, cancel: &CancelFlag) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        if matches!(direction, Direction::Pull | Direction::Bidirectional) {
            report.pull = Some(self.pull(cancel).await?);
        }
        if matches!(direction, Direction::Push | Direction::Bidirectional) {
            report.push = Some(self.push(cancel).await?);
        }

        Ok(report)
    }

    /// Move remote changes into the local store.
    pub async fn pull(&self, cancel: &CancelFlag) -> Result<TransferReport> {
        self.transfer(
            Direction::Pull,
            self.remote.as_ref(),
            self.local.as_ref(),
            self.pull_id(),
            cancel,
        )
        .await
    }

    /// Move local changes into the remote store.
    pub async fn push(&self, cancel: &CancelFlag) -> Result<TransferReport> {
        self.transfer(
            Direction::Push,
            self.local.as_ref(),
            self.remote.as_ref(),
            self.push_id(),
            cancel,
        )
        .await
    }

    async fn transfer(
        &self,
        direction: Direction,
        source: &dyn StoreAdapter,
        destination: &dyn StoreAdapter,
        pair: PairId,
        cancel: &CancelFlag,
    ) -> Result<TransferReport> {
        let collection = &self.collection;
        let batch_size = self.config.batch_size.max(1);
        let mut marker = self.timed("get_marker", destination.get_marker(&pair)).await?;
        let mut report = TransferReport {
            marker,
            ..TransferReport::default()
        };

        loop {
            if cancel.is_cancelled() {
                debug!(%collection, %direction, marker = ?marker, "sync cancelled at checkpoint");
                return Err(SyncError::Cancelled);
            }

            let batch = self
                .timed(
                    "changes_since",
                    source.changes_since(collection, marker, batch_size),
                )
                .await?;

            if !batch.records.is_empty() {
                let outcomes = self
                    .timed(
                        "apply_changes",
                        destination.apply_changes(collection, &batch.records),
                    )
                    .await?;
                self.settle(direction, batch.records.len(), &outcomes, &mut report)?;
            }

            // Only after the whole batch is settled on the destination.
            let advanced = batch.next_marker.filter(|next| Some(*next) > marker);
            if let Some(next) = advanced {
                self.timed("set_marker", destination.set_marker(&pair, next))
                    .await?;
                marker = Some(next);
                report.marker = marker;
            }

            if !batch.records.is_empty() {
                report.batches += 1;
                debug!(
                    %collection,
                    %direction,
                    records = batch.records.len(),
                    marker = ?marker,
                    "batch applied"
                );
            }

            if !batch.has_more {
                break;
            }
            if batch.records.is_empty() && advanced.is_none() {
                warn!(
                    %collection,
                    %direction,
                    marker = ?marker,
                    "source reported more changes but returned none, stopping"
                );
                break;
            }
        }

        Ok(report)
    }

    /// Tally outcomes into `report`, or fail the batch if any record failed.
    fn settle(
        &self,
        direction: Direction,
        total: usize,
        outcomes: &[ApplyOutcome],
        report: &mut TransferReport,
    ) -> Result<()> {
        if outcomes.len() != total {
            return Err(StoreError::Malformed(format!(
                "apply_changes returned {} outcomes for {total} records",
                outcomes.len()
            ))
            .into());
        }

        let mut failed = 0;
        let mut worst = None;
        let mut first_reason = None;
        let mut superseded = 0;

        for outcome in outcomes {
            match outcome {
                ApplyOutcome::Applied => report.applied += 1,
                ApplyOutcome::Duplicate => report.duplicates += 1,
                ApplyOutcome::Superseded { .. } => superseded += 1,
                ApplyOutcome::Failed { class, reason } => {
                    failed += 1;
                    worst = worst.max(Some(*class));
                    first_reason.get_or_insert_with(|| reason.clone());
                }
            }
        }

        report.received += total;
        report.superseded += superseded;

        if superseded > 0 {
            warn!(
                collection = %self.collection,
                %direction,
                superseded,
                "incoming records lost last-writer-wins conflicts"
            );
        }

        match worst {
            Some(class) => {
                warn!(
                    collection = %self.collection,
                    %direction,
                    failed,
                    total,
                    %class,
                    "partial apply, marker not advanced"
                );
                Err(SyncError::PartialApply {
                    failed,
                    total,
                    class,
                    reason: first_reason.unwrap_or_default(),
                })
            }
            None => Ok(()),
        }
    }

    /// Await a store call under the pair's call timeout.
    async fn timed<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = driftsync_store::Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.call_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SyncError::Timeout(format!(
                "{op} on {} exceeded {:?}",
                self.collection, self.config.call_timeout
            ))),
        }
    }
}
