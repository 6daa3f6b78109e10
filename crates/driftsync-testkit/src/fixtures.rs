//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;

use driftsync::{SchedulerPolicy, SyncScheduler};
use driftsync_core::{Collection, Origin, PairId, SyncMarker};
use driftsync_store::{MemoryService, MemoryStore, RemoteStore, StoreAdapter};
use driftsync_sync::{PairConfig, SyncPair};

use crate::faults::FaultyStore;
use crate::recorder::RecordingSink;

/// The remote side as the pair sees it.
pub type FaultyRemote = FaultyStore<RemoteStore<Arc<MemoryService>>>;

/// The local side as the pair sees it.
pub type FaultyLocal = FaultyStore<Arc<MemoryStore>>;

/// A local in-memory store and an in-process remote service for one
/// collection, both behind fault injectors.
pub struct TestFixture {
    pub collection: Collection,
    /// Backing store of the local side, for direct inspection.
    pub local_store: Arc<MemoryStore>,
    /// The remote service; its backing store is `service.store()`.
    pub service: Arc<MemoryService>,
    pub local: Arc<FaultyLocal>,
    pub remote: Arc<FaultyRemote>,
}

impl TestFixture {
    /// Create a fixture for `collection`.
    ///
    /// # Panics
    ///
    /// Panics if the collection name is invalid.
    pub fn new(collection: &str) -> Self {
        let collection = Collection::new(collection).expect("valid collection name");
        let local_store = Arc::new(MemoryStore::new(Origin::Local));
        let service = Arc::new(MemoryService::new());

        Self {
            collection,
            local: Arc::new(FaultyStore::new(local_store.clone())),
            remote: Arc::new(FaultyStore::new(RemoteStore::new(service.clone()))),
            local_store,
            service,
        }
    }

    /// A pair over the fixture's stores with default config.
    pub fn pair(&self) -> SyncPair {
        self.pair_with(PairConfig::default())
    }

    pub fn pair_with(&self, config: PairConfig) -> SyncPair {
        SyncPair::new(self.collection.clone(), self.local.clone(), self.remote.clone())
            .expect("fixture stores have distinct origins")
            .with_config(config)
    }

    /// A scheduler serving this fixture's pair, recording its events.
    /// Must be called inside a tokio runtime.
    pub fn scheduler(
        &self,
        policy: SchedulerPolicy,
    ) -> anyhow::Result<(SyncScheduler, RecordingSink)> {
        self.scheduler_with(policy, PairConfig::default())
    }

    pub fn scheduler_with(
        &self,
        policy: SchedulerPolicy,
        config: PairConfig,
    ) -> anyhow::Result<(SyncScheduler, RecordingSink)> {
        let sink = RecordingSink::new();
        let scheduler = SyncScheduler::builder()
            .pair(self.pair_with(config))
            .policy(policy)
            .sink(sink.clone())
            .spawn()
            .context("spawning scheduler")?;
        Ok((scheduler, sink))
    }

    /// The remote service's backing store.
    pub fn remote_store(&self) -> &Arc<MemoryStore> {
        self.service.store()
    }

    /// Write entries straight into the remote backing store, bypassing faults.
    pub async fn seed_remote(&self, entries: &[(&str, &str)]) -> anyhow::Result<()> {
        seed(self.remote_store().as_ref(), &self.collection, entries).await
    }

    /// Write entries straight into the local backing store, bypassing faults.
    pub async fn seed_local(&self, entries: &[(&str, &str)]) -> anyhow::Result<()> {
        seed(self.local_store.as_ref(), &self.collection, entries).await
    }

    /// Live value of `key` in the local backing store.
    pub async fn local_value(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.local_store.get(&self.collection, key).await?)
    }

    /// Live value of `key` in the remote backing store.
    pub async fn remote_value(&self, key: &str) -> anyhow::Result<Option<Bytes>> {
        Ok(self.remote_store().get(&self.collection, key).await?)
    }

    /// Marker the local store holds for pulls of this collection.
    pub async fn pull_marker(&self) -> anyhow::Result<Option<SyncMarker>> {
        let pair = PairId::derive(&self.collection, Origin::Remote, Origin::Local);
        Ok(self.local_store.get_marker(&pair).await?)
    }

    /// Marker the remote store holds for pushes of this collection.
    pub async fn push_marker(&self) -> anyhow::Result<Option<SyncMarker>> {
        let pair = PairId::derive(&self.collection, Origin::Local, Origin::Remote);
        Ok(self.remote_store().get_marker(&pair).await?)
    }
}

async fn seed(
    store: &dyn StoreAdapter,
    collection: &Collection,
    entries: &[(&str, &str)],
) -> anyhow::Result<()> {
    for (key, value) in entries {
        store
            .set(collection, key, Bytes::copy_from_slice(value.as_bytes()))
            .await
            .with_context(|| format!("seeding {collection}/{key}"))?;
    }
    Ok(())
}
