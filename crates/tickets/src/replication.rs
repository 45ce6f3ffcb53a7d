//! A storage backend replicated over a message bus.
//!
//! [`ReplicatedBackend`] wraps a node-local [`StorageBackend`]. Every local
//! mutation is applied to the local store first and then published as a
//! [`ChangeEvent`]; a listener task applies the events of other nodes.
//!
//! # Consistency contract
//!
//! - Propagation is asynchronous and at-least-once. Applying an event twice
//!   is harmless.
//! - Each event carries a hybrid logical clock stamp. Per key, a node only
//!   applies an event newer than the last one it applied or issued, so
//!   every node converges on the last writer. Stamps are forgotten after
//!   [`STAMP_RETENTION`].
//! - Compare-and-set and compare-and-delete are atomic on the local store
//!   only. Two nodes may each consume the same single-use ticket if they
//!   validate it before either deletion propagates; deployments that need
//!   cluster-wide single use must share one backend instead.
//! - For the same reason a [`StorageLeaseLock`](crate::StorageLeaseLock) over
//!   this backend is exclusive per node only. Pessimistic parent updates and
//!   the cleaner lock do not exclude other nodes, so every node may sweep.
//!   Sweeps stay correct since each node removes expired tickets from its
//!   own copy and deletes replicate idempotently.
//! - Range clears are applied unconditionally.

use std::{
    collections::HashMap,
    fmt,
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tessera_storage::{KeyValue, StorageBackend, StorageResult, Transaction};
use tokio::{
    select,
    sync::{broadcast, watch},
    time::{MissedTickBehavior, interval},
};
use uhlc::{HLC, HLCBuilder, ID, NTP64, Timestamp};

/// How long a per-key stamp is remembered.
pub const STAMP_RETENTION: Duration = Duration::from_secs(600);

/// How often forgotten stamps are pruned.
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Default capacity of a [`BroadcastBus`].
pub const DEFAULT_BUS_CAPACITY: usize = 4096;

/// Totally ordered HLC stamp that survives serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Stamp {
    time: u64,
    id: [u8; 16],
}

impl Stamp {
    fn new(timestamp: &Timestamp) -> Self {
        Self { time: timestamp.get_time().as_u64(), id: timestamp.get_id().to_le_bytes() }
    }

    fn to_timestamp(self) -> Option<Timestamp> {
        ID::try_from(self.id).ok().map(|id| Timestamp::new(NTP64(self.time), id))
    }

    /// Seconds component of the NTP64 time.
    fn seconds(self) -> u64 {
        self.time >> 32
    }
}

/// A replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp {
    /// Write `value`, expiring after `ttl_ms` if set.
    Put {
        /// New value.
        value: Vec<u8>,
        /// Remaining lifetime in milliseconds.
        #[serde(default)]
        ttl_ms: Option<u64>,
    },
    /// Remove the key.
    Delete,
    /// Remove every key in `[start, end]` as bounded.
    ClearRange {
        /// Lower bound.
        start: Bound<Vec<u8>>,
        /// Upper bound.
        end: Bound<Vec<u8>>,
    },
}

/// One mutation published by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Publishing node.
    pub origin: String,
    /// Clock stamp of the mutation.
    pub stamp: Stamp,
    /// Affected key. Empty for range clears.
    pub key: Vec<u8>,
    /// The mutation.
    pub op: ChangeOp,
}

/// Transport carrying [`ChangeEvent`]s between nodes.
pub trait MessageBus: Send + Sync + fmt::Debug {
    /// Sends an event to every subscriber. Fire-and-forget.
    fn publish(&self, event: ChangeEvent);

    /// Opens a new subscription.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}

/// In-process [`MessageBus`] over a Tokio broadcast channel.
///
/// Nodes sharing one `BroadcastBus` form a cluster inside one process,
/// which is how the replication path is exercised in tests.
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl MessageBus for BroadcastBus {
    fn publish(&self, event: ChangeEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("no replication subscribers");
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

fn create_hlc(node_id: &str) -> HLC {
    let hash = blake3::hash(node_id.as_bytes());
    let mut id = [0u8; 16];
    id.copy_from_slice(&hash.as_bytes()[..16]);
    match ID::try_from(id) {
        Ok(id) => HLCBuilder::new().with_id(id).build(),
        Err(_) => HLCBuilder::new().build(),
    }
}

struct Shared<B> {
    local: B,
    node_id: String,
    hlc: HLC,
    bus: Arc<dyn MessageBus>,
    last_applied: Mutex<HashMap<Vec<u8>, Stamp>>,
}

impl<B: StorageBackend> Shared<B> {
    fn stamp(&self) -> Stamp {
        Stamp::new(&self.hlc.new_timestamp())
    }

    /// Records `stamp` for `key` if it is the newest seen. Returns whether
    /// the caller may apply its mutation.
    fn claim(&self, key: &[u8], stamp: Stamp) -> bool {
        let mut last = self.last_applied.lock();
        match last.get(key) {
            Some(seen) if *seen >= stamp => false,
            _ => {
                last.insert(key.to_vec(), stamp);
                true
            },
        }
    }

    fn publish(&self, stamp: Stamp, key: Vec<u8>, op: ChangeOp) {
        self.bus.publish(ChangeEvent { origin: self.node_id.clone(), stamp, key, op });
    }

    fn publish_put(&self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        let stamp = self.stamp();
        self.claim(key, stamp);
        let ttl_ms = ttl.map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        self.publish(stamp, key.to_vec(), ChangeOp::Put { value, ttl_ms });
    }

    fn publish_delete(&self, key: &[u8]) {
        let stamp = self.stamp();
        self.claim(key, stamp);
        self.publish(stamp, key.to_vec(), ChangeOp::Delete);
    }

    #[tracing::instrument(skip_all, fields(origin = %event.origin))]
    async fn apply_remote(&self, event: ChangeEvent) -> StorageResult<bool> {
        if event.origin == self.node_id {
            return Ok(false);
        }
        if let Some(timestamp) = event.stamp.to_timestamp() {
            if let Err(err) = self.hlc.update_with_timestamp(&timestamp) {
                tracing::warn!(error = %err, "remote clock drift");
            }
        }

        match event.op {
            ChangeOp::ClearRange { start, end } => {
                self.local.clear_range((start, end)).await?;
                Ok(true)
            },
            ChangeOp::Put { value, ttl_ms } => {
                if !self.claim(&event.key, event.stamp) {
                    return Ok(false);
                }
                match ttl_ms {
                    Some(ms) => {
                        self.local.set_with_ttl(event.key, value, Duration::from_millis(ms)).await?;
                    },
                    None => self.local.set(event.key, value).await?,
                }
                Ok(true)
            },
            ChangeOp::Delete => {
                if !self.claim(&event.key, event.stamp) {
                    return Ok(false);
                }
                self.local.delete(&event.key).await?;
                Ok(true)
            },
        }
    }

    fn prune_stamps(&self) -> usize {
        let now = self.stamp().seconds();
        let horizon = now.saturating_sub(STAMP_RETENTION.as_secs());
        let mut last = self.last_applied.lock();
        let before = last.len();
        last.retain(|_, stamp| stamp.seconds() >= horizon);
        before - last.len()
    }
}

/// Stops the listener when the last backend handle is dropped.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// A [`StorageBackend`] replicated over a [`MessageBus`].
///
/// Cheaply cloneable; clones share the local store and the listener.
pub struct ReplicatedBackend<B> {
    shared: Arc<Shared<B>>,
    _shutdown_guard: Arc<ShutdownGuard>,
}

impl<B> Clone for ReplicatedBackend<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _shutdown_guard: Arc::clone(&self._shutdown_guard),
        }
    }
}

impl<B> fmt::Debug for ReplicatedBackend<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicatedBackend")
            .field("node_id", &self.shared.node_id)
            .field("tracked_keys", &self.shared.last_applied.lock().len())
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + 'static> ReplicatedBackend<B> {
    /// Joins the cluster on `bus` as `node_id`, storing locally in `local`.
    ///
    /// Must be called from within a Tokio runtime; the listener task runs
    /// until every clone of the returned backend is dropped.
    #[must_use]
    pub fn new(local: B, node_id: impl Into<String>, bus: Arc<dyn MessageBus>) -> Self {
        let node_id = node_id.into();
        let shared = Arc::new(Shared {
            local,
            hlc: create_hlc(&node_id),
            node_id,
            last_applied: Mutex::new(HashMap::new()),
            bus,
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let receiver = shared.bus.subscribe();
        tokio::spawn(listen(Arc::clone(&shared), receiver, shutdown_rx));

        Self { shared, _shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }) }
    }

    /// This node's id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.shared.node_id
    }

    /// The node-local store.
    #[must_use]
    pub fn local(&self) -> &B {
        &self.shared.local
    }
}

async fn listen<B: StorageBackend>(
    shared: Arc<Shared<B>>,
    mut receiver: broadcast::Receiver<ChangeEvent>,
    mut shutdown_rx: watch::Receiver<()>,
) {
    tracing::info!(node = %shared.node_id, "replication listener started");
    let mut prune = interval(PRUNE_INTERVAL);
    prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            _ = shutdown_rx.changed() => break,
            _ = prune.tick() => {
                let pruned = shared.prune_stamps();
                if pruned > 0 {
                    tracing::debug!(pruned, "forgot replication stamps");
                }
            }
            received = receiver.recv() => match received {
                Ok(event) => {
                    if let Err(err) = shared.apply_remote(event).await {
                        tracing::warn!(error = %err, "failed to apply replicated change");
                    }
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "replication receiver lagged; changes were lost");
                },
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    tracing::info!(node = %shared.node_id, "replication listener stopped");
}

fn owned_bounds<R: RangeBounds<Vec<u8>>>(range: &R) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    (range.start_bound().cloned(), range.end_bound().cloned())
}

#[async_trait]
impl<B: StorageBackend + 'static> StorageBackend for ReplicatedBackend<B> {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.shared.local.get(key).await
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.shared.local.set(key.clone(), value.clone()).await?;
        self.shared.publish_put(&key, value, None);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), ttl_ms = ttl.as_millis() as u64))]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        self.shared.local.set_with_ttl(key.clone(), value.clone(), ttl).await?;
        self.shared.publish_put(&key, value, Some(ttl));
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len(), insert = expected.is_none()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        self.shared.local.compare_and_set(key, expected, new_value.clone(), ttl).await?;
        self.shared.publish_put(key, new_value, ttl);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn compare_and_delete(&self, key: &[u8], expected: &[u8]) -> StorageResult<()> {
        self.shared.local.compare_and_delete(key, expected).await?;
        self.shared.publish_delete(key);
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        self.shared.local.delete(key).await?;
        self.shared.publish_delete(key);
        Ok(())
    }

    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        self.shared.local.get_range(range).await
    }

    #[tracing::instrument(skip_all)]
    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let (start, end) = owned_bounds(&range);
        self.shared.local.clear_range(range).await?;
        let stamp = self.shared.stamp();
        self.shared.publish(stamp, Vec::new(), ChangeOp::ClearRange { start, end });
        Ok(())
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        let inner = self.shared.local.transaction().await?;
        Ok(Box::new(ReplicatedTransaction {
            inner,
            shared: Arc::clone(&self.shared) as Arc<dyn Publisher>,
            writes: Vec::new(),
        }))
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.shared.local.health_check().await
    }

    fn has_native_ttl(&self) -> bool {
        self.shared.local.has_native_ttl()
    }

    async fn purge_expired(&self) -> StorageResult<usize> {
        // Each node reclaims its own copy.
        self.shared.local.purge_expired().await
    }
}

/// Type-erased publishing side of [`Shared`], so transactions need not be
/// generic over the local backend.
trait Publisher: Send + Sync {
    fn put(&self, key: &[u8], value: Vec<u8>);
    fn delete(&self, key: &[u8]);
}

impl<B: StorageBackend> Publisher for Shared<B> {
    fn put(&self, key: &[u8], value: Vec<u8>) {
        self.publish_put(key, value, None);
    }

    fn delete(&self, key: &[u8]) {
        self.publish_delete(key);
    }
}

/// Publishes the buffered writes of a local transaction once it commits.
struct ReplicatedTransaction {
    inner: Box<dyn Transaction>,
    shared: Arc<dyn Publisher>,
    writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

#[async_trait]
impl Transaction for ReplicatedTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.inner.get(key).await
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push((key.clone(), Some(value.clone())));
        self.inner.set(key, value);
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.writes.push((key.clone(), None));
        self.inner.delete(key);
    }

    fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.inner.compare_and_set(key.clone(), expected, new_value.clone())?;
        self.writes.push((key, Some(new_value)));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let Self { inner, shared, writes } = *self;
        inner.commit().await?;
        for (key, value) in writes {
            match value {
                Some(value) => shared.put(&key, value),
                None => shared.delete(&key),
            }
        }
        Ok(())
    }
}
