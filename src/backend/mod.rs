//! Backend storage interface
//!
//! The engine implements all queue, message, claim and routing semantics
//! once, against the narrow traits in this module. A backend contributes
//! only primitive operations, each of which must be atomic from the
//! backend's point of view:
//!
//! - unique-constrained inserts that fail as a whole on conflict,
//! - conditional updates whose predicate is re-checked at write time,
//! - counter increment returning the new value.
//!
//! Backends never re-implement the claim or posting algorithms; those live
//! in the controller modules and compose these primitives.

mod memory;

pub use memory::{MemoryControl, MemoryData, MemoryConnector, MEMORY_CAPABILITIES};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::error::StorageResult;

/// Behavioral guarantees a storage driver declares.
///
/// Every pool in one flavor group must declare an identical set, so queues
/// landing anywhere in the group observe uniform semantics.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Fifo,
    Claims,
    Durability,
    AtLeastOnceDelivery,
    HighThroughput,
}

/// A queue scoped to its project. `project == None` is the global
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueScope {
    pub project: Option<String>,
    pub queue: String,
}

impl QueueScope {
    pub fn new(queue: impl Into<String>, project: Option<&str>) -> Self {
        Self {
            project: project.map(str::to_string),
            queue: queue.into(),
        }
    }

    /// Flat key form, project first since it has the higher cardinality.
    pub fn key(&self) -> String {
        format!("{}/{}", self.project.as_deref().unwrap_or(""), self.queue)
    }
}

impl fmt::Display for QueueScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.project.as_deref().unwrap_or("<global>"),
            self.queue
        )
    }
}

/// Per-queue marker counter. `updated_at` feeds the stall-detection window.
#[derive(Debug, Clone)]
pub struct Counter {
    pub value: u64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct QueueRecord {
    pub scope: QueueScope,
    pub metadata: Value,
    pub counter: Counter,
}

/// Claim sub-state carried on every message row. A fresh message starts
/// with `id: None, expires_at: <post time>, count: 0`, which makes the
/// "free" predicate a single comparison against the expiry field.
#[derive(Debug, Clone)]
pub struct ClaimState {
    pub id: Option<u64>,
    pub expires_at: i64,
    pub count: u32,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub id: u64,
    pub scope: QueueScope,
    pub body: Value,
    pub ttl: i64,
    pub created_at: i64,
    pub expires_at: i64,
    /// Monotonic per-queue sequence number; doubles as the pagination
    /// marker.
    pub marker: u64,
    /// Producer client id, used for self-echo suppression.
    pub client: Option<Uuid>,
    pub claim: ClaimState,
    /// Batch transaction tag. Rows stay invisible to listing until the tag
    /// is cleared, which makes batches appear atomically.
    pub tx: Option<Uuid>,
}

impl MessageRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    pub fn is_claimed(&self, now: i64) -> bool {
        self.claim.id.is_some() && self.claim.expires_at > now
    }

    pub fn is_finalized(&self) -> bool {
        self.tx.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct ClaimRecord {
    pub id: u64,
    pub scope: QueueScope,
    pub ttl: i64,
    pub expires_at: i64,
    pub message_count: usize,
}

/// Listing filter shared by `list`, `first` and the claim engine's
/// candidate selection. Unfinalized and expired rows are always excluded;
/// the flags widen or narrow the rest.
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    /// Exclusive lower bound on the marker.
    pub marker: Option<u64>,
    pub include_claimed: bool,
    /// When false, rows whose producer matches `client` are suppressed.
    pub echo: bool,
    pub client: Option<Uuid>,
    pub newest_first: bool,
}

/// Outcome of an atomic counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterIncr {
    /// The counter was incremented; carries the new value.
    Applied(u64),
    /// A stall window was given and the counter had been updated too
    /// recently, so the increment was skipped.
    Skipped,
    /// No counter row: the queue does not exist (or was deleted).
    Missing,
}

#[derive(Debug, Clone)]
pub struct PoolRecord {
    pub name: String,
    pub uri: String,
    pub weight: u32,
    pub group: Option<String>,
    pub options: Value,
}

#[derive(Debug, Clone, Default)]
pub struct PoolUpdate {
    pub uri: Option<String>,
    pub weight: Option<u32>,
    /// `Some(None)` clears the group, `Some(Some(_))` moves the pool.
    pub group: Option<Option<String>>,
    pub options: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct FlavorRecord {
    pub name: String,
    pub project: Option<String>,
    pub pool_group: String,
    pub capabilities: Vec<Capability>,
}

#[derive(Debug, Clone, Default)]
pub struct FlavorUpdate {
    pub pool_group: Option<String>,
    pub capabilities: Option<Vec<Capability>>,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub project: Option<String>,
    pub queue: String,
    pub pool: String,
}

/// Data-plane storage primitives, one instance per pool.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// The capability set this driver guarantees.
    fn capabilities(&self) -> &'static [Capability];

    async fn is_alive(&self) -> bool;

    /// Remove expired messages and claim rows. Backends with native TTL
    /// expiry may implement this as a no-op. Returns the number of rows
    /// collected.
    async fn gc(&self, now: i64) -> StorageResult<usize>;

    // -- queue records -----------------------------------------------------

    /// Unique insert on (project, queue). Returns `false` without touching
    /// the stored record when the pair already exists.
    async fn queue_insert(&self, record: QueueRecord) -> StorageResult<bool>;

    async fn queue_get(&self, scope: &QueueScope) -> StorageResult<Option<QueueRecord>>;

    /// Returns `false` when the queue is missing.
    async fn queue_set_metadata(&self, scope: &QueueScope, metadata: Value) -> StorageResult<bool>;

    async fn queue_delete(&self, scope: &QueueScope) -> StorageResult<()>;

    /// Name-ordered page of queue records for one project, starting after
    /// `marker`.
    async fn queue_page(
        &self,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<QueueRecord>>;

    // -- marker counter ----------------------------------------------------

    /// Read the counter without incrementing it. Parallel readers observe
    /// the same value on purpose: that is how a producer detects a
    /// competing post.
    async fn counter_get(&self, scope: &QueueScope) -> StorageResult<Option<u64>>;

    /// Atomically add `amount` and return the new value. When `window` is
    /// given, the increment only applies if the counter has not been
    /// updated within the last `window` seconds.
    async fn counter_incr(
        &self,
        scope: &QueueScope,
        amount: u64,
        window: Option<i64>,
        now: i64,
    ) -> StorageResult<CounterIncr>;

    // -- message log -------------------------------------------------------

    /// All-or-nothing batch insert. With `unique_markers`, any overlap with
    /// an existing (queue, marker) pair rejects the whole batch and returns
    /// `false`; nothing is written.
    async fn message_insert(
        &self,
        batch: Vec<MessageRecord>,
        unique_markers: bool,
    ) -> StorageResult<bool>;

    /// Clear the transaction tag on a batch, making it visible to listing.
    async fn message_finalize(&self, scope: &QueueScope, tag: Uuid) -> StorageResult<()>;

    async fn message_page(
        &self,
        scope: &QueueScope,
        filter: &MessageFilter,
        limit: usize,
        now: i64,
    ) -> StorageResult<Vec<MessageRecord>>;

    async fn message_count(
        &self,
        scope: &QueueScope,
        include_claimed: bool,
        now: i64,
    ) -> StorageResult<usize>;

    /// Single-row fetch; expired rows read as absent.
    async fn message_get(
        &self,
        scope: &QueueScope,
        id: u64,
        now: i64,
    ) -> StorageResult<Option<MessageRecord>>;

    async fn message_get_many(
        &self,
        scope: &QueueScope,
        ids: &[u64],
        now: i64,
    ) -> StorageResult<Vec<MessageRecord>>;

    async fn message_delete(&self, scope: &QueueScope, id: u64) -> StorageResult<()>;

    async fn message_delete_many(&self, scope: &QueueScope, ids: &[u64]) -> StorageResult<()>;

    /// Atomically remove and return up to `limit` free messages.
    async fn message_pop_free(
        &self,
        scope: &QueueScope,
        limit: usize,
        now: i64,
    ) -> StorageResult<Vec<MessageRecord>>;

    /// Remove every message in the queue. Only used when deleting the
    /// queue itself; anything else would reset pagination for observers.
    async fn message_purge(&self, scope: &QueueScope) -> StorageResult<()>;

    /// Re-home a message into another queue of the same pool, releasing its
    /// claim stamp and optionally overriding TTL and marker.
    async fn message_move(
        &self,
        scope: &QueueScope,
        id: u64,
        to: &QueueScope,
        ttl_override: Option<i64>,
        marker_override: Option<u64>,
        now: i64,
    ) -> StorageResult<()>;

    // -- claim sub-state ---------------------------------------------------

    /// Conditionally stamp a claim onto each listed message. The free
    /// predicate is re-checked row by row at write time, so candidates
    /// grabbed by a parallel claim simply drop out. Increments the claim
    /// count of every captured row; returns the ids actually captured.
    async fn message_capture(
        &self,
        scope: &QueueScope,
        ids: &[u64],
        claim_id: u64,
        claim_expires: i64,
        now: i64,
    ) -> StorageResult<Vec<u64>>;

    /// Rewrite the claim stamp (ttl/expiry) on every message held by
    /// `claim_id`.
    async fn message_restamp_claim(
        &self,
        scope: &QueueScope,
        claim_id: u64,
        claim_ttl: i64,
        claim_expires: i64,
    ) -> StorageResult<()>;

    /// Push out the row expiry of messages held by `claim_id` that would
    /// otherwise expire before `min_expires`.
    async fn message_extend_claimed(
        &self,
        scope: &QueueScope,
        claim_id: u64,
        min_expires: i64,
        ttl: i64,
    ) -> StorageResult<()>;

    /// Free every message held by `claim_id`: claim id cleared, claim
    /// expiry set to `now`.
    async fn message_release(&self, scope: &QueueScope, claim_id: u64, now: i64)
        -> StorageResult<()>;

    /// Marker-ordered messages currently held by a live claim.
    async fn messages_claimed(
        &self,
        scope: &QueueScope,
        claim_id: u64,
        now: i64,
        limit: Option<usize>,
    ) -> StorageResult<Vec<MessageRecord>>;

    // -- claim records -----------------------------------------------------

    async fn claim_insert(&self, record: ClaimRecord) -> StorageResult<()>;

    async fn claim_get(&self, scope: &QueueScope, id: u64) -> StorageResult<Option<ClaimRecord>>;

    /// Extend ttl/expiry only while the claim is still live; returns
    /// `false` when the claim is missing or already expired.
    async fn claim_extend(
        &self,
        scope: &QueueScope,
        id: u64,
        ttl: i64,
        expires_at: i64,
        now: i64,
    ) -> StorageResult<bool>;

    async fn claim_delete(&self, scope: &QueueScope, id: u64) -> StorageResult<()>;

    async fn claim_purge(&self, scope: &QueueScope) -> StorageResult<()>;
}

impl std::fmt::Debug for dyn DataBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn DataBackend")
    }
}

/// Control-plane storage: pools, flavors and the queue -> pool catalogue.
#[async_trait]
pub trait ControlBackend: Send + Sync {
    // -- pools -------------------------------------------------------------

    /// Unique on name and URI; violation reports `PoolAlreadyExists`.
    async fn pool_insert(&self, record: PoolRecord) -> StorageResult<()>;

    async fn pool_get(&self, name: &str) -> StorageResult<Option<PoolRecord>>;

    /// Returns `false` when the pool is missing.
    async fn pool_update(&self, name: &str, update: PoolUpdate) -> StorageResult<bool>;

    async fn pool_delete(&self, name: &str) -> StorageResult<()>;

    /// Name-ordered page starting after `marker`.
    async fn pool_page(
        &self,
        marker: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<PoolRecord>>;

    /// Pools in `group`; `None` selects the ungrouped pools.
    async fn pools_in_group(&self, group: Option<&str>) -> StorageResult<Vec<PoolRecord>>;

    async fn pool_drop_all(&self) -> StorageResult<()>;

    // -- flavors -----------------------------------------------------------

    async fn flavor_insert(&self, record: FlavorRecord) -> StorageResult<()>;

    async fn flavor_get(
        &self,
        name: &str,
        project: Option<&str>,
    ) -> StorageResult<Option<FlavorRecord>>;

    async fn flavor_update(
        &self,
        name: &str,
        project: Option<&str>,
        update: FlavorUpdate,
    ) -> StorageResult<bool>;

    async fn flavor_delete(&self, name: &str, project: Option<&str>) -> StorageResult<()>;

    async fn flavor_page(
        &self,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<FlavorRecord>>;

    /// Flavors (any project) that reference `group`.
    async fn flavors_using_group(&self, group: &str) -> StorageResult<Vec<FlavorRecord>>;

    async fn flavor_drop_all(&self) -> StorageResult<()>;

    // -- catalogue ---------------------------------------------------------

    async fn catalogue_insert(&self, entry: CatalogEntry) -> StorageResult<()>;

    async fn catalogue_get(
        &self,
        project: Option<&str>,
        queue: &str,
    ) -> StorageResult<Option<CatalogEntry>>;

    /// Returns `false` when the entry is missing.
    async fn catalogue_update(
        &self,
        project: Option<&str>,
        queue: &str,
        pool: &str,
    ) -> StorageResult<bool>;

    async fn catalogue_delete(&self, project: Option<&str>, queue: &str) -> StorageResult<()>;

    async fn catalogue_list(&self, project: Option<&str>) -> StorageResult<Vec<CatalogEntry>>;

    async fn catalogue_drop_all(&self) -> StorageResult<()>;
}

/// Builds (or locates) the data backend behind a pool URI.
///
/// The catalog uses this both to construct per-pool drivers and to probe a
/// URI's capability set before admitting the pool into a flavor group.
#[async_trait]
pub trait PoolConnector: Send + Sync {
    async fn connect(&self, uri: &str, options: &Value) -> StorageResult<Arc<dyn DataBackend>>;
}
