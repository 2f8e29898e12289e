//! In-memory backend
//!
//! Reference implementation of the storage primitives. All state for one
//! pool sits behind a single writer lock, which makes every primitive
//! trivially atomic; expiry is enforced by the lazy read filters plus the
//! explicit `gc` sweep. The connector keys stores by URI, so two drivers
//! connected to the same URI observe the same data, the way two clients of
//! one database server would.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::backend::{
    Capability, CatalogEntry, ClaimRecord, ControlBackend, CounterIncr, DataBackend,
    FlavorRecord, FlavorUpdate, MessageFilter, MessageRecord, PoolConnector, PoolRecord,
    PoolUpdate, QueueRecord, QueueScope,
};
use crate::core::error::{StorageError, StorageResult};

/// What the in-memory driver can promise. Nothing here survives a process
/// restart, so DURABILITY is deliberately absent.
pub const MEMORY_CAPABILITIES: &[Capability] = &[
    Capability::Fifo,
    Capability::Claims,
    Capability::AtLeastOnceDelivery,
    Capability::HighThroughput,
];

#[derive(Default)]
struct DataState {
    queues: HashMap<String, QueueRecord>,
    /// scope key -> message id -> record
    messages: HashMap<String, HashMap<u64, MessageRecord>>,
    claims: HashMap<String, HashMap<u64, ClaimRecord>>,
}

/// One pool's worth of data-plane storage.
pub struct MemoryData {
    capabilities: &'static [Capability],
    state: RwLock<DataState>,
}

impl MemoryData {
    pub fn new() -> Self {
        Self::with_capabilities(MEMORY_CAPABILITIES)
    }

    /// Used by the connector to present the same storage under a scheme
    /// with a narrower (or wider) declared capability set.
    pub fn with_capabilities(capabilities: &'static [Capability]) -> Self {
        Self {
            capabilities,
            state: RwLock::new(DataState::default()),
        }
    }

    fn free(record: &MessageRecord, now: i64) -> bool {
        record.is_finalized() && !record.is_expired(now) && !record.is_claimed(now)
    }
}

impl Default for MemoryData {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataBackend for MemoryData {
    fn capabilities(&self) -> &'static [Capability] {
        self.capabilities
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn gc(&self, now: i64) -> StorageResult<usize> {
        let mut state = self.state.write().unwrap();
        let mut collected = 0;

        for rows in state.messages.values_mut() {
            let before = rows.len();
            rows.retain(|_, record| !record.is_expired(now));
            collected += before - rows.len();
        }
        for claims in state.claims.values_mut() {
            let before = claims.len();
            claims.retain(|_, claim| claim.expires_at > now);
            collected += before - claims.len();
        }

        Ok(collected)
    }

    async fn queue_insert(&self, record: QueueRecord) -> StorageResult<bool> {
        let mut state = self.state.write().unwrap();
        let key = record.scope.key();
        if state.queues.contains_key(&key) {
            return Ok(false);
        }
        state.queues.insert(key, record);
        Ok(true)
    }

    async fn queue_get(&self, scope: &QueueScope) -> StorageResult<Option<QueueRecord>> {
        let state = self.state.read().unwrap();
        Ok(state.queues.get(&scope.key()).cloned())
    }

    async fn queue_set_metadata(&self, scope: &QueueScope, metadata: Value) -> StorageResult<bool> {
        let mut state = self.state.write().unwrap();
        match state.queues.get_mut(&scope.key()) {
            Some(record) => {
                record.metadata = metadata;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn queue_delete(&self, scope: &QueueScope) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        state.queues.remove(&scope.key());
        Ok(())
    }

    async fn queue_page(
        &self,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<QueueRecord>> {
        let state = self.state.read().unwrap();
        let mut page: Vec<QueueRecord> = state
            .queues
            .values()
            .filter(|record| record.scope.project.as_deref() == project)
            .filter(|record| marker.map_or(true, |m| record.scope.queue.as_str() > m))
            .cloned()
            .collect();
        page.sort_by(|a, b| a.scope.queue.cmp(&b.scope.queue));
        page.truncate(limit);
        Ok(page)
    }

    async fn counter_get(&self, scope: &QueueScope) -> StorageResult<Option<u64>> {
        let state = self.state.read().unwrap();
        Ok(state
            .queues
            .get(&scope.key())
            .map(|record| record.counter.value))
    }

    async fn counter_incr(
        &self,
        scope: &QueueScope,
        amount: u64,
        window: Option<i64>,
        now: i64,
    ) -> StorageResult<CounterIncr> {
        let mut state = self.state.write().unwrap();
        let record = match state.queues.get_mut(&scope.key()) {
            Some(record) => record,
            None => return Ok(CounterIncr::Missing),
        };

        if let Some(window) = window {
            if record.counter.updated_at >= now - window {
                return Ok(CounterIncr::Skipped);
            }
        }

        record.counter.value += amount;
        record.counter.updated_at = now;
        Ok(CounterIncr::Applied(record.counter.value))
    }

    async fn message_insert(
        &self,
        batch: Vec<MessageRecord>,
        unique_markers: bool,
    ) -> StorageResult<bool> {
        if batch.is_empty() {
            return Ok(true);
        }

        let mut state = self.state.write().unwrap();
        let key = batch[0].scope.key();
        let rows = state.messages.entry(key).or_default();

        if unique_markers {
            // The uniqueness constraint covers every stored row, including
            // expired ones that have not been collected yet. Reusing a
            // marker before its previous owner is swept could make a
            // message invisible to an observer paging past it.
            for record in &batch {
                if rows.values().any(|existing| existing.marker == record.marker) {
                    return Ok(false);
                }
            }
        }

        for record in batch {
            rows.insert(record.id, record);
        }
        Ok(true)
    }

    async fn message_finalize(&self, scope: &QueueScope, tag: Uuid) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(rows) = state.messages.get_mut(&scope.key()) {
            for record in rows.values_mut() {
                if record.tx == Some(tag) {
                    record.tx = None;
                }
            }
        }
        Ok(())
    }

    async fn message_page(
        &self,
        scope: &QueueScope,
        filter: &MessageFilter,
        limit: usize,
        now: i64,
    ) -> StorageResult<Vec<MessageRecord>> {
        let state = self.state.read().unwrap();
        let mut page: Vec<MessageRecord> = match state.messages.get(&scope.key()) {
            Some(rows) => rows
                .values()
                .filter(|record| record.is_finalized() && !record.is_expired(now))
                .filter(|record| filter.include_claimed || !record.is_claimed(now))
                .filter(|record| {
                    filter.echo
                        || filter.client.is_none()
                        || record.client != filter.client
                })
                .filter(|record| filter.marker.map_or(true, |m| record.marker > m))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        if filter.newest_first {
            page.sort_by(|a, b| b.marker.cmp(&a.marker));
        } else {
            page.sort_by(|a, b| a.marker.cmp(&b.marker));
        }
        page.truncate(limit);
        Ok(page)
    }

    async fn message_count(
        &self,
        scope: &QueueScope,
        include_claimed: bool,
        now: i64,
    ) -> StorageResult<usize> {
        let state = self.state.read().unwrap();
        Ok(match state.messages.get(&scope.key()) {
            Some(rows) => rows
                .values()
                .filter(|record| record.is_finalized() && !record.is_expired(now))
                .filter(|record| include_claimed || !record.is_claimed(now))
                .count(),
            None => 0,
        })
    }

    async fn message_get(
        &self,
        scope: &QueueScope,
        id: u64,
        now: i64,
    ) -> StorageResult<Option<MessageRecord>> {
        let state = self.state.read().unwrap();
        Ok(state
            .messages
            .get(&scope.key())
            .and_then(|rows| rows.get(&id))
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn message_get_many(
        &self,
        scope: &QueueScope,
        ids: &[u64],
        now: i64,
    ) -> StorageResult<Vec<MessageRecord>> {
        let state = self.state.read().unwrap();
        let mut found: Vec<MessageRecord> = match state.messages.get(&scope.key()) {
            Some(rows) => ids
                .iter()
                .filter_map(|id| rows.get(id))
                .filter(|record| !record.is_expired(now))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        found.sort_by(|a, b| a.marker.cmp(&b.marker));
        Ok(found)
    }

    async fn message_delete(&self, scope: &QueueScope, id: u64) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(rows) = state.messages.get_mut(&scope.key()) {
            rows.remove(&id);
        }
        Ok(())
    }

    async fn message_delete_many(&self, scope: &QueueScope, ids: &[u64]) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(rows) = state.messages.get_mut(&scope.key()) {
            for id in ids {
                rows.remove(id);
            }
        }
        Ok(())
    }

    async fn message_pop_free(
        &self,
        scope: &QueueScope,
        limit: usize,
        now: i64,
    ) -> StorageResult<Vec<MessageRecord>> {
        let mut state = self.state.write().unwrap();
        let rows = match state.messages.get_mut(&scope.key()) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        let victims: Vec<u64> = rows
            .values()
            .filter(|record| Self::free(record, now))
            .map(|record| (record.marker, record.id))
            .collect::<BTreeMap<u64, u64>>()
            .into_values()
            .take(limit)
            .collect();

        let mut popped: Vec<MessageRecord> = victims
            .into_iter()
            .filter_map(|id| rows.remove(&id))
            .collect();
        popped.sort_by(|a, b| a.marker.cmp(&b.marker));
        Ok(popped)
    }

    async fn message_purge(&self, scope: &QueueScope) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        state.messages.remove(&scope.key());
        Ok(())
    }

    async fn message_move(
        &self,
        scope: &QueueScope,
        id: u64,
        to: &QueueScope,
        ttl_override: Option<i64>,
        marker_override: Option<u64>,
        now: i64,
    ) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        let record = match state
            .messages
            .get_mut(&scope.key())
            .and_then(|rows| rows.remove(&id))
        {
            Some(record) => record,
            None => return Ok(()),
        };

        let mut moved = record;
        moved.scope = to.clone();
        if let Some(ttl) = ttl_override {
            moved.ttl = ttl;
            moved.expires_at = now + ttl;
        }
        if let Some(marker) = marker_override {
            moved.marker = marker;
        }
        moved.claim.id = None;
        moved.claim.expires_at = now;

        state
            .messages
            .entry(to.key())
            .or_default()
            .insert(moved.id, moved);
        Ok(())
    }

    async fn message_capture(
        &self,
        scope: &QueueScope,
        ids: &[u64],
        claim_id: u64,
        claim_expires: i64,
        now: i64,
    ) -> StorageResult<Vec<u64>> {
        let mut state = self.state.write().unwrap();
        let rows = match state.messages.get_mut(&scope.key()) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        let mut captured = Vec::new();
        for id in ids {
            if let Some(record) = rows.get_mut(id) {
                // The free predicate is evaluated again here, not trusted
                // from the candidate selection: a parallel claim may have
                // captured the row in between.
                if Self::free(record, now) {
                    record.claim.id = Some(claim_id);
                    record.claim.expires_at = claim_expires;
                    record.claim.count += 1;
                    captured.push(*id);
                }
            }
        }
        Ok(captured)
    }

    async fn message_restamp_claim(
        &self,
        scope: &QueueScope,
        claim_id: u64,
        _claim_ttl: i64,
        claim_expires: i64,
    ) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(rows) = state.messages.get_mut(&scope.key()) {
            for record in rows.values_mut() {
                if record.claim.id == Some(claim_id) {
                    record.claim.expires_at = claim_expires;
                }
            }
        }
        Ok(())
    }

    async fn message_extend_claimed(
        &self,
        scope: &QueueScope,
        claim_id: u64,
        min_expires: i64,
        ttl: i64,
    ) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(rows) = state.messages.get_mut(&scope.key()) {
            for record in rows.values_mut() {
                if record.claim.id == Some(claim_id) && record.expires_at < min_expires {
                    record.expires_at = min_expires;
                    record.ttl = ttl;
                }
            }
        }
        Ok(())
    }

    async fn message_release(
        &self,
        scope: &QueueScope,
        claim_id: u64,
        now: i64,
    ) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(rows) = state.messages.get_mut(&scope.key()) {
            for record in rows.values_mut() {
                if record.claim.id == Some(claim_id) {
                    record.claim.id = None;
                    record.claim.expires_at = now;
                }
            }
        }
        Ok(())
    }

    async fn messages_claimed(
        &self,
        scope: &QueueScope,
        claim_id: u64,
        now: i64,
        limit: Option<usize>,
    ) -> StorageResult<Vec<MessageRecord>> {
        let state = self.state.read().unwrap();
        let mut held: Vec<MessageRecord> = match state.messages.get(&scope.key()) {
            Some(rows) => rows
                .values()
                .filter(|record| {
                    record.claim.id == Some(claim_id) && record.claim.expires_at > now
                })
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        held.sort_by(|a, b| a.marker.cmp(&b.marker));
        if let Some(limit) = limit {
            held.truncate(limit);
        }
        Ok(held)
    }

    async fn claim_insert(&self, record: ClaimRecord) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        state
            .claims
            .entry(record.scope.key())
            .or_default()
            .insert(record.id, record);
        Ok(())
    }

    async fn claim_get(&self, scope: &QueueScope, id: u64) -> StorageResult<Option<ClaimRecord>> {
        let state = self.state.read().unwrap();
        Ok(state
            .claims
            .get(&scope.key())
            .and_then(|claims| claims.get(&id))
            .cloned())
    }

    async fn claim_extend(
        &self,
        scope: &QueueScope,
        id: u64,
        ttl: i64,
        expires_at: i64,
        now: i64,
    ) -> StorageResult<bool> {
        let mut state = self.state.write().unwrap();
        let claim = match state
            .claims
            .get_mut(&scope.key())
            .and_then(|claims| claims.get_mut(&id))
        {
            Some(claim) => claim,
            None => return Ok(false),
        };
        if claim.expires_at <= now {
            return Ok(false);
        }
        claim.ttl = ttl;
        claim.expires_at = expires_at;
        Ok(true)
    }

    async fn claim_delete(&self, scope: &QueueScope, id: u64) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        if let Some(claims) = state.claims.get_mut(&scope.key()) {
            claims.remove(&id);
        }
        Ok(())
    }

    async fn claim_purge(&self, scope: &QueueScope) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        state.claims.remove(&scope.key());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

fn project_key(project: Option<&str>) -> String {
    project.unwrap_or("").to_string()
}

#[derive(Default)]
struct ControlState {
    pools: BTreeMap<String, PoolRecord>,
    flavors: BTreeMap<(String, String), FlavorRecord>,
    catalogue: HashMap<(String, String), CatalogEntry>,
}

/// In-memory control-plane store for pools, flavors and the catalogue.
#[derive(Default)]
pub struct MemoryControl {
    state: RwLock<ControlState>,
}

impl MemoryControl {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ControlBackend for MemoryControl {
    async fn pool_insert(&self, record: PoolRecord) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        let duplicate = state.pools.contains_key(&record.name)
            || state.pools.values().any(|pool| pool.uri == record.uri);
        if duplicate {
            return Err(StorageError::PoolAlreadyExists);
        }
        state.pools.insert(record.name.clone(), record);
        Ok(())
    }

    async fn pool_get(&self, name: &str) -> StorageResult<Option<PoolRecord>> {
        let state = self.state.read().unwrap();
        Ok(state.pools.get(name).cloned())
    }

    async fn pool_update(&self, name: &str, update: PoolUpdate) -> StorageResult<bool> {
        let mut state = self.state.write().unwrap();
        let pool = match state.pools.get_mut(name) {
            Some(pool) => pool,
            None => return Ok(false),
        };
        if let Some(uri) = update.uri {
            pool.uri = uri;
        }
        if let Some(weight) = update.weight {
            pool.weight = weight;
        }
        if let Some(group) = update.group {
            pool.group = group;
        }
        if let Some(options) = update.options {
            pool.options = options;
        }
        Ok(true)
    }

    async fn pool_delete(&self, name: &str) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        state.pools.remove(name);
        Ok(())
    }

    async fn pool_page(
        &self,
        marker: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<PoolRecord>> {
        let state = self.state.read().unwrap();
        Ok(state
            .pools
            .values()
            .filter(|pool| marker.map_or(true, |m| pool.name.as_str() > m))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn pools_in_group(&self, group: Option<&str>) -> StorageResult<Vec<PoolRecord>> {
        let state = self.state.read().unwrap();
        Ok(state
            .pools
            .values()
            .filter(|pool| pool.group.as_deref() == group)
            .cloned()
            .collect())
    }

    async fn pool_drop_all(&self) -> StorageResult<()> {
        self.state.write().unwrap().pools.clear();
        Ok(())
    }

    async fn flavor_insert(&self, record: FlavorRecord) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        let key = (project_key(record.project.as_deref()), record.name.clone());
        state.flavors.insert(key, record);
        Ok(())
    }

    async fn flavor_get(
        &self,
        name: &str,
        project: Option<&str>,
    ) -> StorageResult<Option<FlavorRecord>> {
        let state = self.state.read().unwrap();
        let key = (project_key(project), name.to_string());
        Ok(state.flavors.get(&key).cloned())
    }

    async fn flavor_update(
        &self,
        name: &str,
        project: Option<&str>,
        update: FlavorUpdate,
    ) -> StorageResult<bool> {
        let mut state = self.state.write().unwrap();
        let key = (project_key(project), name.to_string());
        let flavor = match state.flavors.get_mut(&key) {
            Some(flavor) => flavor,
            None => return Ok(false),
        };
        if let Some(pool_group) = update.pool_group {
            flavor.pool_group = pool_group;
        }
        if let Some(capabilities) = update.capabilities {
            flavor.capabilities = capabilities;
        }
        Ok(true)
    }

    async fn flavor_delete(&self, name: &str, project: Option<&str>) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        let key = (project_key(project), name.to_string());
        state.flavors.remove(&key);
        Ok(())
    }

    async fn flavor_page(
        &self,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<FlavorRecord>> {
        let state = self.state.read().unwrap();
        Ok(state
            .flavors
            .values()
            .filter(|flavor| flavor.project.as_deref() == project)
            .filter(|flavor| marker.map_or(true, |m| flavor.name.as_str() > m))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn flavors_using_group(&self, group: &str) -> StorageResult<Vec<FlavorRecord>> {
        let state = self.state.read().unwrap();
        Ok(state
            .flavors
            .values()
            .filter(|flavor| flavor.pool_group == group)
            .cloned()
            .collect())
    }

    async fn flavor_drop_all(&self) -> StorageResult<()> {
        self.state.write().unwrap().flavors.clear();
        Ok(())
    }

    async fn catalogue_insert(&self, entry: CatalogEntry) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        let key = (project_key(entry.project.as_deref()), entry.queue.clone());
        state.catalogue.insert(key, entry);
        Ok(())
    }

    async fn catalogue_get(
        &self,
        project: Option<&str>,
        queue: &str,
    ) -> StorageResult<Option<CatalogEntry>> {
        let state = self.state.read().unwrap();
        let key = (project_key(project), queue.to_string());
        Ok(state.catalogue.get(&key).cloned())
    }

    async fn catalogue_update(
        &self,
        project: Option<&str>,
        queue: &str,
        pool: &str,
    ) -> StorageResult<bool> {
        let mut state = self.state.write().unwrap();
        let key = (project_key(project), queue.to_string());
        match state.catalogue.get_mut(&key) {
            Some(entry) => {
                entry.pool = pool.to_string();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn catalogue_delete(&self, project: Option<&str>, queue: &str) -> StorageResult<()> {
        let mut state = self.state.write().unwrap();
        let key = (project_key(project), queue.to_string());
        state.catalogue.remove(&key);
        Ok(())
    }

    async fn catalogue_list(&self, project: Option<&str>) -> StorageResult<Vec<CatalogEntry>> {
        let state = self.state.read().unwrap();
        let mut entries: Vec<CatalogEntry> = state
            .catalogue
            .values()
            .filter(|entry| entry.project.as_deref() == project)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.queue.cmp(&b.queue));
        Ok(entries)
    }

    async fn catalogue_drop_all(&self) -> StorageResult<()> {
        self.state.write().unwrap().catalogue.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Connector for `mem://` URIs.
///
/// Stores are memoized per URI. Additional schemes can be registered with
/// their own capability masks, which is how tests model heterogeneous pool
/// groups without a second storage technology.
pub struct MemoryConnector {
    stores: RwLock<HashMap<String, Arc<MemoryData>>>,
    schemes: HashMap<String, &'static [Capability]>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        let mut schemes = HashMap::new();
        schemes.insert("mem".to_string(), MEMORY_CAPABILITIES);
        Self {
            stores: RwLock::new(HashMap::new()),
            schemes,
        }
    }

    pub fn with_scheme(mut self, scheme: &str, capabilities: &'static [Capability]) -> Self {
        self.schemes.insert(scheme.to_string(), capabilities);
        self
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolConnector for MemoryConnector {
    async fn connect(&self, uri: &str, _options: &Value) -> StorageResult<Arc<dyn DataBackend>> {
        let scheme = uri.split("://").next().unwrap_or_default();
        let capabilities =
            *self
                .schemes
                .get(scheme)
                .ok_or_else(|| StorageError::Connection {
                    message: format!("no driver registered for scheme '{scheme}'"),
                })?;

        if let Some(store) = self.stores.read().unwrap().get(uri) {
            return Ok(store.clone() as Arc<dyn DataBackend>);
        }

        let mut stores = self.stores.write().unwrap();
        let store = stores
            .entry(uri.to_string())
            .or_insert_with(|| Arc::new(MemoryData::with_capabilities(capabilities)))
            .clone();
        Ok(store as Arc<dyn DataBackend>)
    }
}
