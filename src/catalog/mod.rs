//! Pool Catalog
//!
//! The routing layer between "a (project, queue) pair" and "the storage
//! pool that actually holds it". `Catalog` owns the mapping: `register`
//! picks a pool by weighted random selection among the flavor's group (or
//! the ungrouped pools), `lookup` resolves and caches the mapping, and
//! `deregister` removes it — catalogue first, cache second, so a
//! concurrent lookup can never revive an entry that is already gone from
//! the source of truth without itself being about to expire.
//!
//! Each mapped pool gets one lazily built [`PoolDriver`]: the queue
//! registry, message controller and claim engine bound to that pool's
//! connection. Drivers are memoized per pool so repeated lookups do not
//! re-establish connections.

mod catalogue;
mod flavors;
mod pools;
mod router;
mod select;

#[cfg(test)]
mod tests;

pub use catalogue::CatalogueController;
pub use flavors::FlavorsController;
pub use pools::PoolsController;
pub use router::{ClaimRouter, MessageRouter, QueueRouter};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::backend::{
    Capability, ControlBackend, DataBackend, PoolConnector, QueueScope,
};
use crate::claims::ClaimEngine;
use crate::config::EngineConfig;
use crate::core::cache::TtlCache;
use crate::core::error::{StorageError, StorageResult};
use crate::core::now_ts;
use crate::messages::MessageController;
use crate::queues::QueueRegistry;

/// The full controller stack bound to one pool's backend.
pub struct PoolDriver {
    backend: Arc<dyn DataBackend>,
    pub queues: QueueRegistry,
    pub messages: MessageController,
    pub claims: ClaimEngine,
}

impl std::fmt::Debug for PoolDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolDriver").finish_non_exhaustive()
    }
}

impl PoolDriver {
    fn new(backend: Arc<dyn DataBackend>, config: &EngineConfig, fifo: bool) -> Self {
        Self {
            queues: QueueRegistry::new(backend.clone(), &config.registry, &config.retry),
            messages: MessageController::new(
                backend.clone(),
                &config.posting,
                &config.retry,
                fifo,
            ),
            claims: ClaimEngine::new(backend.clone(), &config.retry),
            backend,
        }
    }

    pub fn capabilities(&self) -> &'static [Capability] {
        self.backend.capabilities()
    }

    pub async fn is_alive(&self) -> bool {
        self.backend.is_alive().await
    }

    pub async fn gc(&self) -> StorageResult<usize> {
        self.backend.gc(now_ts()).await
    }
}

/// The (project, queue) -> pool mapping plus the driver cache.
pub struct Catalog {
    pools: PoolsController,
    flavors: FlavorsController,
    catalogue: CatalogueController,
    connector: Arc<dyn PoolConnector>,
    /// scope key -> pool name; staleness bounded by the configured TTL.
    lookup_cache: TtlCache<String, String>,
    /// pool name (or raw URI for the virtual pool) -> driver.
    drivers: RwLock<HashMap<String, Arc<PoolDriver>>>,
    config: EngineConfig,
}

impl Catalog {
    pub fn new(
        control: Arc<dyn ControlBackend>,
        connector: Arc<dyn PoolConnector>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pools: PoolsController::new(control.clone(), connector.clone()),
            flavors: FlavorsController::new(control.clone()),
            catalogue: CatalogueController::new(control),
            connector,
            lookup_cache: TtlCache::new(config.catalog.lookup_cache_ttl()),
            drivers: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn pools(&self) -> &PoolsController {
        &self.pools
    }

    pub fn flavors(&self) -> &FlavorsController {
        &self.flavors
    }

    pub fn catalogue(&self) -> &CatalogueController {
        &self.catalogue
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Map a new queue to a pool. No-op when the queue is already mapped.
    ///
    /// Candidates come from the flavor's pool group when a flavor is
    /// given, otherwise from the ungrouped pools; one is picked by
    /// weighted random selection.
    pub async fn register(
        &self,
        queue: &str,
        project: Option<&str>,
        flavor: Option<&str>,
    ) -> StorageResult<()> {
        if self.catalogue.exists(project, queue).await? {
            return Ok(());
        }

        let candidates = match flavor {
            Some(flavor) => {
                let flavor = self.flavors.get(flavor, project).await?;
                self.pools_in_group(Some(&flavor.pool_group)).await?
            }
            None => self.pools_in_group(None).await?,
        };

        let pool = match select::weighted(&candidates) {
            Some(pool) => pool.name.clone(),
            None => {
                // With virtual pooling the queue is served by the default
                // pool without ever being registered in the catalogue.
                if self.virtual_pool_uri().is_some() {
                    return Ok(());
                }
                return Err(StorageError::NoPoolFound);
            }
        };

        log::info!(
            "register queue: project:{} queue:{} pool:{}",
            project.unwrap_or("<global>"),
            queue,
            pool
        );
        self.catalogue.insert(project, queue, &pool).await
    }

    /// Resolve the pool name for a queue, consulting the lookup cache.
    /// Unmapped queues resolve to `None` (the virtual pool, if enabled, is
    /// applied by `lookup`, not recorded here).
    pub async fn lookup_pool(
        &self,
        queue: &str,
        project: Option<&str>,
    ) -> StorageResult<Option<String>> {
        let key = QueueScope::new(queue, project).key();
        if let Some(pool) = self.lookup_cache.get(&key) {
            return Ok(Some(pool));
        }

        match self.catalogue.get(project, queue).await {
            Ok(entry) => {
                self.lookup_cache.put(key, entry.pool.clone());
                Ok(Some(entry.pool))
            }
            Err(error) if error.is_does_not_exist() => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// Resolve the driver serving a queue, falling back to the virtual
    /// pool when enabled.
    pub async fn lookup(
        &self,
        queue: &str,
        project: Option<&str>,
    ) -> StorageResult<Option<Arc<PoolDriver>>> {
        match self.lookup_pool(queue, project).await? {
            Some(pool) => Ok(Some(self.get_driver(&pool).await?)),
            None => match self.virtual_pool_uri() {
                Some(uri) => {
                    log::debug!(
                        "queue {} not mapped; using the virtual default pool",
                        queue
                    );
                    Ok(Some(self.driver_for_uri(&uri, &Value::Null).await?))
                }
                None => Ok(None),
            },
        }
    }

    /// Remove a queue's mapping. The catalogue entry goes first and the
    /// cache entry second; the reverse order could hand out a cache hit
    /// for a mapping that no longer exists anywhere.
    pub async fn deregister(&self, queue: &str, project: Option<&str>) -> StorageResult<()> {
        self.catalogue.delete(project, queue).await?;
        let key = QueueScope::new(queue, project).key();
        self.lookup_cache.purge(&key);
        Ok(())
    }

    /// Memoized driver construction per pool.
    pub async fn get_driver(&self, pool: &str) -> StorageResult<Arc<PoolDriver>> {
        if let Some(driver) = self.drivers.read().unwrap().get(pool) {
            return Ok(driver.clone());
        }

        let record = self.pools.get(pool, true).await?;
        let driver = self.build_driver(&record.uri, &record.options).await?;

        let mut drivers = self.drivers.write().unwrap();
        Ok(drivers
            .entry(pool.to_string())
            .or_insert(driver)
            .clone())
    }

    async fn driver_for_uri(&self, uri: &str, options: &Value) -> StorageResult<Arc<PoolDriver>> {
        if let Some(driver) = self.drivers.read().unwrap().get(uri) {
            return Ok(driver.clone());
        }

        let driver = self.build_driver(uri, options).await?;
        let mut drivers = self.drivers.write().unwrap();
        Ok(drivers.entry(uri.to_string()).or_insert(driver).clone())
    }

    async fn build_driver(&self, uri: &str, options: &Value) -> StorageResult<Arc<PoolDriver>> {
        let backend = self.connector.connect(uri, options).await?;

        // Strict ordering is on whenever the driver can support it; pool
        // options may opt a pool out to trade ordering for throughput.
        let fifo = backend.capabilities().contains(&Capability::Fifo)
            && options
                .get("fifo")
                .and_then(Value::as_bool)
                .unwrap_or(true);

        Ok(Arc::new(PoolDriver::new(backend, &self.config, fifo)))
    }

    async fn pools_in_group(
        &self,
        group: Option<&str>,
    ) -> StorageResult<Vec<crate::backend::PoolRecord>> {
        // Listing through the admin controller would strip options; the
        // selection needs full records, so go through detailed listing.
        let all = self.pools.list(None, usize::MAX, true).await?;
        Ok(all
            .into_iter()
            .filter(|pool| pool.group.as_deref() == group)
            .collect())
    }

    fn virtual_pool_uri(&self) -> Option<String> {
        if self.config.catalog.enable_virtual_pool {
            self.config.catalog.default_pool_uri.clone()
        } else {
            None
        }
    }
}
