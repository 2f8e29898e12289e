//! Engine assembly
//!
//! Wires a control backend, a pool connector and the configuration into
//! the transport-facing controller set. This is the type an embedding
//! service constructs once at startup and shares across request handlers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use postbox::backend::{MemoryConnector, MemoryControl};
//! use postbox::config::EngineConfig;
//! use postbox::Engine;
//!
//! # async fn example() -> postbox::StorageResult<()> {
//! let engine = Engine::new(
//!     Arc::new(MemoryControl::new()),
//!     Arc::new(MemoryConnector::new()),
//!     EngineConfig::default(),
//! );
//!
//! engine
//!     .catalog()
//!     .pools()
//!     .create("alpha", 1, "mem://alpha", None, serde_json::json!({}))
//!     .await?;
//! engine
//!     .queues
//!     .create("orders", Some("acme"), serde_json::json!({}))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::backend::{ControlBackend, PoolConnector};
use crate::catalog::{Catalog, ClaimRouter, MessageRouter, QueueRouter};
use crate::config::EngineConfig;
use crate::core::error::StorageResult;

pub struct Engine {
    catalog: Arc<Catalog>,
    pub queues: QueueRouter,
    pub messages: MessageRouter,
    pub claims: ClaimRouter,
}

impl Engine {
    pub fn new(
        control: Arc<dyn ControlBackend>,
        connector: Arc<dyn PoolConnector>,
        config: EngineConfig,
    ) -> Self {
        let catalog = Arc::new(Catalog::new(control, connector, config));
        Self {
            queues: QueueRouter::new(catalog.clone()),
            messages: MessageRouter::new(catalog.clone()),
            claims: ClaimRouter::new(catalog.clone()),
            catalog,
        }
    }

    /// The routing layer and its admin surfaces (pools, flavors,
    /// catalogue).
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Whether every registered pool answers.
    pub async fn is_alive(&self) -> StorageResult<bool> {
        let pools = self.catalog.pools().list(None, usize::MAX, false).await?;
        for pool in pools {
            let driver = self.catalog.get_driver(&pool.name).await?;
            if !driver.is_alive().await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Sweep expired messages and claims across every registered pool.
    /// Complements the lazy expiry filters on backends without native TTL
    /// collection. Returns the number of rows collected.
    pub async fn gc(&self) -> StorageResult<usize> {
        let pools = self.catalog.pools().list(None, usize::MAX, false).await?;

        let mut collected = 0;
        for pool in pools {
            let driver = self.catalog.get_driver(&pool.name).await?;
            collected += driver.gc().await?;
        }
        Ok(collected)
    }
}
