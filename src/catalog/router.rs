//! Routing controllers
//!
//! The transport-facing surface: each operation resolves the pool for its
//! (project, queue) through the catalog, then delegates to that pool's
//! driver. A queue whose pool cannot be resolved degrades the way a
//! missing resource does — reads report does-not-exist, listings come back
//! empty, idempotent deletes succeed silently.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::claims::Claim;
use crate::core::error::{StorageError, StorageResult};
use crate::messages::{ListOptions, Message, MessagePage, NewMessage};
use crate::queues::{QueueInfo, QueueStats};

use super::{Catalog, PoolDriver};

/// Metadata key a queue may use to request a flavor at creation time.
const META_FLAVOR: &str = "_flavor";

pub struct QueueRouter {
    catalog: Arc<Catalog>,
}

impl QueueRouter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    /// Create a queue: map it to a pool first, then create the record in
    /// that pool.
    pub async fn create(
        &self,
        queue: &str,
        project: Option<&str>,
        metadata: Value,
    ) -> StorageResult<bool> {
        let flavor = metadata.get(META_FLAVOR).and_then(Value::as_str);
        self.catalog.register(queue, project, flavor).await?;

        let driver = self
            .catalog
            .lookup(queue, project)
            .await?
            .ok_or(StorageError::NoPoolFound)?;
        driver.queues.create(queue, project, metadata).await
    }

    pub async fn get_metadata(&self, queue: &str, project: Option<&str>) -> StorageResult<Value> {
        let driver = self.require_driver(queue, project).await?;
        driver.queues.get_metadata(queue, project).await
    }

    /// Replace the metadata document. The queue is re-registered first so
    /// a queue created before any pools existed can still pick one up.
    pub async fn set_metadata(
        &self,
        queue: &str,
        project: Option<&str>,
        metadata: Value,
    ) -> StorageResult<()> {
        let flavor = metadata.get(META_FLAVOR).and_then(Value::as_str);
        self.catalog.register(queue, project, flavor).await?;

        let driver = self.require_driver(queue, project).await?;
        driver.queues.set_metadata(queue, project, metadata).await
    }

    pub async fn exists(&self, queue: &str, project: Option<&str>) -> StorageResult<bool> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => driver.queues.exists(queue, project).await,
            None => Ok(false),
        }
    }

    /// Delete the queue everywhere. The catalogue entry is removed before
    /// the pool data: if the process dies in between, the queue reads as
    /// absent and a later create simply re-registers it, whereas the
    /// reverse order would leave a mapping pointing at nothing.
    pub async fn delete(&self, queue: &str, project: Option<&str>) -> StorageResult<()> {
        if let Some(driver) = self.catalog.lookup(queue, project).await? {
            self.catalog.deregister(queue, project).await?;
            driver.queues.delete(queue, project).await?;
        }
        Ok(())
    }

    pub async fn stats(&self, queue: &str, project: Option<&str>) -> StorageResult<QueueStats> {
        let driver = self.require_driver(queue, project).await?;
        driver.queues.stats(queue, project).await
    }

    pub async fn purge(&self, queue: &str, project: Option<&str>) -> StorageResult<()> {
        if let Some(driver) = self.catalog.lookup(queue, project).await? {
            driver.queues.purge(queue, project).await?;
        }
        Ok(())
    }

    /// Project-wide listing merged across every pool, name-ordered.
    pub async fn list(
        &self,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
        detailed: bool,
    ) -> StorageResult<(Vec<QueueInfo>, Option<String>)> {
        let pools = self.catalog.pools().list(None, usize::MAX, false).await?;

        let mut merged: Vec<QueueInfo> = Vec::new();
        for pool in &pools {
            let driver = self.catalog.get_driver(&pool.name).await?;
            let (page, _) = driver
                .queues
                .list(project, marker, limit, detailed)
                .await?;
            merged.extend(page);
        }

        merged.sort_by(|a, b| a.name.cmp(&b.name));
        merged.truncate(limit);
        let next_marker = merged.last().map(|queue| queue.name.clone());
        Ok((merged, next_marker))
    }

    async fn require_driver(
        &self,
        queue: &str,
        project: Option<&str>,
    ) -> StorageResult<Arc<PoolDriver>> {
        self.catalog
            .lookup(queue, project)
            .await?
            .ok_or_else(|| queue_missing(queue, project))
    }
}

pub struct MessageRouter {
    catalog: Arc<Catalog>,
}

impl MessageRouter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub async fn post(
        &self,
        queue: &str,
        project: Option<&str>,
        messages: Vec<NewMessage>,
        client: Uuid,
    ) -> StorageResult<Vec<String>> {
        let driver = self
            .catalog
            .lookup(queue, project)
            .await?
            .ok_or_else(|| queue_missing(queue, project))?;
        driver.messages.post(queue, project, messages, client).await
    }

    pub async fn list(
        &self,
        queue: &str,
        project: Option<&str>,
        options: &ListOptions,
    ) -> StorageResult<MessagePage> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => driver.messages.list(queue, project, options).await,
            None => Ok(MessagePage::default()),
        }
    }

    pub async fn first(
        &self,
        queue: &str,
        project: Option<&str>,
        newest_first: bool,
    ) -> StorageResult<Message> {
        let driver = self
            .catalog
            .lookup(queue, project)
            .await?
            .ok_or_else(|| queue_missing(queue, project))?;
        driver.messages.first(queue, project, newest_first).await
    }

    pub async fn get(
        &self,
        queue: &str,
        project: Option<&str>,
        message_id: &str,
    ) -> StorageResult<Message> {
        let driver = self
            .catalog
            .lookup(queue, project)
            .await?
            .ok_or_else(|| queue_missing(queue, project))?;
        driver.messages.get(queue, project, message_id).await
    }

    pub async fn bulk_get(
        &self,
        queue: &str,
        project: Option<&str>,
        message_ids: &[String],
    ) -> StorageResult<Vec<Message>> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => driver.messages.bulk_get(queue, project, message_ids).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn delete(
        &self,
        queue: &str,
        project: Option<&str>,
        message_id: &str,
        claim: Option<&str>,
    ) -> StorageResult<()> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => {
                driver
                    .messages
                    .delete(queue, project, message_id, claim)
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn bulk_delete(
        &self,
        queue: &str,
        project: Option<&str>,
        message_ids: &[String],
        claim_ids: Option<&[String]>,
    ) -> StorageResult<()> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => {
                driver
                    .messages
                    .bulk_delete(queue, project, message_ids, claim_ids)
                    .await
            }
            None => Ok(()),
        }
    }

    pub async fn pop(
        &self,
        queue: &str,
        project: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => driver.messages.pop(queue, project, limit).await,
            None => Ok(Vec::new()),
        }
    }
}

pub struct ClaimRouter {
    catalog: Arc<Catalog>,
}

impl ClaimRouter {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self { catalog }
    }

    pub async fn create(
        &self,
        queue: &str,
        project: Option<&str>,
        ttl: i64,
        grace: i64,
        limit: usize,
    ) -> StorageResult<(Option<String>, Vec<Message>)> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => driver.claims.create(queue, project, ttl, grace, limit).await,
            None => Ok((None, Vec::new())),
        }
    }

    pub async fn get(
        &self,
        queue: &str,
        project: Option<&str>,
        claim_id: &str,
    ) -> StorageResult<(Claim, Vec<Message>)> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => driver.claims.get(queue, project, claim_id).await,
            None => Err(claim_missing(claim_id, queue, project)),
        }
    }

    pub async fn update(
        &self,
        queue: &str,
        project: Option<&str>,
        claim_id: &str,
        ttl: i64,
        grace: i64,
    ) -> StorageResult<()> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => {
                driver
                    .claims
                    .update(queue, project, claim_id, ttl, grace)
                    .await
            }
            None => Err(claim_missing(claim_id, queue, project)),
        }
    }

    pub async fn delete(
        &self,
        queue: &str,
        project: Option<&str>,
        claim_id: &str,
    ) -> StorageResult<()> {
        match self.catalog.lookup(queue, project).await? {
            Some(driver) => driver.claims.delete(queue, project, claim_id).await,
            None => Ok(()),
        }
    }
}

fn queue_missing(queue: &str, project: Option<&str>) -> StorageError {
    StorageError::QueueDoesNotExist {
        name: queue.to_string(),
        project: project.map(str::to_string),
    }
}

fn claim_missing(claim_id: &str, queue: &str, project: Option<&str>) -> StorageError {
    StorageError::ClaimDoesNotExist {
        id: claim_id.to_string(),
        queue: queue.to_string(),
        project: project.map(str::to_string),
    }
}
