//! Queue Registry
//!
//! CRUD over queue metadata and the per-queue marker counter, scoped to one
//! pool's backend. The counter is seeded here and never reset afterwards:
//! resetting it would reuse markers and make messages invisible to
//! observers paging with an older continuation marker.

use std::sync::Arc;

use serde_json::Value;

use crate::backend::{Counter, DataBackend, MessageFilter, QueueRecord, QueueScope};
use crate::config::{RegistryConfig, RetryConfig};
use crate::core::error::{StorageError, StorageResult};
use crate::core::ids;
use crate::core::now_ts;
use crate::core::cache::TtlCache;
use crate::core::retry::{retry_on_connection, RetryPolicy};

/// One row of a queue listing.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub name: String,
    /// Present only for detailed listings.
    pub metadata: Option<Value>,
}

/// Marker snapshot of a queue's oldest or newest message.
#[derive(Debug, Clone)]
pub struct MessageStat {
    pub id: String,
    pub created_at: i64,
    pub age: i64,
}

#[derive(Debug, Clone)]
pub struct QueueStats {
    pub free: usize,
    pub claimed: usize,
    pub total: usize,
    pub oldest: Option<MessageStat>,
    pub newest: Option<MessageStat>,
}

/// Queue metadata and counter operations for one pool.
pub struct QueueRegistry {
    backend: Arc<dyn DataBackend>,
    /// Positive-only existence cache. A missing queue is never cached so a
    /// freshly created one is immediately visible.
    exists_cache: TtlCache<String, bool>,
    retry: RetryPolicy,
}

impl QueueRegistry {
    pub fn new(
        backend: Arc<dyn DataBackend>,
        registry: &RegistryConfig,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            backend,
            exists_cache: TtlCache::new(registry.exists_cache_ttl()),
            retry: retry.policy(),
        }
    }

    /// Create the queue, seeding its counter. Returns `false` without
    /// touching stored metadata when the (project, name) pair already
    /// exists, which makes ensure-then-post producers idempotent.
    ///
    /// Deliberately not retried on connection loss: a retry after a
    /// half-acknowledged insert would misreport an honest creation as
    /// `false`.
    pub async fn create(
        &self,
        queue: &str,
        project: Option<&str>,
        metadata: Value,
    ) -> StorageResult<bool> {
        let record = QueueRecord {
            scope: QueueScope::new(queue, project),
            metadata,
            counter: Counter {
                value: 1,
                updated_at: 0,
            },
        };
        self.backend.queue_insert(record).await
    }

    pub async fn get_metadata(&self, queue: &str, project: Option<&str>) -> StorageResult<Value> {
        let scope = QueueScope::new(queue, project);
        let record = retry_on_connection("queue.get_metadata", &self.retry, || {
            self.backend.queue_get(&scope)
        })
        .await?;

        record
            .map(|record| record.metadata)
            .ok_or_else(|| missing(&scope))
    }

    pub async fn set_metadata(
        &self,
        queue: &str,
        project: Option<&str>,
        metadata: Value,
    ) -> StorageResult<()> {
        let scope = QueueScope::new(queue, project);
        let updated = retry_on_connection("queue.set_metadata", &self.retry, || {
            self.backend.queue_set_metadata(&scope, metadata.clone())
        })
        .await?;

        if updated {
            Ok(())
        } else {
            Err(missing(&scope))
        }
    }

    pub async fn exists(&self, queue: &str, project: Option<&str>) -> StorageResult<bool> {
        let scope = QueueScope::new(queue, project);
        let key = scope.key();
        if self.exists_cache.get(&key).is_some() {
            return Ok(true);
        }

        let found = retry_on_connection("queue.exists", &self.retry, || {
            self.backend.queue_get(&scope)
        })
        .await?
        .is_some();

        if found {
            self.exists_cache.put(key, true);
        }
        Ok(found)
    }

    /// Delete the queue and everything it owns. The backend has no
    /// cascading constraints, so messages and claims are removed in
    /// explicit secondary passes before the queue row itself.
    pub async fn delete(&self, queue: &str, project: Option<&str>) -> StorageResult<()> {
        let scope = QueueScope::new(queue, project);
        self.backend.message_purge(&scope).await?;
        self.backend.claim_purge(&scope).await?;
        self.backend.queue_delete(&scope).await?;
        self.exists_cache.purge(&scope.key());
        Ok(())
    }

    /// Remove all messages and claims but keep the queue and its counter.
    pub async fn purge(&self, queue: &str, project: Option<&str>) -> StorageResult<()> {
        let scope = QueueScope::new(queue, project);
        self.backend.message_purge(&scope).await?;
        self.backend.claim_purge(&scope).await?;
        Ok(())
    }

    /// Name-ordered listing with a continuation marker (the last name
    /// emitted).
    pub async fn list(
        &self,
        project: Option<&str>,
        marker: Option<&str>,
        limit: usize,
        detailed: bool,
    ) -> StorageResult<(Vec<QueueInfo>, Option<String>)> {
        let page = retry_on_connection("queue.list", &self.retry, || {
            self.backend.queue_page(project, marker, limit)
        })
        .await?;

        let next_marker = page.last().map(|record| record.scope.queue.clone());
        let queues = page
            .into_iter()
            .map(|record| QueueInfo {
                name: record.scope.queue,
                metadata: detailed.then_some(record.metadata),
            })
            .collect();
        Ok((queues, next_marker))
    }

    pub async fn stats(&self, queue: &str, project: Option<&str>) -> StorageResult<QueueStats> {
        let scope = QueueScope::new(queue, project);
        if !self.exists(queue, project).await? {
            return Err(missing(&scope));
        }

        let now = now_ts();
        let free = self.backend.message_count(&scope, false, now).await?;
        let total = self.backend.message_count(&scope, true, now).await?;

        let mut stats = QueueStats {
            free,
            claimed: total - free,
            total,
            oldest: None,
            newest: None,
        };

        if total > 0 {
            let all = MessageFilter {
                include_claimed: true,
                echo: true,
                ..MessageFilter::default()
            };
            let oldest = self.backend.message_page(&scope, &all, 1, now).await?;
            let newest_filter = MessageFilter {
                newest_first: true,
                ..all
            };
            let newest = self
                .backend
                .message_page(&scope, &newest_filter, 1, now)
                .await?;

            stats.oldest = oldest.first().map(|record| stat_of(record, now));
            stats.newest = newest.first().map(|record| stat_of(record, now));
        }

        Ok(stats)
    }

}

fn stat_of(record: &crate::backend::MessageRecord, now: i64) -> MessageStat {
    MessageStat {
        id: ids::encode(record.id),
        created_at: record.created_at,
        age: now - record.created_at,
    }
}

fn missing(scope: &QueueScope) -> StorageError {
    StorageError::QueueDoesNotExist {
        name: scope.queue.clone(),
        project: scope.project.clone(),
    }
}
