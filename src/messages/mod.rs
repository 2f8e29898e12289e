//! Message Log
//!
//! Append-only, per-(project, queue) message storage with TTL expiry and
//! claim sub-state. Listing never exposes three kinds of rows: unfinalized
//! batches (still transaction-tagged), expired messages, and — unless asked
//! for — messages held by a live claim or posted by the requesting client
//! itself. The continuation marker is always the marker of the last row
//! actually emitted, so pagination resumes exactly once per page.
//!
//! Marker assignment for posting lives in [`poster`]; it is the only part
//! of the engine that retries on conflict rather than surfacing it.

mod poster;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::backend::{DataBackend, MessageFilter, MessageRecord, QueueScope};
use crate::config::{PostingConfig, RetryConfig};
use crate::core::error::{StorageError, StorageResult};
use crate::core::ids;
use crate::core::now_ts;
use crate::core::retry::{retry_on_connection, RetryPolicy};

pub const DEFAULT_MESSAGES_PER_PAGE: usize = 10;

/// A message as handed to clients. Internal row ids and markers are only
/// ever exposed through their encoded token form.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub age: i64,
    pub ttl: i64,
    pub body: Value,
    pub claim_count: u32,
    pub claim_id: Option<String>,
}

/// Producer input for one message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub ttl: i64,
    pub body: Value,
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub marker: Option<String>,
    pub limit: usize,
    /// Return the requesting client's own messages too.
    pub echo: bool,
    pub client: Option<Uuid>,
    pub include_claimed: bool,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            marker: None,
            limit: DEFAULT_MESSAGES_PER_PAGE,
            echo: false,
            client: None,
            include_claimed: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    pub next_marker: Option<String>,
}

/// Message operations for one pool.
pub struct MessageController {
    backend: Arc<dyn DataBackend>,
    posting: PostingConfig,
    retry: RetryPolicy,
    /// Strict marker uniqueness and retry-on-collision. The relaxed
    /// variant trades the ordering guarantee for never retrying.
    fifo: bool,
}

impl MessageController {
    pub fn new(
        backend: Arc<dyn DataBackend>,
        posting: &PostingConfig,
        retry: &RetryConfig,
        fifo: bool,
    ) -> Self {
        Self {
            backend,
            posting: posting.clone(),
            retry: retry.policy(),
            fifo,
        }
    }

    /// Post a batch of messages, returning their id tokens in input order.
    pub async fn post(
        &self,
        queue: &str,
        project: Option<&str>,
        messages: Vec<NewMessage>,
        client: Uuid,
    ) -> StorageResult<Vec<String>> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        let scope = QueueScope::new(queue, project);
        if self.backend.queue_get(&scope).await?.is_none() {
            return Err(queue_missing(&scope));
        }

        let backend = &*self.backend;
        let posting = &self.posting;
        let fifo = self.fifo;
        let scope_ref = &scope;
        let batch = &messages;
        let internal = retry_on_connection("message.post", &self.retry, || async move {
            if fifo {
                poster::post_fifo(backend, posting, scope_ref, batch, client).await
            } else {
                poster::post_relaxed(backend, scope_ref, batch, client).await
            }
        })
        .await?;

        Ok(internal.into_iter().map(ids::encode).collect())
    }

    pub async fn list(
        &self,
        queue: &str,
        project: Option<&str>,
        options: &ListOptions,
    ) -> StorageResult<MessagePage> {
        let scope = QueueScope::new(queue, project);

        let marker = match &options.marker {
            Some(token) => match ids::decode(token) {
                Some(marker) => Some(marker),
                // An unparseable continuation marker yields an empty page
                // rather than an error; the client simply fell off the end.
                None => return Ok(MessagePage::default()),
            },
            None => None,
        };

        let filter = MessageFilter {
            marker,
            include_claimed: options.include_claimed,
            echo: options.echo,
            client: options.client,
            newest_first: false,
        };

        let now = now_ts();
        let page = retry_on_connection("message.list", &self.retry, || {
            self.backend.message_page(&scope, &filter, options.limit, now)
        })
        .await?;

        let next_marker = page.last().map(|record| ids::encode(record.marker));
        Ok(MessagePage {
            messages: page.iter().map(|record| api_message(record, now)).collect(),
            next_marker,
        })
    }

    /// The oldest (or newest) message in the queue, claimed or not.
    pub async fn first(
        &self,
        queue: &str,
        project: Option<&str>,
        newest_first: bool,
    ) -> StorageResult<Message> {
        let scope = QueueScope::new(queue, project);
        let filter = MessageFilter {
            include_claimed: true,
            echo: true,
            newest_first,
            ..MessageFilter::default()
        };

        let now = now_ts();
        let page = retry_on_connection("message.first", &self.retry, || {
            self.backend.message_page(&scope, &filter, 1, now)
        })
        .await?;

        page.first()
            .map(|record| api_message(record, now))
            .ok_or_else(|| StorageError::QueueIsEmpty {
                name: scope.queue.clone(),
                project: scope.project.clone(),
            })
    }

    pub async fn get(
        &self,
        queue: &str,
        project: Option<&str>,
        message_id: &str,
    ) -> StorageResult<Message> {
        let scope = QueueScope::new(queue, project);
        let id = ids::decode(message_id)
            .ok_or_else(|| message_missing(message_id, &scope))?;

        let now = now_ts();
        let record = retry_on_connection("message.get", &self.retry, || {
            self.backend.message_get(&scope, id, now)
        })
        .await?;

        record
            .map(|record| api_message(&record, now))
            .ok_or_else(|| message_missing(message_id, &scope))
    }

    /// Fetch several messages by id. Malformed and absent ids are skipped.
    pub async fn bulk_get(
        &self,
        queue: &str,
        project: Option<&str>,
        message_ids: &[String],
    ) -> StorageResult<Vec<Message>> {
        let scope = QueueScope::new(queue, project);
        let internal: Vec<u64> = message_ids
            .iter()
            .filter_map(|token| ids::decode(token))
            .collect();
        if internal.is_empty() {
            return Ok(Vec::new());
        }

        let now = now_ts();
        let found = retry_on_connection("message.bulk_get", &self.retry, || {
            self.backend.message_get_many(&scope, &internal, now)
        })
        .await?;

        Ok(found.iter().map(|record| api_message(record, now)).collect())
    }

    /// Delete one message, enforcing the claim-authorization rule.
    ///
    /// Without a claim token, deleting a message held by a live claim is
    /// refused. With a token, the message must be held by exactly that
    /// claim; a worker whose claim expired mid-processing is told so
    /// instead of silently deleting work that now belongs to someone else.
    /// Malformed and absent message ids succeed silently.
    pub async fn delete(
        &self,
        queue: &str,
        project: Option<&str>,
        message_id: &str,
        claim: Option<&str>,
    ) -> StorageResult<()> {
        let scope = QueueScope::new(queue, project);
        let id = match ids::decode(message_id) {
            Some(id) => id,
            None => return Ok(()),
        };

        let now = now_ts();
        let record = match retry_on_connection("message.delete", &self.retry, || {
            self.backend.message_get(&scope, id, now)
        })
        .await?
        {
            Some(record) => record,
            None => return Ok(()),
        };

        match claim {
            None => {
                if record.is_claimed(now) {
                    return Err(StorageError::MessageIsClaimed {
                        id: message_id.to_string(),
                    });
                }
            }
            Some(token) => {
                let claim_id = ids::decode(token).ok_or_else(|| claim_missing(token, &scope))?;
                if record.claim.id != Some(claim_id) {
                    if record.is_claimed(now) {
                        return Err(StorageError::MessageNotClaimedBy {
                            id: message_id.to_string(),
                            claim: token.to_string(),
                        });
                    }
                    return Err(StorageError::MessageNotClaimed {
                        id: message_id.to_string(),
                    });
                }
            }
        }

        self.backend.message_delete(&scope, id).await
    }

    /// Delete several messages. When `claim_ids` is given, every listed
    /// claim must actually hold at least one of the messages.
    pub async fn bulk_delete(
        &self,
        queue: &str,
        project: Option<&str>,
        message_ids: &[String],
        claim_ids: Option<&[String]>,
    ) -> StorageResult<()> {
        let scope = QueueScope::new(queue, project);
        let internal: Vec<u64> = message_ids
            .iter()
            .filter_map(|token| ids::decode(token))
            .collect();

        if let Some(claim_tokens) = claim_ids {
            let now = now_ts();
            let records = self
                .backend
                .message_get_many(&scope, &internal, now)
                .await?;
            let held: Vec<u64> = records.iter().filter_map(|record| record.claim.id).collect();

            for token in claim_tokens {
                let claim_id = ids::decode(token).ok_or_else(|| claim_missing(token, &scope))?;
                if !held.contains(&claim_id) {
                    return Err(claim_missing(token, &scope));
                }
            }
        }

        self.backend.message_delete_many(&scope, &internal).await
    }

    /// Atomically remove and return up to `limit` free messages,
    /// oldest-first.
    pub async fn pop(
        &self,
        queue: &str,
        project: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        let scope = QueueScope::new(queue, project);
        let now = now_ts();
        let popped = self.backend.message_pop_free(&scope, limit, now).await?;
        Ok(popped.iter().map(|record| api_message(record, now)).collect())
    }

}

/// Client-facing rendering of a stored message.
pub(crate) fn api_message(record: &MessageRecord, now: i64) -> Message {
    Message {
        id: ids::encode(record.id),
        age: now - record.created_at,
        ttl: record.ttl,
        body: record.body.clone(),
        claim_count: record.claim.count,
        claim_id: record.claim.id.map(ids::encode),
    }
}

fn queue_missing(scope: &QueueScope) -> StorageError {
    StorageError::QueueDoesNotExist {
        name: scope.queue.clone(),
        project: scope.project.clone(),
    }
}

fn message_missing(id: &str, scope: &QueueScope) -> StorageError {
    StorageError::MessageDoesNotExist {
        id: id.to_string(),
        queue: scope.queue.clone(),
        project: scope.project.clone(),
    }
}

fn claim_missing(id: &str, scope: &QueueScope) -> StorageError {
    StorageError::ClaimDoesNotExist {
        id: id.to_string(),
        queue: scope.queue.clone(),
        project: scope.project.clone(),
    }
}
