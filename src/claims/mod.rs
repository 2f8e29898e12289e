//! Claim Engine
//!
//! A claim is a time-bounded exclusive reservation over a set of messages.
//! Creation is a two-phase select-then-capture: candidates are read first,
//! then each one is stamped with a conditional write that re-checks the
//! free predicate at write time. Under contention some candidates will have
//! been captured by a parallel claim in between; they simply drop out of
//! the result, which is correct because the limit is "up to N", not
//! "exactly N". There is no half-claimed state and no retry.
//!
//! Expiry is lazy: a claim whose deadline passed behaves as already gone,
//! whether or not a sweep has removed the row yet.


use std::sync::Arc;

use serde_json::Value;

use crate::backend::{ClaimRecord, CounterIncr, DataBackend, MessageFilter, QueueScope};
use crate::config::RetryConfig;
use crate::core::error::{StorageError, StorageResult};
use crate::core::ids;
use crate::core::now_ts;
use crate::core::retry::{retry_on_connection, RetryPolicy};
use crate::messages::{api_message, Message};

pub const DEFAULT_MESSAGES_PER_CLAIM: usize = 10;

/// Queue metadata keys that drive the dead-letter policy.
const META_MAX_CLAIM_COUNT: &str = "_max_claim_count";
const META_DEAD_LETTER_QUEUE: &str = "_dead_letter_queue";
const META_DEAD_LETTER_TTL: &str = "_dead_letter_queue_messages_ttl";

/// Claim metadata as handed to clients.
#[derive(Debug, Clone)]
pub struct Claim {
    pub id: String,
    pub ttl: i64,
    pub age: i64,
    pub expires_at: i64,
    pub message_count: usize,
}

/// Claim operations for one pool.
pub struct ClaimEngine {
    backend: Arc<dyn DataBackend>,
    retry: RetryPolicy,
}

impl ClaimEngine {
    pub fn new(backend: Arc<dyn DataBackend>, retry: &RetryConfig) -> Self {
        Self {
            backend,
            retry: retry.policy(),
        }
    }

    /// Claim up to `limit` free messages, oldest first.
    ///
    /// Returns `(None, [])` both when the queue has no free messages and
    /// when the queue does not exist; only posting distinguishes a missing
    /// queue. Captured messages have their own expiry pushed past the
    /// claim's deadline plus the grace window, so they cannot evaporate
    /// while held or immediately after release.
    pub async fn create(
        &self,
        queue: &str,
        project: Option<&str>,
        ttl: i64,
        grace: i64,
        limit: usize,
    ) -> StorageResult<(Option<String>, Vec<Message>)> {
        let scope = QueueScope::new(queue, project);

        let queue_record = match self.backend.queue_get(&scope).await? {
            Some(record) => record,
            None => return Ok((None, Vec::new())),
        };

        let now = now_ts();
        let claim_expires = now + ttl;
        let message_expires = claim_expires + grace;
        let message_ttl = ttl + grace;

        // Candidate selection: free, finalized, unexpired, oldest first.
        let filter = MessageFilter {
            include_claimed: false,
            echo: true,
            ..MessageFilter::default()
        };
        let candidates = self
            .backend
            .message_page(&scope, &filter, limit, now)
            .await?;
        if candidates.is_empty() {
            return Ok((None, Vec::new()));
        }

        let candidate_ids: Vec<u64> = candidates.iter().map(|record| record.id).collect();
        let claim_id: u64 = rand::random();

        let captured = self
            .backend
            .message_capture(&scope, &candidate_ids, claim_id, claim_expires, now)
            .await?;
        if captured.is_empty() {
            // Every candidate was grabbed by parallel claims between the
            // read and the conditional write.
            return Ok((None, Vec::new()));
        }

        self.backend
            .message_extend_claimed(&scope, claim_id, message_expires, message_ttl)
            .await?;

        let moved = self
            .apply_dead_letter_policy(&scope, &queue_record.metadata, claim_id, now)
            .await?;

        let message_count = captured.len() - moved;
        if message_count == 0 {
            // Everything captured had exhausted its claim budget and went
            // to the dead-letter queue; there is nothing left to own.
            return Ok((None, Vec::new()));
        }

        self.backend
            .claim_insert(ClaimRecord {
                id: claim_id,
                scope: scope.clone(),
                ttl,
                expires_at: claim_expires,
                message_count,
            })
            .await?;

        let held = self
            .backend
            .messages_claimed(&scope, claim_id, now, None)
            .await?;
        let messages = held.iter().map(|record| api_message(record, now)).collect();

        Ok((Some(ids::encode(claim_id)), messages))
    }

    /// Fetch claim metadata and the messages it currently holds.
    pub async fn get(
        &self,
        queue: &str,
        project: Option<&str>,
        claim_id: &str,
    ) -> StorageResult<(Claim, Vec<Message>)> {
        let scope = QueueScope::new(queue, project);
        let id = ids::decode(claim_id).ok_or_else(|| claim_missing(claim_id, &scope))?;

        let now = now_ts();
        let record = retry_on_connection("claim.get", &self.retry, || {
            self.backend.claim_get(&scope, id)
        })
        .await?
        // An expired-but-not-yet-swept claim is treated as already gone.
        .filter(|record| record.expires_at > now)
        .ok_or_else(|| claim_missing(claim_id, &scope))?;

        let held = self
            .backend
            .messages_claimed(&scope, id, now, None)
            .await?;

        let claim = Claim {
            id: claim_id.to_string(),
            ttl: record.ttl,
            age: now - (record.expires_at - record.ttl),
            expires_at: record.expires_at,
            message_count: record.message_count,
        };
        let messages = held.iter().map(|record| api_message(record, now)).collect();
        Ok((claim, messages))
    }

    /// Extend a live claim. Refused once the claim has lapsed: extending it
    /// then would let a worker believe it still owns messages another
    /// worker may already be processing.
    pub async fn update(
        &self,
        queue: &str,
        project: Option<&str>,
        claim_id: &str,
        ttl: i64,
        grace: i64,
    ) -> StorageResult<()> {
        let scope = QueueScope::new(queue, project);
        let id = ids::decode(claim_id).ok_or_else(|| claim_missing(claim_id, &scope))?;

        let now = now_ts();
        let claim_expires = now + ttl;

        let extended = retry_on_connection("claim.update", &self.retry, || {
            self.backend
                .claim_extend(&scope, id, ttl, claim_expires, now)
        })
        .await?;
        if !extended {
            return Err(claim_missing(claim_id, &scope));
        }

        self.backend
            .message_restamp_claim(&scope, id, ttl, claim_expires)
            .await?;
        self.backend
            .message_extend_claimed(&scope, id, claim_expires + grace, ttl + grace)
            .await?;
        Ok(())
    }

    /// Release the claim and free its messages. Unknown and malformed ids
    /// return silently.
    pub async fn delete(
        &self,
        queue: &str,
        project: Option<&str>,
        claim_id: &str,
    ) -> StorageResult<()> {
        let scope = QueueScope::new(queue, project);
        let id = match ids::decode(claim_id) {
            Some(id) => id,
            None => return Ok(()),
        };

        let now = now_ts();
        // Freeing means "became claimable right now": claim id cleared and
        // the stamp expiry set to the present.
        self.backend.message_release(&scope, id, now).await?;
        self.backend.claim_delete(&scope, id).await?;
        Ok(())
    }

    /// Move captured messages whose claim count exceeded the queue's
    /// budget into the dead-letter queue instead of handing them out
    /// again. Returns how many were moved.
    async fn apply_dead_letter_policy(
        &self,
        scope: &QueueScope,
        metadata: &Value,
        claim_id: u64,
        now: i64,
    ) -> StorageResult<usize> {
        let max_claims = metadata.get(META_MAX_CLAIM_COUNT).and_then(Value::as_u64);
        let dead_letter_queue = metadata.get(META_DEAD_LETTER_QUEUE).and_then(Value::as_str);
        let (max_claims, dead_letter_queue) = match (max_claims, dead_letter_queue) {
            (Some(max), Some(name)) => (max as u32, name),
            _ => return Ok(0),
        };
        let ttl_override = metadata.get(META_DEAD_LETTER_TTL).and_then(Value::as_i64);

        let dlq_scope = QueueScope::new(dead_letter_queue, scope.project.as_deref());
        let held = self
            .backend
            .messages_claimed(scope, claim_id, now, None)
            .await?;

        let mut moved = 0;
        for record in held {
            if record.claim.count <= max_claims {
                continue;
            }

            // Give the message a fresh marker in the dead-letter queue so
            // it sorts after anything already there. If the dead-letter
            // queue was never created its marker is left alone.
            let marker = match self
                .backend
                .counter_incr(&dlq_scope, 1, None, now)
                .await?
            {
                CounterIncr::Applied(value) => Some(value - 1),
                _ => None,
            };

            self.backend
                .message_move(scope, record.id, &dlq_scope, ttl_override, marker, now)
                .await?;
            moved += 1;

            log::debug!(
                "message {} exceeded {} claim(s) in queue {}; moved to dead-letter queue {}",
                record.id,
                max_claims,
                scope,
                dlq_scope
            );
        }
        Ok(moved)
    }
}

fn claim_missing(id: &str, scope: &QueueScope) -> StorageError {
    StorageError::ClaimDoesNotExist {
        id: id.to_string(),
        queue: scope.queue.clone(),
        project: scope.project.clone(),
    }
}
