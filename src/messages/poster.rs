//! Marker assignment for posting
//!
//! Messages must list in the order they were durably accepted even when
//! several producers post to one queue at once and the backend offers no
//! multi-row transaction. The strict variant reads the counter without
//! incrementing it, inserts the batch under the unique (queue, marker)
//! constraint, and only on success advances the counter and finalizes the
//! batch. Incrementing first would open a window where a fast producer's
//! higher markers become visible before a slower producer's lower ones, and
//! an observer paging through the queue would skip the latter forever.
//!
//! A collision therefore means another producer won the range. The loser
//! backs off with jitter, re-derives a fresh range, and tries again under a
//! fresh batch tag.

use tokio::time::sleep;
use uuid::Uuid;

use crate::backend::{
    ClaimState, CounterIncr, DataBackend, MessageRecord, QueueScope,
};
use crate::config::PostingConfig;
use crate::core::error::{StorageError, StorageResult};
use crate::core::now_ts;
use crate::core::retry::calculate_backoff;

use super::NewMessage;

/// Post with strict FIFO marker assignment.
pub(crate) async fn post_fifo(
    backend: &dyn DataBackend,
    config: &PostingConfig,
    scope: &QueueScope,
    messages: &[NewMessage],
    client: Uuid,
) -> StorageResult<Vec<u64>> {
    let started = now_ts();
    let ids: Vec<u64> = messages.iter().map(|_| rand::random()).collect();

    let mut base = match backend.counter_get(scope).await? {
        Some(value) => value,
        None => return Err(queue_missing(scope)),
    };

    for attempt in 0..config.max_attempts {
        let now = now_ts();
        // A batch of one cannot partially succeed, so it skips the
        // two-phase tag and becomes visible on insert.
        let tag = (messages.len() > 1).then(Uuid::new_v4);
        let batch = build_batch(scope, messages, client, &ids, base, tag, now);

        if backend.message_insert(batch, true).await? {
            match backend
                .counter_incr(scope, messages.len() as u64, None, now_ts())
                .await?
            {
                CounterIncr::Missing => return Err(queue_missing(scope)),
                _ => {}
            }

            // Finalize only after the counter is advanced; listings filter
            // tagged rows, so the batch appears all at once right here.
            if let Some(tag) = tag {
                backend.message_finalize(scope, tag).await?;
            }

            if attempt != 0 {
                log::debug!(
                    "{} attempt(s) required to post {} message(s) to queue {}",
                    attempt + 1,
                    messages.len(),
                    scope
                );
            }
            return Ok(ids);
        }

        if attempt == 0 {
            log::debug!("first attempt failed while adding messages to queue {}", scope);
        }

        // Never retry past the point where the competing messages expire
        // and are collected; once they are gone the unique index no longer
        // protects the ordering and markers could be reused.
        let elapsed = now_ts() - started;
        if elapsed > config.max_post_duration_secs {
            log::warn!("exceeded maximum retry duration for queue {}", scope);
            break;
        }

        sleep(calculate_backoff(
            attempt,
            config.max_attempts,
            config.max_retry_sleep(),
            config.max_retry_jitter(),
        ))
        .await;

        // The collision may mean a producer crashed after inserting but
        // before incrementing the counter, in which case every producer
        // keeps deriving the same conflicting base. Force the counter
        // forward one step at a time, but only once it has sat unchanged
        // for the stall window; a live producer would have advanced it.
        match backend
            .counter_incr(
                scope,
                1,
                Some(config.counter_stall_window_secs),
                now_ts(),
            )
            .await?
        {
            CounterIncr::Applied(value) => {
                log::warn!(
                    "detected a stalled message counter for queue {}; incremented to {}",
                    scope,
                    value
                );
                base = value;
            }
            CounterIncr::Skipped => {
                base = match backend.counter_get(scope).await? {
                    Some(value) => value,
                    None => return Err(queue_missing(scope)),
                };
            }
            CounterIncr::Missing => return Err(queue_missing(scope)),
        }
    }

    log::warn!(
        "hit maximum number of attempts ({}) posting to queue {}",
        config.max_attempts,
        scope
    );
    Err(StorageError::MessageConflict {
        queue: scope.queue.clone(),
        project: scope.project.clone(),
        succeeded_ids: Vec::new(),
    })
}

/// Post without ordering strictness: advance the counter first, assign
/// best-effort markers, never retry.
pub(crate) async fn post_relaxed(
    backend: &dyn DataBackend,
    scope: &QueueScope,
    messages: &[NewMessage],
    client: Uuid,
) -> StorageResult<Vec<u64>> {
    let now = now_ts();
    let amount = messages.len() as u64;

    let base = match backend.counter_incr(scope, amount, None, now).await? {
        CounterIncr::Applied(value) => value - amount,
        _ => return Err(queue_missing(scope)),
    };

    let ids: Vec<u64> = messages.iter().map(|_| rand::random()).collect();
    let batch = build_batch(scope, messages, client, &ids, base, None, now);

    if !backend.message_insert(batch, false).await? {
        return Err(StorageError::MessageConflict {
            queue: scope.queue.clone(),
            project: scope.project.clone(),
            succeeded_ids: Vec::new(),
        });
    }
    Ok(ids)
}

fn build_batch(
    scope: &QueueScope,
    messages: &[NewMessage],
    client: Uuid,
    ids: &[u64],
    base: u64,
    tag: Option<Uuid>,
    now: i64,
) -> Vec<MessageRecord> {
    messages
        .iter()
        .zip(ids)
        .enumerate()
        .map(|(index, (message, id))| MessageRecord {
            id: *id,
            scope: scope.clone(),
            body: message.body.clone(),
            ttl: message.ttl,
            created_at: now,
            expires_at: now + message.ttl,
            marker: base + index as u64,
            client: Some(client),
            // Initializing the claim expiry to "now" makes the free
            // predicate a single comparison, with no null checks.
            claim: ClaimState {
                id: None,
                expires_at: now,
                count: 0,
            },
            tx: tag,
        })
        .collect()
}

fn queue_missing(scope: &QueueScope) -> StorageError {
    StorageError::QueueDoesNotExist {
        name: scope.queue.clone(),
        project: scope.project.clone(),
    }
}
