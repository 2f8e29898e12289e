//! Message log tests: visibility rules, pagination, posting under
//! contention, and the claim-authorization rules for deletes.

use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::backend::{
    ClaimState, Counter, DataBackend, MemoryData, MessageRecord, QueueRecord, QueueScope,
};
use crate::config::{PostingConfig, RetryConfig};
use crate::core::error::StorageError;
use crate::core::ids;
use crate::core::now_ts;

use super::{ListOptions, MessageController, NewMessage};

fn scope() -> QueueScope {
    QueueScope::new("q1", Some("p"))
}

async fn setup() -> (Arc<MemoryData>, MessageController) {
    let backend = Arc::new(MemoryData::new());
    backend
        .queue_insert(QueueRecord {
            scope: scope(),
            metadata: json!({}),
            counter: Counter {
                value: 1,
                updated_at: 0,
            },
        })
        .await
        .unwrap();

    let controller = controller_with(backend.clone(), test_posting(), true);
    (backend, controller)
}

fn controller_with(
    backend: Arc<MemoryData>,
    posting: PostingConfig,
    fifo: bool,
) -> MessageController {
    MessageController::new(backend, &posting, &RetryConfig::default(), fifo)
}

fn test_posting() -> PostingConfig {
    PostingConfig {
        max_attempts: 10,
        max_retry_sleep_ms: 1,
        max_retry_jitter_ms: 1,
        max_post_duration_secs: 30,
        counter_stall_window_secs: 0,
    }
}

fn new_message(n: u64) -> NewMessage {
    NewMessage {
        ttl: 60,
        body: json!({ "n": n }),
    }
}

/// A finalized row inserted behind the controller's back, as a crashed or
/// in-flight producer would leave it.
fn raw_record(id: u64, marker: u64, tx: Option<Uuid>) -> MessageRecord {
    let now = now_ts();
    MessageRecord {
        id,
        scope: scope(),
        body: json!({ "raw": id }),
        ttl: 60,
        created_at: now,
        expires_at: now + 60,
        marker,
        client: None,
        claim: ClaimState {
            id: None,
            expires_at: now,
            count: 0,
        },
        tx,
    }
}

#[tokio::test]
async fn test_single_producer_posts_list_in_order() {
    let (_, controller) = setup().await;
    let client = Uuid::new_v4();

    let mut posted = Vec::new();
    for n in 0..3 {
        let ids = controller
            .post("q1", Some("p"), vec![new_message(n)], client)
            .await
            .unwrap();
        posted.extend(ids);
    }

    let page = controller
        .list(
            "q1",
            Some("p"),
            &ListOptions {
                echo: true,
                client: Some(client),
                limit: 10,
                ..ListOptions::default()
            },
        )
        .await
        .unwrap();

    let listed: Vec<String> = page.messages.iter().map(|m| m.id.clone()).collect();
    assert_eq!(listed, posted);
    let bodies: Vec<u64> = page
        .messages
        .iter()
        .map(|m| m.body["n"].as_u64().unwrap())
        .collect();
    assert_eq!(bodies, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_pagination_resumes_exactly_once_per_page() {
    let (_, controller) = setup().await;
    let client = Uuid::new_v4();

    let posted = controller
        .post(
            "q1",
            Some("p"),
            (0..5).map(new_message).collect(),
            client,
        )
        .await
        .unwrap();

    let mut collected = Vec::new();
    let mut marker = None;
    loop {
        let page = controller
            .list(
                "q1",
                Some("p"),
                &ListOptions {
                    marker,
                    limit: 2,
                    echo: true,
                    client: Some(client),
                    ..ListOptions::default()
                },
            )
            .await
            .unwrap();
        if page.messages.is_empty() {
            break;
        }
        collected.extend(page.messages.iter().map(|m| m.id.clone()));
        marker = page.next_marker;
    }

    assert_eq!(collected, posted);
}

#[tokio::test]
async fn test_unparseable_marker_yields_empty_page() {
    let (_, controller) = setup().await;
    controller
        .post("q1", Some("p"), vec![new_message(0)], Uuid::new_v4())
        .await
        .unwrap();

    let page = controller
        .list(
            "q1",
            Some("p"),
            &ListOptions {
                marker: Some("not-a-marker".to_string()),
                echo: true,
                ..ListOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(page.messages.is_empty());
    assert!(page.next_marker.is_none());
}

#[tokio::test]
async fn test_listing_suppresses_own_messages_unless_echo() {
    let (_, controller) = setup().await;
    let producer = Uuid::new_v4();
    let observer = Uuid::new_v4();

    controller
        .post("q1", Some("p"), vec![new_message(0)], producer)
        .await
        .unwrap();

    let options = |client, echo| ListOptions {
        client: Some(client),
        echo,
        ..ListOptions::default()
    };

    // The producer does not see its own message back...
    let own = controller
        .list("q1", Some("p"), &options(producer, false))
        .await
        .unwrap();
    assert!(own.messages.is_empty());

    // ...unless echo is requested; other clients always see it.
    let echoed = controller
        .list("q1", Some("p"), &options(producer, true))
        .await
        .unwrap();
    assert_eq!(echoed.messages.len(), 1);

    let other = controller
        .list("q1", Some("p"), &options(observer, false))
        .await
        .unwrap();
    assert_eq!(other.messages.len(), 1);
}

#[tokio::test]
async fn test_batch_is_invisible_until_finalized() {
    let (backend, controller) = setup().await;
    let tag = Uuid::new_v4();

    backend
        .message_insert(
            vec![raw_record(1, 1, Some(tag)), raw_record(2, 2, Some(tag))],
            true,
        )
        .await
        .unwrap();

    // The whole batch is still transaction-tagged: nothing shows.
    let hidden = controller
        .list("q1", Some("p"), &ListOptions { echo: true, ..ListOptions::default() })
        .await
        .unwrap();
    assert!(hidden.messages.is_empty());

    backend.message_finalize(&scope(), tag).await.unwrap();

    // And then the batch appears as a whole, never a strict subset.
    let visible = controller
        .list("q1", Some("p"), &ListOptions { echo: true, ..ListOptions::default() })
        .await
        .unwrap();
    assert_eq!(visible.messages.len(), 2);
}

#[tokio::test]
async fn test_claimed_messages_hidden_unless_requested() {
    let (backend, controller) = setup().await;
    let client = Uuid::new_v4();
    let posted = controller
        .post("q1", Some("p"), vec![new_message(0), new_message(1)], client)
        .await
        .unwrap();

    let first_id = ids::decode(&posted[0]).unwrap();
    let now = now_ts();
    backend
        .message_capture(&scope(), &[first_id], 77, now + 60, now)
        .await
        .unwrap();

    let unclaimed_only = controller
        .list("q1", Some("p"), &ListOptions { echo: true, ..ListOptions::default() })
        .await
        .unwrap();
    assert_eq!(unclaimed_only.messages.len(), 1);

    let all = controller
        .list(
            "q1",
            Some("p"),
            &ListOptions {
                echo: true,
                include_claimed: true,
                ..ListOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(all.messages.len(), 2);
}

#[tokio::test]
async fn test_post_to_missing_queue_fails() {
    let (_, controller) = setup().await;
    let err = controller
        .post("ghost", Some("p"), vec![new_message(0)], Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::QueueDoesNotExist { .. }));
}

#[tokio::test]
async fn test_stalled_counter_recovery_unblocks_posting() {
    let (backend, controller) = setup().await;

    // A producer crashed after inserting marker 1 but before advancing the
    // counter, so every new post derives the same conflicting base.
    backend
        .message_insert(vec![raw_record(1, 1, None)], true)
        .await
        .unwrap();

    let posted = controller
        .post("q1", Some("p"), vec![new_message(9)], Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(posted.len(), 1);

    // The recovered message must sort after the crashed producer's range.
    let page = controller
        .list(
            "q1",
            Some("p"),
            &ListOptions {
                echo: true,
                limit: 10,
                ..ListOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 2);
    assert_eq!(page.messages.last().unwrap().id, posted[0]);
}

#[tokio::test]
async fn test_conflict_surfaces_after_attempts_are_exhausted() {
    let (backend, _) = setup().await;

    // Touch the counter so the stall heuristic sees a recent update and
    // refuses to force it forward.
    backend
        .counter_incr(&scope(), 1, None, now_ts())
        .await
        .unwrap();
    backend
        .message_insert(vec![raw_record(1, 2, None)], true)
        .await
        .unwrap();

    let stubborn = PostingConfig {
        max_attempts: 3,
        counter_stall_window_secs: 3600,
        ..test_posting()
    };
    let controller = controller_with(backend, stubborn, true);

    let err = controller
        .post("q1", Some("p"), vec![new_message(0)], Uuid::new_v4())
        .await
        .unwrap_err();
    match err {
        StorageError::MessageConflict { queue, succeeded_ids, .. } => {
            assert_eq!(queue, "q1");
            assert!(succeeded_ids.is_empty());
        }
        other => panic!("expected MessageConflict, got {other:?}"),
    }
}

#[tokio::test]
async fn test_relaxed_poster_accepts_colliding_markers_without_retry() {
    let (backend, _) = setup().await;

    // Same stuck state as above, but the relaxed poster does not enforce
    // marker uniqueness and must succeed on the first attempt.
    backend
        .message_insert(vec![raw_record(1, 2, None)], true)
        .await
        .unwrap();

    let controller = controller_with(backend, test_posting(), false);
    let posted = controller
        .post("q1", Some("p"), vec![new_message(0), new_message(1)], Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(posted.len(), 2);
}

#[tokio::test]
async fn test_delete_enforces_claim_ownership() {
    let (backend, controller) = setup().await;
    let posted = controller
        .post("q1", Some("p"), vec![new_message(0)], Uuid::new_v4())
        .await
        .unwrap();
    let message_id = posted[0].clone();
    let internal = ids::decode(&message_id).unwrap();

    let now = now_ts();
    backend
        .message_capture(&scope(), &[internal], 77, now + 60, now)
        .await
        .unwrap();

    // No token against a held message.
    let err = controller
        .delete("q1", Some("p"), &message_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::MessageIsClaimed { .. }));

    // A token that names a different claim.
    let wrong = ids::encode(88);
    let err = controller
        .delete("q1", Some("p"), &message_id, Some(&wrong))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::MessageNotClaimedBy { .. }));

    // A token against a message that is no longer claimed at all; this is
    // the worker whose claim expired mid-processing.
    backend.message_release(&scope(), 77, now).await.unwrap();
    let held_token = ids::encode(77);
    let err = controller
        .delete("q1", Some("p"), &message_id, Some(&held_token))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::MessageNotClaimed { .. }));

    // The rightful owner deletes.
    backend
        .message_capture(&scope(), &[internal], 77, now + 60, now)
        .await
        .unwrap();
    controller
        .delete("q1", Some("p"), &message_id, Some(&held_token))
        .await
        .unwrap();
    let err = controller
        .get("q1", Some("p"), &message_id)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::MessageDoesNotExist { .. }));
}

#[tokio::test]
async fn test_delete_is_idempotent_for_absent_and_malformed_ids() {
    let (_, controller) = setup().await;

    controller
        .delete("q1", Some("p"), "garbage", None)
        .await
        .unwrap();
    controller
        .delete("q1", Some("p"), &ids::encode(123456), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_bulk_delete_verifies_claim_ids() {
    let (backend, controller) = setup().await;
    let posted = controller
        .post("q1", Some("p"), vec![new_message(0), new_message(1)], Uuid::new_v4())
        .await
        .unwrap();

    let first = ids::decode(&posted[0]).unwrap();
    let now = now_ts();
    backend
        .message_capture(&scope(), &[first], 77, now + 60, now)
        .await
        .unwrap();

    let unknown_claim = vec![ids::encode(88)];
    let err = controller
        .bulk_delete("q1", Some("p"), &posted, Some(&unknown_claim))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ClaimDoesNotExist { .. }));

    let holding_claim = vec![ids::encode(77)];
    controller
        .bulk_delete("q1", Some("p"), &posted, Some(&holding_claim))
        .await
        .unwrap();

    let page = controller
        .list("q1", Some("p"), &ListOptions { echo: true, ..ListOptions::default() })
        .await
        .unwrap();
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn test_pop_removes_only_free_messages() {
    let (backend, controller) = setup().await;
    let posted = controller
        .post(
            "q1",
            Some("p"),
            (0..3).map(new_message).collect(),
            Uuid::new_v4(),
        )
        .await
        .unwrap();

    let first = ids::decode(&posted[0]).unwrap();
    let now = now_ts();
    backend
        .message_capture(&scope(), &[first], 77, now + 60, now)
        .await
        .unwrap();

    let popped = controller.pop("q1", Some("p"), 10).await.unwrap();
    assert_eq!(popped.len(), 2);
    assert!(popped.iter().all(|m| m.id != posted[0]));

    // Only the claimed message remains.
    let remaining = controller
        .list(
            "q1",
            Some("p"),
            &ListOptions {
                echo: true,
                include_claimed: true,
                ..ListOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(remaining.messages.len(), 1);
    assert_eq!(remaining.messages[0].id, posted[0]);
}

#[tokio::test]
async fn test_first_reports_empty_queue() {
    let (_, controller) = setup().await;

    let err = controller.first("q1", Some("p"), false).await.unwrap_err();
    assert!(matches!(err, StorageError::QueueIsEmpty { .. }));

    let posted = controller
        .post("q1", Some("p"), vec![new_message(0), new_message(1)], Uuid::new_v4())
        .await
        .unwrap();

    let oldest = controller.first("q1", Some("p"), false).await.unwrap();
    assert_eq!(oldest.id, posted[0]);
    let newest = controller.first("q1", Some("p"), true).await.unwrap();
    assert_eq!(newest.id, posted[1]);
}

#[tokio::test]
async fn test_get_and_bulk_get() {
    let (_, controller) = setup().await;
    let posted = controller
        .post("q1", Some("p"), vec![new_message(0), new_message(1)], Uuid::new_v4())
        .await
        .unwrap();

    let message = controller.get("q1", Some("p"), &posted[0]).await.unwrap();
    assert_eq!(message.body["n"], 0);
    assert_eq!(message.claim_count, 0);
    assert!(message.claim_id.is_none());

    let err = controller
        .get("q1", Some("p"), "malformed")
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::MessageDoesNotExist { .. }));

    // Bulk get skips unknown and malformed ids instead of failing.
    let mut request = posted.clone();
    request.push("malformed".to_string());
    request.push(ids::encode(987654));
    let found = controller
        .bulk_get("q1", Some("p"), &request)
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
}
