use super::*;
use crate::CallerRole;
use chrono::Duration as ChronoDuration;
use serde_json::json;

fn ringing_record(id: &str, caller: &str, callee: &str) -> CallRecord {
    CallRecord::ringing(
        id.to_string(),
        caller.to_string(),
        CallerRole::Parent,
        callee.to_string(),
        json!({"type": "offer", "sdp": "v=0"}),
    )
}

#[tokio::test]
async fn create_then_get_roundtrip() {
    let store = MemoryCallStore::new();
    let id = store
        .create(ringing_record("call-1", "p", "c"))
        .await
        .unwrap();
    let record = store.get(&id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ringing);
    assert!(record.offer.is_some());
    assert!(record.answer.is_none());
}

#[tokio::test]
async fn duplicate_create_is_an_error() {
    let store = MemoryCallStore::new();
    store
        .create(ringing_record("call-1", "p", "c"))
        .await
        .unwrap();
    assert!(store.create(ringing_record("call-1", "p", "c")).await.is_err());
}

#[tokio::test]
async fn conditional_update_respects_status() {
    let store = MemoryCallStore::new();
    store
        .create(ringing_record("call-1", "p", "c"))
        .await
        .unwrap();

    let outcome = store
        .update(
            "call-1",
            RecordPatch::default().with_status(CallStatus::Active),
            UpdateCondition::StatusIs(CallStatus::Ringing),
        )
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Applied);

    // Same conditional write again: the record is no longer ringing.
    let outcome = store
        .update(
            "call-1",
            RecordPatch::default().with_status(CallStatus::Active),
            UpdateCondition::StatusIs(CallStatus::Ringing),
        )
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Conflict);
}

#[tokio::test]
async fn status_never_moves_backward() {
    let store = MemoryCallStore::new();
    store
        .create(ringing_record("call-1", "p", "c"))
        .await
        .unwrap();
    store
        .update(
            "call-1",
            RecordPatch::default().ended(EndedBy::Caller, EndReason::Hangup),
            UpdateCondition::StatusNot(CallStatus::Ended),
        )
        .await
        .unwrap();

    let outcome = store
        .update(
            "call-1",
            RecordPatch::default().with_status(CallStatus::Active),
            UpdateCondition::Always,
        )
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Conflict);
    let record = store.get("call-1").await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Ended);
}

#[tokio::test]
async fn answer_is_write_once() {
    let store = MemoryCallStore::new();
    store
        .create(ringing_record("call-1", "p", "c"))
        .await
        .unwrap();

    let first = store
        .update(
            "call-1",
            RecordPatch::default().with_answer(json!({"type": "answer", "sdp": "a"})),
            UpdateCondition::Always,
        )
        .await
        .unwrap();
    assert_eq!(first, UpdateOutcome::Applied);

    let second = store
        .update(
            "call-1",
            RecordPatch::default().with_answer(json!({"type": "answer", "sdp": "b"})),
            UpdateCondition::Always,
        )
        .await
        .unwrap();
    assert_eq!(second, UpdateOutcome::Conflict);

    let record = store.get("call-1").await.unwrap().unwrap();
    assert_eq!(record.answer, Some(json!({"type": "answer", "sdp": "a"})));
}

#[tokio::test]
async fn termination_fields_are_write_once() {
    let store = MemoryCallStore::new();
    store
        .create(ringing_record("call-1", "p", "c"))
        .await
        .unwrap();

    store
        .update(
            "call-1",
            RecordPatch::default().ended(EndedBy::Callee, EndReason::Declined),
            UpdateCondition::StatusNot(CallStatus::Ended),
        )
        .await
        .unwrap();
    let outcome = store
        .update(
            "call-1",
            RecordPatch::default().ended(EndedBy::Caller, EndReason::Timeout),
            UpdateCondition::StatusNot(CallStatus::Ended),
        )
        .await
        .unwrap();
    assert_eq!(outcome, UpdateOutcome::Conflict);

    let record = store.get("call-1").await.unwrap().unwrap();
    assert_eq!(record.end_reason, Some(EndReason::Declined));
    assert_eq!(record.ended_by, Some(EndedBy::Callee));
}

#[tokio::test]
async fn candidate_lists_append_in_order() {
    let store = MemoryCallStore::new();
    store
        .create(ringing_record("call-1", "p", "c"))
        .await
        .unwrap();

    store
        .update(
            "call-1",
            RecordPatch::default().with_caller_candidates(vec![json!("c1")]),
            UpdateCondition::Always,
        )
        .await
        .unwrap();
    store
        .update(
            "call-1",
            RecordPatch::default().with_caller_candidates(vec![json!("c2"), json!("c3")]),
            UpdateCondition::Always,
        )
        .await
        .unwrap();

    let record = store.get("call-1").await.unwrap().unwrap();
    assert_eq!(
        record.caller_candidates,
        vec![json!("c1"), json!("c2"), json!("c3")]
    );
    assert!(record.callee_candidates.is_empty());
}

#[tokio::test]
async fn query_filters_participant_and_cutoff() {
    let store = MemoryCallStore::new();
    let mut old = ringing_record("call-old", "p", "c");
    old.created_at = Utc::now() - ChronoDuration::seconds(300);
    store.create(old).await.unwrap();
    store
        .create(ringing_record("call-new", "p", "c"))
        .await
        .unwrap();
    store
        .create(ringing_record("call-other", "x", "y"))
        .await
        .unwrap();

    let records = store
        .query(RecordQuery {
            participant: Some("c".to_string()),
            created_after: Some(Utc::now() - ChronoDuration::seconds(60)),
            status: None,
            limit: Some(10),
        })
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "call-new");
}

#[tokio::test]
async fn subscribe_sees_creates_and_updates() {
    let store = MemoryCallStore::new();
    let mut feed = store.subscribe();

    store
        .create(ringing_record("call-1", "p", "c"))
        .await
        .unwrap();
    let change = feed.recv().await.unwrap();
    assert_eq!(change.id, "call-1");
    assert_eq!(change.record.status, CallStatus::Ringing);

    store
        .update(
            "call-1",
            RecordPatch::default().with_status(CallStatus::Active),
            UpdateCondition::StatusIs(CallStatus::Ringing),
        )
        .await
        .unwrap();
    let change = feed.recv().await.unwrap();
    assert_eq!(change.record.status, CallStatus::Active);
}
