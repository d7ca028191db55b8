use super::test_util::*;
use crate::call::{glare_winner, SessionState};
use crate::callrecord::{
    CallRecord, CallRecordStore, CallStatus, EndReason, MemoryCallStore, RecordQuery,
};
use crate::CallerRole;
use serde_json::json;
use std::sync::Arc;

fn ringing(id: &str, caller: &str, callee: &str) -> CallRecord {
    CallRecord::ringing(
        id.to_string(),
        caller.to_string(),
        CallerRole::Parent,
        callee.to_string(),
        json!({"type": "offer", "sdp": "v=0"}),
    )
}

#[test]
fn earlier_record_wins_in_both_argument_orders() {
    let a = ringing("call-a", "alice", "bob");
    let mut b = ringing("call-b", "bob", "alice");
    b.created_at = a.created_at + chrono::Duration::seconds(1);

    assert_eq!(glare_winner(&a, &b).id, "call-a");
    assert_eq!(glare_winner(&b, &a).id, "call-a");
}

#[test]
fn creation_tie_falls_back_to_smaller_id() {
    let a = ringing("call-a", "alice", "bob");
    let mut b = ringing("call-b", "bob", "alice");
    b.created_at = a.created_at;

    assert_eq!(glare_winner(&a, &b).id, "call-a");
    assert_eq!(glare_winner(&b, &a).id, "call-a");
}

#[tokio::test(start_paused = true)]
async fn simultaneous_dials_converge_on_one_call() {
    let store: Arc<MemoryCallStore> = Arc::new(MemoryCallStore::new());
    let cancel = tokio_util::sync::CancellationToken::new();
    let config = test_config();
    let (alice, _alice_media) =
        spawn_device("alice", CallerRole::Parent, store.clone(), &config, &cancel);
    let (bob, _bob_media) = spawn_device("bob", CallerRole::Child, store.clone(), &config, &cancel);

    let (from_alice, from_bob) = tokio::join!(alice.dial("bob"), bob.dial("alice"));
    let id_a = from_alice.unwrap();
    let id_b = from_bob.unwrap();

    // Exactly one record loses the tie-break and is ended with glare_lost.
    eventually(|| {
        let store = store.clone();
        async move {
            let records = store.query(RecordQuery::default()).await.unwrap();
            records.len() == 2
                && records
                    .iter()
                    .filter(|r| r.end_reason == Some(EndReason::GlareLost))
                    .count()
                    == 1
        }
    })
    .await;

    let records = store.query(RecordQuery::default()).await.unwrap();
    let winner = records
        .iter()
        .find(|r| r.status == CallStatus::Ringing)
        .expect("one record must survive")
        .clone();
    assert!(winner.id == id_a || winner.id == id_b);

    let (winner_handle, loser_handle) = if winner.id == id_a {
        (&alice, &bob)
    } else {
        (&bob, &alice)
    };
    // The loser abandons its own attempt and adopts the winner's ring; the
    // winner never leaves its outgoing attempt.
    wait_for_state(loser_handle, SessionState::IncomingRinging).await;
    assert_eq!(loser_handle.snapshot().call_id, Some(winner.id.clone()));
    assert_eq!(winner_handle.state(), SessionState::OutgoingRinging);

    loser_handle.accept(winner.id.clone());
    wait_for_state(loser_handle, SessionState::Connecting).await;
    wait_for_state(winner_handle, SessionState::Connecting).await;

    let record = store.get(&winner.id).await.unwrap().unwrap();
    assert_eq!(record.status, CallStatus::Active);
    cancel.cancel();
}
