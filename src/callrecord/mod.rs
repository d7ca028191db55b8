use crate::{CallId, CallerRole, ProfileId};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::sync::Arc;
use tokio::sync::broadcast;

pub mod memory;
pub use memory::MemoryCallStore;

#[cfg(test)]
mod tests;

/// Lifecycle status of a call record. Transitions only move forward:
/// `ringing -> active -> ended`, or straight `ringing -> ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Active,
    Ended,
}

impl CallStatus {
    pub fn can_advance_to(&self, next: CallStatus) -> bool {
        matches!(
            (self, next),
            (CallStatus::Ringing, CallStatus::Active)
                | (CallStatus::Ringing, CallStatus::Ended)
                | (CallStatus::Active, CallStatus::Ended)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndedBy {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Hangup,
    Declined,
    Timeout,
    GlareLost,
    MediaFailed,
    SignalingFailed,
    ConnectionFailed,
}

/// One call attempt, jointly owned by both participants for its lifetime.
/// Offer/answer/candidate payloads are opaque blobs at this layer.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: CallId,
    pub caller_id: ProfileId,
    pub callee_id: ProfileId,
    pub caller_role: CallerRole,
    pub status: CallStatus,
    pub offer: Option<serde_json::Value>,
    pub answer: Option<serde_json::Value>,
    #[serde(default)]
    pub caller_candidates: Vec<serde_json::Value>,
    #[serde(default)]
    pub callee_candidates: Vec<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<EndedBy>,
    pub end_reason: Option<EndReason>,
}

impl CallRecord {
    /// A fresh ringing record as created by the caller's coordinator. The
    /// offer is written at creation time and never patched afterwards.
    pub fn ringing(
        id: CallId,
        caller_id: ProfileId,
        caller_role: CallerRole,
        callee_id: ProfileId,
        offer: serde_json::Value,
    ) -> Self {
        Self {
            id,
            caller_id,
            callee_id,
            caller_role,
            status: CallStatus::Ringing,
            offer: Some(offer),
            answer: None,
            caller_candidates: Vec::new(),
            callee_candidates: Vec::new(),
            created_at: Utc::now(),
            ended_at: None,
            ended_by: None,
            end_reason: None,
        }
    }

    pub fn involves(&self, profile_id: &str) -> bool {
        self.caller_id == profile_id || self.callee_id == profile_id
    }

    /// The other participant's profile id, from this device's perspective.
    pub fn counterpart_of(&self, profile_id: &str) -> &ProfileId {
        if self.caller_id == profile_id {
            &self.callee_id
        } else {
            &self.caller_id
        }
    }
}

/// Partial update applied to a call record. Candidate fields append,
/// everything else replaces; `None` leaves the field untouched.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordPatch {
    pub status: Option<CallStatus>,
    pub answer: Option<serde_json::Value>,
    #[serde(default)]
    pub append_caller_candidates: Vec<serde_json::Value>,
    #[serde(default)]
    pub append_callee_candidates: Vec<serde_json::Value>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ended_by: Option<EndedBy>,
    pub end_reason: Option<EndReason>,
}

impl RecordPatch {
    pub fn with_status(mut self, status: CallStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_answer(mut self, answer: serde_json::Value) -> Self {
        self.answer = Some(answer);
        self
    }

    pub fn with_caller_candidates(mut self, candidates: Vec<serde_json::Value>) -> Self {
        self.append_caller_candidates.extend(candidates);
        self
    }

    pub fn with_callee_candidates(mut self, candidates: Vec<serde_json::Value>) -> Self {
        self.append_callee_candidates.extend(candidates);
        self
    }

    /// The write-of-record for termination: status, timestamp, who and why.
    pub fn ended(mut self, ended_by: EndedBy, reason: EndReason) -> Self {
        self.status = Some(CallStatus::Ended);
        self.ended_at = Some(Utc::now());
        self.ended_by = Some(ended_by);
        self.end_reason = Some(reason);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCondition {
    Always,
    StatusIs(CallStatus),
    StatusNot(CallStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The condition did not hold, or a write-once field was already set.
    /// Callers must treat this as a benign no-op, not an error.
    Conflict,
}

/// Change notification payload: a full record snapshot taken after the write.
#[derive(Debug, Clone)]
pub struct RecordChange {
    pub id: CallId,
    pub record: CallRecord,
}

/// Filters for the polling fallback.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub participant: Option<ProfileId>,
    pub created_after: Option<DateTime<Utc>>,
    pub status: Option<CallStatus>,
    pub limit: Option<usize>,
}

/// The shared persisted store both participants signal through. The change
/// feed is best-effort: it may drop on lag and may deliver duplicates; the
/// polling fallback and per-call dedup in the signaling channel cover both.
#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn create(&self, record: CallRecord) -> Result<CallId>;

    /// Conditional partial update. Returns `Conflict` (not an error) when the
    /// condition fails or a write-once field is already set.
    async fn update(
        &self,
        id: &str,
        patch: RecordPatch,
        condition: UpdateCondition,
    ) -> Result<UpdateOutcome>;

    async fn get(&self, id: &str) -> Result<Option<CallRecord>>;

    /// Newest-first query used by the polling fallback.
    async fn query(&self, query: RecordQuery) -> Result<Vec<CallRecord>>;

    fn subscribe(&self) -> broadcast::Receiver<RecordChange>;
}

pub type CallRecordStoreRef = Arc<dyn CallRecordStore>;
