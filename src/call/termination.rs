use crate::callrecord::{
    CallRecordStore, CallRecordStoreRef, CallStatus, EndReason, EndedBy, RecordPatch,
    UpdateCondition, UpdateOutcome,
};
use crate::error::CallError;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// This device won the write: its reason is the record's final word.
    Terminated,
    /// Someone already ended the record. Benign; local teardown proceeds.
    AlreadyEnded,
}

/// Idempotent, last-writer-loses termination of a call record. Whoever gets
/// the conditional write in first owns `ended_by`/`end_reason`; every later
/// caller observes `AlreadyEnded` and changes nothing.
pub struct TerminationGuard {
    store: CallRecordStoreRef,
    attempts: u32,
}

impl TerminationGuard {
    pub fn new(store: CallRecordStoreRef, attempts: u32) -> Self {
        Self {
            store,
            attempts: attempts.max(1),
        }
    }

    pub async fn terminate(
        &self,
        call_id: &str,
        ended_by: EndedBy,
        reason: EndReason,
    ) -> Result<TerminationOutcome, CallError> {
        let mut last_err = None;
        for attempt in 1..=self.attempts {
            let patch = RecordPatch::default().ended(ended_by, reason);
            match self
                .store
                .update(call_id, patch, UpdateCondition::StatusNot(CallStatus::Ended))
                .await
            {
                Ok(UpdateOutcome::Applied) => {
                    debug!(call_id, ?ended_by, ?reason, "call record terminated");
                    return Ok(TerminationOutcome::Terminated);
                }
                Ok(UpdateOutcome::Conflict) => {
                    debug!(call_id, "call record already ended");
                    return Ok(TerminationOutcome::AlreadyEnded);
                }
                Err(e) => {
                    warn!(call_id, attempt, "termination write failed: {}", e);
                    last_err = Some(e);
                    if attempt < self.attempts {
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(CallError::SignalingWrite(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "termination write failed".to_string()),
        ))
    }
}
