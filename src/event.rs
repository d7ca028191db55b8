use crate::{
    call::SessionState,
    callrecord::{EndReason, EndedBy},
    CallId, ProfileId,
};
use serde::{Deserialize, Serialize};

/// Events emitted by the call coordinator for the notification layer: ring
/// UI, push notifications, call log. Counterpart names are read from the
/// session's latest-value cell at emission time, never captured earlier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SessionEvent {
    /// An incoming call is ringing on this device.
    Incoming {
        call_id: CallId,
        counterpart_id: ProfileId,
        counterpart_name: Option<String>,
        timestamp: u64,
    },
    /// The callee answered; media negotiation is under way.
    Answered {
        call_id: CallId,
        counterpart_id: ProfileId,
        counterpart_name: Option<String>,
        timestamp: u64,
    },
    /// The call is over, by whatever trigger won the termination race.
    Ended {
        call_id: CallId,
        reason: Option<EndReason>,
        ended_by: Option<EndedBy>,
        timestamp: u64,
    },
    StateChanged {
        call_id: Option<CallId>,
        state: SessionState,
        timestamp: u64,
    },
    Error {
        call_id: Option<CallId>,
        message: String,
        timestamp: u64,
    },
}

impl SessionEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            SessionEvent::Incoming { timestamp, .. } => *timestamp,
            SessionEvent::Answered { timestamp, .. } => *timestamp,
            SessionEvent::Ended { timestamp, .. } => *timestamp,
            SessionEvent::StateChanged { timestamp, .. } => *timestamp,
            SessionEvent::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            SessionEvent::Incoming { call_id, .. } => Some(call_id),
            SessionEvent::Answered { call_id, .. } => Some(call_id),
            SessionEvent::Ended { call_id, .. } => Some(call_id),
            SessionEvent::StateChanged { call_id, .. } => call_id.as_ref(),
            SessionEvent::Error { call_id, .. } => call_id.as_ref(),
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<SessionEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<SessionEvent>;
