use crate::callrecord::CallRecord;
use crate::error::CallError;
use crate::{CallId, ProfileId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

pub mod ice;
pub mod session;
pub mod termination;

pub use ice::CandidateBuffer;
pub use session::{
    CallSession, CallSessionBuilder, CallSessionHandle, CallSessionSnapshot, SessionState,
};
pub use termination::{TerminationGuard, TerminationOutcome};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Commands accepted by a running session loop. All user-facing surface goes
/// through here; the loop itself owns every piece of mutable call state.
pub enum SessionCommand {
    Dial {
        callee_id: ProfileId,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    },
    Accept {
        call_id: CallId,
    },
    Reject {
        call_id: CallId,
    },
    Hangup,
}

pub type CommandSender = mpsc::UnboundedSender<SessionCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<SessionCommand>;

/// Deterministic winner between two simultaneous outgoing rings of the same
/// pair. The earlier record survives; a creation-time tie falls back to the
/// smaller id, so both devices always agree.
pub fn glare_winner<'a>(a: &'a CallRecord, b: &'a CallRecord) -> &'a CallRecord {
    if (a.created_at, &a.id) <= (b.created_at, &b.id) {
        a
    } else {
        b
    }
}
