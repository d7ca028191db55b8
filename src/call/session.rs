use super::ice::CandidateBuffer;
use super::termination::TerminationGuard;
use super::{glare_winner, CallDirection, CommandReceiver, CommandSender, SessionCommand};
use crate::callrecord::{
    CallRecord, CallRecordStore, CallRecordStoreRef, CallStatus, EndReason, EndedBy, RecordPatch,
    UpdateCondition, UpdateOutcome,
};
use crate::config::Config;
use crate::error::CallError;
use crate::event::{EventReceiver, EventSender, SessionEvent};
use crate::media::{
    LocalMedia, MediaAdapter, MediaAdapterRef, MediaSession, PeerConnectionState, PeerEvent,
    PeerEventReceiver, PeerEventSender,
};
use crate::signaling::{RearmSender, SignalReceiver, SignalingChannel};
use crate::{get_timestamp, CallId, Identity, ProfileId};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Connecting,
    InCall,
    Ended,
    Failed,
}

impl SessionState {
    /// Terminal states count as idle for the next attempt.
    pub fn accepts_new_call(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Ended | SessionState::Failed
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::OutgoingRinging => "outgoing_ringing",
            SessionState::IncomingRinging => "incoming_ringing",
            SessionState::Connecting => "connecting",
            SessionState::InCall => "in_call",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSessionSnapshot {
    pub state: SessionState,
    pub call_id: Option<CallId>,
    pub direction: Option<CallDirection>,
    pub counterpart_id: Option<ProfileId>,
    pub counterpart_name: Option<String>,
}

/// Shared view of the session loop's state, readable from any task.
/// `counterpart_name` is a latest-value cell: the host updates it whenever
/// its contact cache changes and events read it at emission time.
#[derive(Clone)]
pub struct CallSessionShared {
    inner: Arc<RwLock<CallSessionSnapshot>>,
}

impl CallSessionShared {
    fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(CallSessionSnapshot {
                state: SessionState::Idle,
                call_id: None,
                direction: None,
                counterpart_id: None,
                counterpart_name: None,
            })),
        }
    }

    pub fn snapshot(&self) -> CallSessionSnapshot {
        self.inner.read().unwrap().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.read().unwrap().state
    }

    pub fn counterpart_name(&self) -> Option<String> {
        self.inner.read().unwrap().counterpart_name.clone()
    }

    pub fn set_counterpart_name(&self, name: Option<String>) {
        self.inner.write().unwrap().counterpart_name = name;
    }

    fn update(&self, f: impl FnOnce(&mut CallSessionSnapshot)) {
        let mut inner = self.inner.write().unwrap();
        f(&mut inner);
    }
}

/// User-facing surface of a running session loop. Cheap to clone; all
/// mutation funnels through the command channel.
#[derive(Clone)]
pub struct CallSessionHandle {
    identity: Identity,
    commands: CommandSender,
    shared: CallSessionShared,
    events: EventSender,
}

impl CallSessionHandle {
    pub async fn dial(&self, callee_id: impl Into<ProfileId>) -> Result<CallId, CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Dial {
                callee_id: callee_id.into(),
                reply,
            })
            .map_err(|_| CallError::InvalidState {
                operation: "dial",
                state: "stopped".to_string(),
            })?;
        rx.await.map_err(|_| CallError::InvalidState {
            operation: "dial",
            state: "stopped".to_string(),
        })?
    }

    pub fn accept(&self, call_id: impl Into<CallId>) {
        let _ = self.commands.send(SessionCommand::Accept {
            call_id: call_id.into(),
        });
    }

    pub fn reject(&self, call_id: impl Into<CallId>) {
        let _ = self.commands.send(SessionCommand::Reject {
            call_id: call_id.into(),
        });
    }

    pub fn hangup(&self) {
        let _ = self.commands.send(SessionCommand::Hangup);
    }

    pub fn subscribe_events(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> CallSessionSnapshot {
        self.shared.snapshot()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn set_counterpart_name(&self, name: Option<String>) {
        self.shared.set_counterpart_name(name);
    }

    /// Whether a ringing record should be hidden from this device's ring
    /// surface: our own outgoing ring echoed back, a ring from a same-role
    /// profile, or a ring from a counterpart we are already engaged with.
    pub fn suppress_incoming(&self, record: &CallRecord) -> bool {
        if record.caller_id == self.identity.profile_id || record.caller_role == self.identity.role
        {
            return true;
        }
        let snapshot = self.shared.snapshot();
        !snapshot.state.accepts_new_call()
            && snapshot.counterpart_id.as_deref() == Some(record.caller_id.as_str())
    }
}

pub struct CallSessionBuilder {
    identity: Identity,
    store: CallRecordStoreRef,
    media: MediaAdapterRef,
    config: Config,
    cancel_token: CancellationToken,
}

impl CallSessionBuilder {
    pub fn new(identity: Identity, store: CallRecordStoreRef, media: MediaAdapterRef) -> Self {
        Self {
            identity,
            store,
            media,
            config: Config::default(),
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Start the signaling channel and the session loop, returning the
    /// handle. Both tasks stop when the cancel token fires.
    pub fn spawn(self) -> CallSessionHandle {
        let (channel, signals, signal_rearm) = SignalingChannel::new(
            self.store.clone(),
            self.identity.profile_id.clone(),
            &self.config,
            self.cancel_token.clone(),
        );
        tokio::spawn(channel.serve());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = tokio::sync::broadcast::channel(64);
        let shared = CallSessionShared::new();
        let handle = CallSessionHandle {
            identity: self.identity.clone(),
            commands: commands_tx,
            shared: shared.clone(),
            events: events.clone(),
        };
        let guard = TerminationGuard::new(self.store.clone(), self.config.signaling_write_attempts);
        let session = CallSession {
            identity: self.identity,
            config: self.config,
            store: self.store,
            media: self.media,
            shared,
            events,
            commands: commands_rx,
            signals,
            signal_rearm,
            internal_tx,
            internal_rx,
            guard,
            cancel_token: self.cancel_token,
            attempt: None,
            seq: 0,
        };
        tokio::spawn(session.serve());
        handle
    }
}

struct DialSetup {
    record: CallRecord,
    local: Arc<dyn LocalMedia>,
    session: Arc<dyn MediaSession>,
}

struct AcceptSetup {
    answer: serde_json::Value,
    local: Arc<dyn LocalMedia>,
    session: Arc<dyn MediaSession>,
}

enum InternalEvent {
    DialReady {
        seq: u64,
        result: Result<DialSetup, CallError>,
    },
    AcceptReady {
        seq: u64,
        result: Result<AcceptSetup, CallError>,
    },
    Peer {
        seq: u64,
        event: PeerEvent,
    },
    RingTimeout {
        seq: u64,
    },
    DisconnectGrace {
        seq: u64,
    },
}

/// Mutable context for one call attempt. Dropped whole on every terminal
/// transition; late async completions are fenced by `seq`.
struct ActiveAttempt {
    seq: u64,
    call_id: CallId,
    direction: CallDirection,
    record: Option<CallRecord>,
    local: Option<Arc<dyn LocalMedia>>,
    session: Option<Arc<dyn MediaSession>>,
    remote_buffer: CandidateBuffer,
    local_buffer: CandidateBuffer,
    accepting: bool,
    pending_dial: Option<oneshot::Sender<Result<CallId, CallError>>>,
    pending_incoming: Option<CallRecord>,
    last_conn_state: PeerConnectionState,
}

impl ActiveAttempt {
    fn new(seq: u64, call_id: CallId, direction: CallDirection) -> Self {
        Self {
            seq,
            call_id,
            direction,
            record: None,
            local: None,
            session: None,
            remote_buffer: CandidateBuffer::new(),
            local_buffer: CandidateBuffer::new(),
            accepting: false,
            pending_dial: None,
            pending_incoming: None,
            last_conn_state: PeerConnectionState::New,
        }
    }

    fn my_side(&self) -> EndedBy {
        match self.direction {
            CallDirection::Outgoing => EndedBy::Caller,
            CallDirection::Incoming => EndedBy::Callee,
        }
    }

    async fn release_media(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        if let Some(local) = self.local.take() {
            local.release().await;
        }
    }
}

/// The per-device call coordinator. One loop owns all mutable call state;
/// commands, signaling observations, media events and timers are merged in a
/// single `select!` so no handler ever races another.
pub struct CallSession {
    identity: Identity,
    config: Config,
    store: CallRecordStoreRef,
    media: MediaAdapterRef,
    shared: CallSessionShared,
    events: EventSender,
    commands: CommandReceiver,
    signals: SignalReceiver,
    signal_rearm: RearmSender,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: mpsc::UnboundedReceiver<InternalEvent>,
    guard: TerminationGuard,
    cancel_token: CancellationToken,
    attempt: Option<ActiveAttempt>,
    seq: u64,
}

impl CallSession {
    pub async fn serve(mut self) {
        info!(profile_id = %self.identity.profile_id, "call session loop started");
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                record = self.signals.recv() => match record {
                    Some(record) => self.handle_record(record).await,
                    None => break,
                },
                event = self.internal_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_internal(event).await;
                    }
                }
            }
        }
        self.shutdown().await;
        info!(profile_id = %self.identity.profile_id, "call session loop stopped");
    }

    fn state(&self) -> SessionState {
        self.shared.state()
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: SessionState, call_id: Option<CallId>) {
        self.shared.update(|inner| {
            inner.state = state;
            inner.call_id = call_id.clone();
        });
        if state.accepts_new_call() {
            // A ring ignored while busy should surface now that we are free.
            let _ = self.signal_rearm.send(());
        }
        self.emit(SessionEvent::StateChanged {
            call_id,
            state,
            timestamp: get_timestamp(),
        });
    }

    fn attempt_seq(&self) -> Option<u64> {
        self.attempt.as_ref().map(|a| a.seq)
    }

    // ---- commands -------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Dial { callee_id, reply } => self.on_dial(callee_id, reply).await,
            SessionCommand::Accept { call_id } => self.on_accept(call_id).await,
            SessionCommand::Reject { call_id } => self.on_reject(call_id).await,
            SessionCommand::Hangup => self.on_hangup().await,
        }
    }

    async fn on_dial(
        &mut self,
        callee_id: ProfileId,
        reply: oneshot::Sender<Result<CallId, CallError>>,
    ) {
        let state = self.state();
        if !state.accepts_new_call() {
            let _ = reply.send(Err(CallError::InvalidState {
                operation: "dial",
                state: state.to_string(),
            }));
            return;
        }

        let seq = self.next_seq();
        let call_id = Uuid::new_v4().to_string();
        let mut attempt = ActiveAttempt::new(seq, call_id.clone(), CallDirection::Outgoing);
        attempt.pending_dial = Some(reply);
        self.attempt = Some(attempt);
        self.shared.update(|inner| {
            inner.direction = Some(CallDirection::Outgoing);
            inner.counterpart_id = Some(callee_id.clone());
        });
        self.set_state(SessionState::OutgoingRinging, Some(call_id.clone()));
        info!(call_id = %call_id, callee_id = %callee_id, "dialing");
        // The ring window opens on entering the ringing state, even while
        // media setup is still in flight.
        self.arm_ring_timer(seq);

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        self.spawn_peer_forwarder(seq, peer_rx);
        let media = self.media.clone();
        let store = self.store.clone();
        let identity = self.identity.clone();
        let attempts = self.config.signaling_write_attempts.max(1);
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result =
                dial_setup(media, store, identity, callee_id, call_id, peer_tx, attempts).await;
            let _ = internal.send(InternalEvent::DialReady { seq, result });
        });
    }

    async fn on_accept(&mut self, call_id: CallId) {
        let state = self.state();
        let matches = self
            .attempt
            .as_ref()
            .map(|a| a.call_id == call_id)
            .unwrap_or(false);
        if state != SessionState::IncomingRinging || !matches {
            warn!(call_id = %call_id, state = %state, "accept is not valid here");
            self.emit(SessionEvent::Error {
                call_id: Some(call_id),
                message: format!("accept is not valid in state {}", state),
                timestamp: get_timestamp(),
            });
            return;
        }
        let attempt = self.attempt.as_mut().unwrap();
        if attempt.accepting {
            debug!(call_id = %call_id, "accept already in progress");
            return;
        }
        // The guard is set before any async work so a racing reject becomes
        // a no-op from here on.
        attempt.accepting = true;
        let seq = attempt.seq;
        let offer = attempt.record.as_ref().and_then(|r| r.offer.clone());

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        self.spawn_peer_forwarder(seq, peer_rx);
        let media = self.media.clone();
        let internal = self.internal_tx.clone();
        info!(call_id = %call_id, "accepting incoming call");
        tokio::spawn(async move {
            let result = accept_setup(media, offer, peer_tx).await;
            let _ = internal.send(InternalEvent::AcceptReady { seq, result });
        });
    }

    async fn on_reject(&mut self, call_id: CallId) {
        let state = self.state();
        let matches = self
            .attempt
            .as_ref()
            .map(|a| a.call_id == call_id)
            .unwrap_or(false);
        if state != SessionState::IncomingRinging || !matches {
            debug!(call_id = %call_id, state = %state, "reject ignored");
            return;
        }
        if self.attempt.as_ref().map(|a| a.accepting).unwrap_or(false) {
            debug!(call_id = %call_id, "reject ignored, accept already in progress");
            return;
        }
        info!(call_id = %call_id, "rejecting incoming call");
        let attempt = self.attempt.take().unwrap();
        self.terminate_and_finish(
            attempt,
            EndReason::Declined,
            SessionState::Ended,
        )
        .await;
    }

    async fn on_hangup(&mut self) {
        let state = self.state();
        if state.accepts_new_call() {
            debug!(state = %state, "hangup with no active call");
            return;
        }
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        info!(call_id = %attempt.call_id, "hanging up");
        self.terminate_and_finish(attempt, EndReason::Hangup, SessionState::Ended)
            .await;
    }

    // ---- signaling observations ----------------------------------------

    async fn handle_record(&mut self, record: CallRecord) {
        let own = self
            .attempt
            .as_ref()
            .map(|a| a.call_id == record.id)
            .unwrap_or(false);
        if own {
            self.handle_own_update(record).await;
            return;
        }

        if record.status != CallStatus::Ringing
            || record.callee_id != self.identity.profile_id
        {
            debug!(call_id = %record.id, "record observation not actionable");
            return;
        }
        if record.caller_id == self.identity.profile_id
            || record.caller_role == self.identity.role
        {
            debug!(call_id = %record.id, stale = true, "self ring suppressed");
            return;
        }

        let state = self.state();
        let glare = state == SessionState::OutgoingRinging
            && self
                .shared
                .snapshot()
                .counterpart_id
                .as_deref()
                == Some(record.caller_id.as_str());
        if glare {
            self.resolve_glare(record).await;
            return;
        }
        if !state.accepts_new_call() {
            debug!(call_id = %record.id, state = %state, "busy, incoming ring ignored");
            return;
        }
        self.begin_incoming(record).await;
    }

    async fn begin_incoming(&mut self, record: CallRecord) {
        let seq = self.next_seq();
        let call_id = record.id.clone();
        let counterpart_id = record.caller_id.clone();
        let mut attempt = ActiveAttempt::new(seq, call_id.clone(), CallDirection::Incoming);
        // Candidates may already be in the observed snapshot; queue them
        // until the remote description is applied at accept time.
        attempt.remote_buffer.observe(&record.caller_candidates);
        attempt.record = Some(record);
        self.attempt = Some(attempt);
        self.shared.update(|inner| {
            inner.direction = Some(CallDirection::Incoming);
            inner.counterpart_id = Some(counterpart_id.clone());
        });
        self.set_state(SessionState::IncomingRinging, Some(call_id.clone()));
        info!(call_id = %call_id, caller_id = %counterpart_id, "incoming call ringing");
        self.emit(SessionEvent::Incoming {
            call_id,
            counterpart_id,
            counterpart_name: self.shared.counterpart_name(),
            timestamp: get_timestamp(),
        });
        self.arm_ring_timer(seq);
    }

    async fn resolve_glare(&mut self, incoming: CallRecord) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let Some(mine) = attempt.record.clone() else {
            // Our own record is still being created; settle once it exists.
            debug!(call_id = %incoming.id, "glare observed before own record, deferred");
            attempt.pending_incoming = Some(incoming);
            return;
        };
        if glare_winner(&mine, &incoming).id == mine.id {
            debug!(call_id = %mine.id, loser = %incoming.id, "glare resolved, own call wins");
            return;
        }
        info!(call_id = %mine.id, winner = %incoming.id, "glare resolved, own call loses");
        let mut attempt = self.attempt.take().unwrap();
        attempt.release_media().await;
        let _ = self
            .guard
            .terminate(&mine.id, EndedBy::Caller, EndReason::GlareLost)
            .await;
        self.emit(SessionEvent::Ended {
            call_id: mine.id,
            reason: Some(EndReason::GlareLost),
            ended_by: Some(EndedBy::Caller),
            timestamp: get_timestamp(),
        });
        self.begin_incoming(incoming).await;
    }

    async fn handle_own_update(&mut self, record: CallRecord) {
        if record.status == CallStatus::Ended {
            let Some(mut attempt) = self.attempt.take() else {
                return;
            };
            info!(call_id = %record.id, reason = ?record.end_reason, "call ended remotely");
            attempt.release_media().await;
            let call_id = attempt.call_id.clone();
            if let Some(reply) = attempt.pending_dial.take() {
                let _ = reply.send(Ok(call_id.clone()));
            }
            self.set_state(SessionState::Ended, Some(call_id.clone()));
            self.emit(SessionEvent::Ended {
                call_id,
                reason: record.end_reason,
                ended_by: record.ended_by,
                timestamp: get_timestamp(),
            });
            return;
        }

        let state = self.state();
        let direction = self.attempt.as_ref().map(|a| a.direction);
        if direction == Some(CallDirection::Outgoing)
            && state == SessionState::OutgoingRinging
            && record.answer.is_some()
        {
            self.apply_answer(record).await;
            return;
        }

        // Candidate-only advancement.
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        let remote_list = match attempt.direction {
            CallDirection::Outgoing => &record.callee_candidates,
            CallDirection::Incoming => &record.caller_candidates,
        };
        let fresh = attempt.remote_buffer.observe(remote_list);
        let session = attempt.session.clone();
        attempt.record = Some(record);
        if let Some(session) = session {
            for candidate in fresh {
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    warn!("remote candidate rejected: {}", e);
                }
            }
        }
    }

    async fn apply_answer(&mut self, record: CallRecord) {
        let Some(mut attempt) = self.attempt.take() else {
            return;
        };
        let Some(session) = attempt.session.clone() else {
            // Answer cannot arrive before our own record exists, which in
            // turn requires the peer session; treat as a stale observation.
            debug!(call_id = %record.id, stale = true, "answer before setup");
            self.attempt = Some(attempt);
            return;
        };
        let answer = record.answer.clone().unwrap_or_default();
        info!(call_id = %record.id, "answer observed");
        match session.set_remote_description(answer).await {
            Ok(()) => {
                attempt.remote_buffer.observe(&record.callee_candidates);
                let pending = attempt.remote_buffer.mark_ready();
                attempt.record = Some(record.clone());
                let call_id = attempt.call_id.clone();
                self.attempt = Some(attempt);
                self.set_state(SessionState::Connecting, Some(call_id.clone()));
                self.emit(SessionEvent::Answered {
                    call_id,
                    counterpart_id: record.callee_id.clone(),
                    counterpart_name: self.shared.counterpart_name(),
                    timestamp: get_timestamp(),
                });
                for candidate in pending {
                    if let Err(e) = session.add_ice_candidate(candidate).await {
                        warn!("remote candidate rejected: {}", e);
                    }
                }
            }
            Err(e) => {
                warn!(call_id = %record.id, "remote answer rejected: {}", e);
                self.emit(SessionEvent::Error {
                    call_id: Some(record.id.clone()),
                    message: e.to_string(),
                    timestamp: get_timestamp(),
                });
                self.terminate_and_finish(
                    attempt,
                    EndReason::SignalingFailed,
                    SessionState::Failed,
                )
                .await;
            }
        }
    }

    // ---- internal completions ------------------------------------------

    async fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::DialReady { seq, result } => self.on_dial_ready(seq, result).await,
            InternalEvent::AcceptReady { seq, result } => self.on_accept_ready(seq, result).await,
            InternalEvent::Peer { seq, event } => self.on_peer_event(seq, event).await,
            InternalEvent::RingTimeout { seq } => self.on_ring_timeout(seq).await,
            InternalEvent::DisconnectGrace { seq } => self.on_disconnect_grace(seq).await,
        }
    }

    async fn on_dial_ready(&mut self, seq: u64, result: Result<DialSetup, CallError>) {
        let fresh =
            self.attempt_seq() == Some(seq) && self.state() == SessionState::OutgoingRinging;
        match result {
            Ok(setup) => {
                if !fresh {
                    // The call was abandoned while setup was in flight; the
                    // record was already created, so end it properly.
                    debug!(call_id = %setup.record.id, stale = true, "late dial setup discarded");
                    setup.session.close().await;
                    setup.local.release().await;
                    let _ = self
                        .guard
                        .terminate(&setup.record.id, EndedBy::Caller, EndReason::Hangup)
                        .await;
                    return;
                }
                let mut attempt = self.attempt.take().unwrap();
                let call_id = setup.record.id.clone();
                attempt.record = Some(setup.record);
                attempt.local = Some(setup.local);
                attempt.session = Some(setup.session);
                let pending_local = attempt.local_buffer.mark_ready();
                if let Some(reply) = attempt.pending_dial.take() {
                    let _ = reply.send(Ok(call_id.clone()));
                }
                let pending_incoming = attempt.pending_incoming.take();
                self.attempt = Some(attempt);
                for candidate in pending_local {
                    self.write_local_candidate(candidate).await;
                }
                if let Some(incoming) = pending_incoming {
                    self.resolve_glare(incoming).await;
                }
            }
            Err(e) => {
                if !fresh {
                    debug!(stale = true, "late dial failure discarded: {}", e);
                    return;
                }
                warn!("dial setup failed: {}", e);
                let mut attempt = self.attempt.take().unwrap();
                let call_id = attempt.call_id.clone();
                let message = e.to_string();
                if let Some(reply) = attempt.pending_dial.take() {
                    let _ = reply.send(Err(e));
                }
                // No record was created, so there is nothing to terminate.
                self.set_state(SessionState::Failed, Some(call_id.clone()));
                self.emit(SessionEvent::Error {
                    call_id: Some(call_id),
                    message,
                    timestamp: get_timestamp(),
                });
            }
        }
    }

    async fn on_accept_ready(&mut self, seq: u64, result: Result<AcceptSetup, CallError>) {
        let fresh =
            self.attempt_seq() == Some(seq) && self.state() == SessionState::IncomingRinging;
        match result {
            Ok(setup) => {
                if !fresh {
                    debug!(stale = true, "late accept setup discarded");
                    setup.session.close().await;
                    setup.local.release().await;
                    return;
                }
                let mut attempt = self.attempt.take().unwrap();
                let call_id = attempt.call_id.clone();
                let patch = RecordPatch::default()
                    .with_answer(setup.answer.clone())
                    .with_status(CallStatus::Active);
                match self
                    .update_with_retry(&call_id, patch, UpdateCondition::StatusIs(CallStatus::Ringing))
                    .await
                {
                    Ok(UpdateOutcome::Applied) => {
                        attempt.local = Some(setup.local);
                        attempt.session = Some(setup.session.clone());
                        // The remote description was applied during setup.
                        let pending_remote = attempt.remote_buffer.mark_ready();
                        let pending_local = attempt.local_buffer.mark_ready();
                        let counterpart_id = attempt
                            .record
                            .as_ref()
                            .map(|r| r.caller_id.clone())
                            .unwrap_or_default();
                        self.attempt = Some(attempt);
                        self.set_state(SessionState::Connecting, Some(call_id.clone()));
                        self.emit(SessionEvent::Answered {
                            call_id,
                            counterpart_id,
                            counterpart_name: self.shared.counterpart_name(),
                            timestamp: get_timestamp(),
                        });
                        for candidate in pending_remote {
                            if let Err(e) = setup.session.add_ice_candidate(candidate).await {
                                warn!("remote candidate rejected: {}", e);
                            }
                        }
                        for candidate in pending_local {
                            self.write_local_candidate(candidate).await;
                        }
                    }
                    Ok(UpdateOutcome::Conflict) => {
                        // The record moved on without us, normally because
                        // the caller hung up or the call already ended.
                        info!(call_id = %call_id, "accept lost the record race");
                        setup.session.close().await;
                        setup.local.release().await;
                        let record = self.store.get(&call_id).await.ok().flatten();
                        self.set_state(SessionState::Ended, Some(call_id.clone()));
                        self.emit(SessionEvent::Ended {
                            call_id,
                            reason: record.as_ref().and_then(|r| r.end_reason),
                            ended_by: record.as_ref().and_then(|r| r.ended_by),
                            timestamp: get_timestamp(),
                        });
                    }
                    Err(e) => {
                        warn!(call_id = %call_id, "answer write failed: {}", e);
                        setup.session.close().await;
                        setup.local.release().await;
                        self.terminate_and_finish(
                            attempt,
                            EndReason::SignalingFailed,
                            SessionState::Failed,
                        )
                        .await;
                    }
                }
            }
            Err(e) => {
                if !fresh {
                    debug!(stale = true, "late accept failure discarded: {}", e);
                    return;
                }
                warn!("accept setup failed: {}", e);
                let attempt = self.attempt.take().unwrap();
                let reason = match &e {
                    CallError::MediaAcquisition(_) => EndReason::MediaFailed,
                    _ => EndReason::SignalingFailed,
                };
                self.emit(SessionEvent::Error {
                    call_id: Some(attempt.call_id.clone()),
                    message: e.to_string(),
                    timestamp: get_timestamp(),
                });
                self.terminate_and_finish(attempt, reason, SessionState::Failed)
                    .await;
            }
        }
    }

    async fn on_peer_event(&mut self, seq: u64, event: PeerEvent) {
        if self.attempt_seq() != Some(seq) {
            debug!(stale = true, "peer event for a finished attempt");
            return;
        }
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let ready = self
                    .attempt
                    .as_mut()
                    .and_then(|a| a.local_buffer.push(candidate));
                if let Some(candidate) = ready {
                    self.write_local_candidate(candidate).await;
                }
            }
            PeerEvent::RemoteTrack => {
                if self.state() == SessionState::Connecting {
                    let call_id = self.attempt.as_ref().map(|a| a.call_id.clone());
                    self.set_state(SessionState::InCall, call_id);
                }
            }
            PeerEvent::ConnectionState(state) => self.on_connection_state(state).await,
        }
    }

    async fn on_connection_state(&mut self, conn_state: PeerConnectionState) {
        let Some(attempt) = self.attempt.as_mut() else {
            return;
        };
        attempt.last_conn_state = conn_state;
        let seq = attempt.seq;
        let call_id = attempt.call_id.clone();
        match conn_state {
            PeerConnectionState::Connected => {
                if self.state() == SessionState::Connecting {
                    self.set_state(SessionState::InCall, Some(call_id));
                }
            }
            PeerConnectionState::Failed => {
                warn!(call_id = %call_id, "peer connection failed");
                let attempt = self.attempt.take().unwrap();
                self.terminate_and_finish(
                    attempt,
                    EndReason::ConnectionFailed,
                    SessionState::Failed,
                )
                .await;
            }
            PeerConnectionState::Disconnected => {
                debug!(call_id = %call_id, "peer connection disconnected, grace started");
                let tx = self.internal_tx.clone();
                let grace = self.config.connection_grace();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = tx.send(InternalEvent::DisconnectGrace { seq });
                });
            }
            _ => {}
        }
    }

    async fn on_ring_timeout(&mut self, seq: u64) {
        if self.attempt_seq() != Some(seq) {
            return;
        }
        let state = self.state();
        if !matches!(
            state,
            SessionState::OutgoingRinging | SessionState::IncomingRinging
        ) {
            return;
        }
        let attempt = self.attempt.take().unwrap();
        info!(call_id = %attempt.call_id, "ring timed out");
        self.terminate_and_finish(attempt, EndReason::Timeout, SessionState::Ended)
            .await;
    }

    async fn on_disconnect_grace(&mut self, seq: u64) {
        if self.attempt_seq() != Some(seq) {
            return;
        }
        let still_disconnected = self
            .attempt
            .as_ref()
            .map(|a| a.last_conn_state == PeerConnectionState::Disconnected)
            .unwrap_or(false);
        if !still_disconnected
            || !matches!(
                self.state(),
                SessionState::Connecting | SessionState::InCall
            )
        {
            return;
        }
        let attempt = self.attempt.take().unwrap();
        warn!(call_id = %attempt.call_id, "peer connection did not recover within grace");
        self.terminate_and_finish(attempt, EndReason::ConnectionFailed, SessionState::Failed)
            .await;
    }

    // ---- shared helpers -------------------------------------------------

    async fn write_local_candidate(&mut self, candidate: serde_json::Value) {
        let Some(attempt) = self.attempt.as_ref() else {
            return;
        };
        let call_id = attempt.call_id.clone();
        let patch = match attempt.direction {
            CallDirection::Outgoing => {
                RecordPatch::default().with_caller_candidates(vec![candidate])
            }
            CallDirection::Incoming => {
                RecordPatch::default().with_callee_candidates(vec![candidate])
            }
        };
        match self
            .update_with_retry(&call_id, patch, UpdateCondition::StatusNot(CallStatus::Ended))
            .await
        {
            Ok(UpdateOutcome::Applied) => {}
            Ok(UpdateOutcome::Conflict) => {
                debug!(call_id = %call_id, "candidate write after end, dropped");
            }
            Err(e) => {
                warn!(call_id = %call_id, "candidate write failed: {}", e);
                if let Some(attempt) = self.attempt.take() {
                    self.terminate_and_finish(
                        attempt,
                        EndReason::SignalingFailed,
                        SessionState::Failed,
                    )
                    .await;
                }
            }
        }
    }

    async fn update_with_retry(
        &self,
        call_id: &str,
        patch: RecordPatch,
        condition: UpdateCondition,
    ) -> Result<UpdateOutcome, CallError> {
        let attempts = self.config.signaling_write_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.store.update(call_id, patch.clone(), condition).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    warn!(call_id, attempt, "record write failed: {}", e);
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                    }
                }
            }
        }
        Err(CallError::SignalingWrite(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "record write failed".to_string()),
        ))
    }

    /// End the attempt from this device: write the termination (whoever got
    /// there first wins), release media, and settle the terminal state.
    async fn terminate_and_finish(
        &mut self,
        mut attempt: ActiveAttempt,
        reason: EndReason,
        final_state: SessionState,
    ) {
        let ended_by = attempt.my_side();
        let call_id = attempt.call_id.clone();
        if let Some(reply) = attempt.pending_dial.take() {
            let _ = reply.send(Ok(call_id.clone()));
        }
        attempt.release_media().await;
        if attempt.record.is_some() {
            if let Err(e) = self.guard.terminate(&call_id, ended_by, reason).await {
                warn!(call_id = %call_id, "termination write failed: {}", e);
            }
        }
        self.set_state(final_state, Some(call_id.clone()));
        self.emit(SessionEvent::Ended {
            call_id,
            reason: Some(reason),
            ended_by: Some(ended_by),
            timestamp: get_timestamp(),
        });
    }

    fn arm_ring_timer(&self, seq: u64) {
        let tx = self.internal_tx.clone();
        let timeout = self.config.ring_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(InternalEvent::RingTimeout { seq });
        });
    }

    fn spawn_peer_forwarder(&self, seq: u64, mut rx: PeerEventReceiver) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if tx.send(InternalEvent::Peer { seq, event }).is_err() {
                    break;
                }
            }
        });
    }

    async fn shutdown(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            debug!(call_id = %attempt.call_id, "loop stopping with an active call, hanging up");
            self.terminate_and_finish(attempt, EndReason::Hangup, SessionState::Ended)
                .await;
        }
    }
}

async fn dial_setup(
    media: MediaAdapterRef,
    store: CallRecordStoreRef,
    identity: Identity,
    callee_id: ProfileId,
    call_id: CallId,
    peer_tx: PeerEventSender,
    attempts: u32,
) -> Result<DialSetup, CallError> {
    let local = media.acquire_local_media().await.map_err(CallError::from)?;
    let session = match media.create_session(local.clone(), peer_tx).await {
        Ok(session) => session,
        Err(e) => {
            local.release().await;
            return Err(e.into());
        }
    };
    let offer = match session.create_offer().await {
        Ok(offer) => offer,
        Err(e) => {
            session.close().await;
            local.release().await;
            return Err(e.into());
        }
    };
    let record = CallRecord::ringing(
        call_id,
        identity.profile_id.clone(),
        identity.role,
        callee_id,
        offer,
    );
    let mut last_err = None;
    for attempt in 1..=attempts {
        match store.create(record.clone()).await {
            Ok(_) => {
                return Ok(DialSetup {
                    record,
                    local,
                    session,
                })
            }
            Err(e) => {
                warn!(call_id = %record.id, attempt, "record create failed: {}", e);
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
            }
        }
    }
    session.close().await;
    local.release().await;
    Err(CallError::SignalingWrite(
        last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "record create failed".to_string()),
    ))
}

async fn accept_setup(
    media: MediaAdapterRef,
    offer: Option<serde_json::Value>,
    peer_tx: PeerEventSender,
) -> Result<AcceptSetup, CallError> {
    let offer = offer.ok_or_else(|| {
        CallError::RemoteDescription("ringing record carries no offer".to_string())
    })?;
    let local = media.acquire_local_media().await.map_err(CallError::from)?;
    let session = match media.create_session(local.clone(), peer_tx).await {
        Ok(session) => session,
        Err(e) => {
            local.release().await;
            return Err(e.into());
        }
    };
    let step = async {
        session.set_remote_description(offer).await?;
        session.create_answer().await
    };
    match step.await {
        Ok(answer) => Ok(AcceptSetup {
            answer,
            local,
            session,
        }),
        Err(e) => {
            session.close().await;
            local.release().await;
            Err(e.into())
        }
    }
}
