use crate::{
    callrecord::{CallRecord, CallRecordStore, CallRecordStoreRef, CallStatus, RecordQuery},
    config::Config,
    CallId, ProfileId,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};


pub type SignalSender = mpsc::UnboundedSender<CallRecord>;
pub type SignalReceiver = mpsc::UnboundedReceiver<CallRecord>;
/// Asks the channel to forget its marks for live records and poll again.
/// The session loop sends this whenever it returns to a state that accepts
/// new calls, so a ring it ignored while busy can surface.
pub type RearmSender = mpsc::UnboundedSender<()>;

/// Cap on records pulled per poll; a device only ever has a handful of live
/// call attempts inside the lookback window.
const POLL_LIMIT: usize = 32;

/// The last record shape forwarded to the session loop. An observation is
/// only forwarded again when it advances the mark, so a poll re-discovering
/// a record the push feed already delivered stays silent.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ObservedMark {
    status: CallStatus,
    has_offer: bool,
    has_answer: bool,
    caller_candidates: usize,
    callee_candidates: usize,
    created_at: DateTime<Utc>,
}

impl ObservedMark {
    fn of(record: &CallRecord) -> Self {
        Self {
            status: record.status,
            has_offer: record.offer.is_some(),
            has_answer: record.answer.is_some(),
            caller_candidates: record.caller_candidates.len(),
            callee_candidates: record.callee_candidates.len(),
            created_at: record.created_at,
        }
    }

    fn advanced_by(&self, record: &CallRecord) -> bool {
        let next = Self::of(record);
        next.status != self.status
            || (next.has_offer && !self.has_offer)
            || (next.has_answer && !self.has_answer)
            || next.caller_candidates > self.caller_candidates
            || next.callee_candidates > self.callee_candidates
    }
}

/// Merges the push change feed with a polling fallback into one deduplicated
/// stream of record snapshots, keyed by record id. Records created before
/// the lookback window are deliberately never surfaced by the poll: a stale
/// ring is assumed already resolved or abandoned.
pub struct SignalingChannel {
    store: CallRecordStoreRef,
    profile_id: ProfileId,
    poll_interval: Duration,
    poll_lookback: Duration,
    tx: SignalSender,
    seen: HashMap<CallId, ObservedMark>,
    rearm_rx: mpsc::UnboundedReceiver<()>,
    rearm_open: bool,
    cancel_token: CancellationToken,
}

impl SignalingChannel {
    pub fn new(
        store: CallRecordStoreRef,
        profile_id: ProfileId,
        config: &Config,
        cancel_token: CancellationToken,
    ) -> (Self, SignalReceiver, RearmSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (rearm_tx, rearm_rx) = mpsc::unbounded_channel();
        let channel = Self {
            store,
            profile_id,
            poll_interval: config.poll_interval(),
            poll_lookback: config.poll_lookback(),
            tx,
            seen: HashMap::new(),
            rearm_rx,
            rearm_open: true,
            cancel_token,
        };
        (channel, rx, rearm_tx)
    }

    pub async fn serve(mut self) {
        let mut feed = self.store.subscribe();
        let mut poll = IntervalStream::new(tokio::time::interval(self.poll_interval));
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,
                change = feed.recv() => match change {
                    Ok(change) => self.consider(change.record),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(
                            profile_id = %self.profile_id,
                            missed,
                            "change feed lagged; poll fallback will recover"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(
                            profile_id = %self.profile_id,
                            "change feed closed; continuing on poll fallback only"
                        );
                        // Back off before resubscribing, but keep polling and
                        // stay responsive to cancellation in the meantime.
                        let backoff = tokio::time::sleep(self.poll_interval);
                        tokio::pin!(backoff);
                        loop {
                            tokio::select! {
                                _ = self.cancel_token.cancelled() => return,
                                _ = &mut backoff => break,
                                _ = poll.next() => self.poll_once().await,
                            }
                        }
                        feed = self.store.subscribe();
                    }
                },
                rearm = self.rearm_rx.recv(), if self.rearm_open => match rearm {
                    Some(()) => {
                        self.rearm();
                        self.poll_once().await;
                    }
                    None => self.rearm_open = false,
                },
                _ = poll.next() => self.poll_once().await,
            }
        }
    }

    /// Drop marks for records that are not ended so the next poll forwards
    /// them again. Ended marks stay: nothing can advance those records.
    fn rearm(&mut self) {
        self.seen.retain(|_, mark| mark.status == CallStatus::Ended);
    }

    async fn poll_once(&mut self) {
        let lookback = chrono::Duration::from_std(self.poll_lookback)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let cutoff = Utc::now() - lookback;
        let query = RecordQuery {
            participant: Some(self.profile_id.clone()),
            created_after: Some(cutoff),
            status: None,
            limit: Some(POLL_LIMIT),
        };
        match self.store.query(query).await {
            Ok(records) => {
                self.prune(cutoff);
                for record in records {
                    self.consider(record);
                }
            }
            Err(e) => {
                warn!(profile_id = %self.profile_id, "signaling poll failed: {}", e);
            }
        }
    }

    fn consider(&mut self, record: CallRecord) {
        if !record.involves(&self.profile_id) {
            return;
        }
        let advanced = match self.seen.get(&record.id) {
            Some(mark) => mark.advanced_by(&record),
            None => true,
        };
        if !advanced {
            debug!(
                call_id = %record.id,
                stale = true,
                "record observation already processed"
            );
            return;
        }
        self.seen.insert(record.id.clone(), ObservedMark::of(&record));
        if self.tx.send(record).is_err() {
            // Session loop gone; stop doing work.
            self.cancel_token.cancel();
        }
    }

    /// Drop marks for ended records that fell out of the lookback window;
    /// nothing can advance them and polling will never return them again.
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        self.seen
            .retain(|_, mark| !(mark.status == CallStatus::Ended && mark.created_at < cutoff));
    }
}
