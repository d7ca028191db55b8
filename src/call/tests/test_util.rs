use crate::call::{CallSessionBuilder, CallSessionHandle, SessionState};
use crate::callrecord::CallRecordStoreRef;
use crate::config::Config;
use crate::error::MediaError;
use crate::event::{EventReceiver, SessionEvent};
use crate::media::{
    CandidatePayload, LocalMedia, MediaAdapter, MediaSession, PeerEvent, PeerEventSender,
    SdpPayload,
};
use crate::{CallerRole, Identity};
use async_trait::async_trait;
use serde_json::json;
use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct FakeLocal {
    released: AtomicBool,
}

impl FakeLocal {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalMedia for FakeLocal {
    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct FakeSession {
    events: Mutex<Option<PeerEventSender>>,
    remote: Mutex<Option<SdpPayload>>,
    applied: Mutex<Vec<CandidatePayload>>,
    closed: AtomicBool,
}

impl FakeSession {
    fn new(events: PeerEventSender) -> Self {
        Self {
            events: Mutex::new(Some(events)),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn emit(&self, event: PeerEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn applied_candidates(&self) -> Vec<CandidatePayload> {
        self.applied.lock().unwrap().clone()
    }

    pub fn remote_description(&self) -> Option<SdpPayload> {
        self.remote.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn create_offer(&self) -> Result<SdpPayload, MediaError> {
        Ok(json!({"type": "offer", "sdp": "v=0 fake-offer"}))
    }

    async fn create_answer(&self) -> Result<SdpPayload, MediaError> {
        Ok(json!({"type": "answer", "sdp": "v=0 fake-answer"}))
    }

    async fn set_remote_description(&self, sdp: SdpPayload) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::Closed);
        }
        *self.remote.lock().unwrap() = Some(sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidatePayload) -> Result<(), MediaError> {
        self.applied.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().take();
    }
}

/// Scriptable media adapter: optional acquisition delay/failure, and every
/// created session kept around so tests can drive peer events and inspect
/// what the coordinator fed it.
pub struct FakeMedia {
    fail_acquire: AtomicBool,
    acquire_delay: Mutex<Option<Duration>>,
    locals: Mutex<Vec<Arc<FakeLocal>>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_acquire: AtomicBool::new(false),
            acquire_delay: Mutex::new(None),
            locals: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_acquire(&self) {
        self.fail_acquire.store(true, Ordering::SeqCst);
    }

    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.acquire_delay.lock().unwrap() = Some(delay);
    }

    pub fn last_session(&self) -> Arc<FakeSession> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session created yet")
    }

    pub fn last_local(&self) -> Arc<FakeLocal> {
        self.locals
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no local media acquired yet")
    }
}

#[async_trait]
impl MediaAdapter for FakeMedia {
    async fn acquire_local_media(&self) -> Result<Arc<dyn LocalMedia>, MediaError> {
        let delay = *self.acquire_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(MediaError::Acquisition("camera busy".to_string()));
        }
        let local = Arc::new(FakeLocal {
            released: AtomicBool::new(false),
        });
        self.locals.lock().unwrap().push(local.clone());
        Ok(local)
    }

    async fn create_session(
        &self,
        _local: Arc<dyn LocalMedia>,
        events: PeerEventSender,
    ) -> Result<Arc<dyn MediaSession>, MediaError> {
        let session = Arc::new(FakeSession::new(events));
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }
}

pub fn spawn_device(
    profile_id: &str,
    role: CallerRole,
    store: CallRecordStoreRef,
    config: &Config,
    cancel: &CancellationToken,
) -> (CallSessionHandle, Arc<FakeMedia>) {
    let media = FakeMedia::new();
    let handle = CallSessionBuilder::new(Identity::new(profile_id, role), store, media.clone())
        .with_config(config.clone())
        .with_cancel_token(cancel.clone())
        .spawn();
    (handle, media)
}

pub fn test_config() -> Config {
    Config {
        poll_interval_secs: 1,
        poll_lookback_secs: 60,
        ..Config::default()
    }
}

pub async fn wait_for_state(handle: &CallSessionHandle, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if handle.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "state {:?} not reached, still {:?}",
            state,
            handle.state()
        )
    });
}

pub async fn wait_for_event(
    rx: &mut EventReceiver,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event feed closed: {}", e),
            }
        }
    })
    .await
    .expect("event not observed in time")
}

pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
