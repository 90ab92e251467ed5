//! In-memory fakes shared by the application-layer unit tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use devlink_core::{CloseReason, Package, PropertyBag, RawPackage};
use tokio::sync::watch;
use tokio::time::Instant;

use super::channel::{Channel, ChannelError};
use super::handler::PackageHandler;
use super::session::{Session, SessionState};

/// Channel that records what is sent and lets a test move its clock.
pub struct FakeChannel {
    id: String,
    closed: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
    last_active: Mutex<Instant>,
}

impl FakeChannel {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            last_active: Mutex::new(Instant::now()),
        }
    }

    pub fn set_last_active(&self, at: Instant) {
        *self.last_active.lock().unwrap() = at;
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Channel for FakeChannel {
    fn channel_id(&self) -> &str {
        &self.id
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        None
    }

    fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Session stand-in for registry and reaper tests: running from the start,
/// closed synchronously.
pub struct FakeSession {
    key: String,
    channel: Arc<dyn Channel>,
    fake: Arc<FakeChannel>,
    properties: PropertyBag,
    state: watch::Sender<SessionState>,
    expired: AtomicBool,
    close_reason: OnceLock<CloseReason>,
}

impl FakeSession {
    pub fn new(session_id: &str, key: &str) -> Arc<Self> {
        let fake = Arc::new(FakeChannel::new(session_id));
        let (state, _) = watch::channel(SessionState::Running);
        Arc::new(Self {
            key: key.to_string(),
            channel: fake.clone(),
            fake,
            properties: PropertyBag::new(),
            state,
            expired: AtomicBool::new(false),
            close_reason: OnceLock::new(),
        })
    }

    pub fn fake_channel(&self) -> &FakeChannel {
        &self.fake
    }
}

#[async_trait]
impl Session for FakeSession {
    fn session_id(&self) -> &str {
        self.channel.channel_id()
    }

    fn device_key(&self) -> &str {
        &self.key
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    fn connected_at(&self) -> Option<SystemTime> {
        Some(SystemTime::UNIX_EPOCH)
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    fn mark_expired(&self) {
        self.expired.store(true, Ordering::SeqCst);
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    async fn close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.channel.close().await;
        self.state.send_replace(SessionState::Closed);
    }

    async fn closed(&self) {
        let mut rx = self.state.subscribe();
        loop {
            if *rx.borrow_and_update() == SessionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Handler that records payloads as strings.  A payload of `fail` returns an
/// error and `panic` panics, both after being recorded.
pub struct RecordingHandler {
    payloads: Mutex<Vec<String>>,
    gate: watch::Sender<bool>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            payloads: Mutex::new(Vec::new()),
            gate,
        }
    }
}

impl RecordingHandler {
    /// Holds every following `handle` call until [`Self::unblock`].
    pub fn block(&self) {
        self.gate.send_replace(false);
    }

    pub fn unblock(&self) {
        self.gate.send_replace(true);
    }

    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }

    /// Waits until at least `n` payloads were recorded.
    pub async fn wait_for(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.payloads.lock().unwrap().len() < n {
            assert!(Instant::now() < deadline, "handler saw {:?}", self.payloads());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn pass_gate(&self) {
        let mut rx = self.gate.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl PackageHandler<RawPackage> for RecordingHandler {
    async fn handle(&self, _session: &dyn Session, package: RawPackage) -> anyhow::Result<()> {
        self.pass_gate().await;
        let text = String::from_utf8_lossy(package.payload()).into_owned();
        self.payloads.lock().unwrap().push(text.clone());
        match text.as_str() {
            "fail" => anyhow::bail!("handler rejected package"),
            "panic" => panic!("handler blew up"),
            _ => Ok(()),
        }
    }
}
