//! Device session lifecycle.
//!
//! One [`DeviceSession`] wraps one connection.  It starts out knowing only the
//! channel id, waits (bounded) for the device to say who it is, and then runs
//! two tasks until the connection ends:
//!
//! - the **receive task** drives the [`SessionDriver`], which pulls packages
//!   off the transport and queues them;
//! - the **handle task** pops the queue and calls the application's
//!   [`PackageHandler`] once per package, in order.
//!
//! ```text
//! Created ─start()─▶ Starting ─▶ AwaitingIdentity ─identity─▶ Running
//!    │                                 │ timeout / EOF / error    │ close() / EOF / error
//!    │ close()                         ▼                          ▼
//!    └──────────────────────────────▶ Closed ◀──────────────── Closing
//! ```
//!
//! How packages are produced is the driver's business: [`DecoderDriver`]
//! reads them from a framed byte stream, the MQTT engine answers protocol
//! handshakes and turns PUBLISH packets into packages.  The lifecycle is the
//! same for both.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use devlink_core::{CloseReason, Package, PropertyBag};
use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ChannelError, PackageSource};
use super::handler::PackageHandler;
use super::registry::SessionRegistry;

/// Default bound on the wait for a device's first package: two minutes.
pub const DEFAULT_IDENTITY_TIMEOUT: Duration = Duration::from_secs(120);

/// Lifecycle states, in the only order a session moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Created,
    Starting,
    AwaitingIdentity,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::AwaitingIdentity => "awaiting_identity",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Errors that end a session's receive path.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The peer broke the protocol (wrong first packet, unexpected packet).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer identified itself but was turned away.
    #[error("connection refused: {0}")]
    Refused(String),
}

/// The view of a session shared with the registry, the reaper and handlers.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Stable id of this connection (the channel id).
    fn session_id(&self) -> &str;

    /// Device identity.  The channel id until the device has identified
    /// itself, then the discovered key.
    fn device_key(&self) -> &str;

    fn channel(&self) -> &Arc<dyn Channel>;

    fn properties(&self) -> &PropertyBag;

    /// Wall-clock time the session started running.
    fn connected_at(&self) -> Option<SystemTime>;

    /// Last time the device sent anything.
    fn last_heartbeat(&self) -> Instant {
        self.channel().last_active()
    }

    fn state(&self) -> SessionState;

    fn is_started(&self) -> bool {
        matches!(self.state(), SessionState::Running | SessionState::Closing)
    }

    fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// True once a newer session for the same device replaced this one.
    fn is_expired(&self) -> bool;

    fn mark_expired(&self);

    /// The first reason this session was closed for.
    fn close_reason(&self) -> Option<CloseReason>;

    /// Asks the session to close.  The first reason recorded wins; the
    /// session reaches [`SessionState::Closed`] asynchronously.
    async fn close(&self, reason: CloseReason);

    /// Resolves once the session is [`SessionState::Closed`].
    async fn closed(&self);
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub identity_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            identity_timeout: DEFAULT_IDENTITY_TIMEOUT,
        }
    }
}

// ── Drivers ───────────────────────────────────────────────────────────────────

/// Producer end of a session's package queue.
pub struct PackageSink<P> {
    tx: mpsc::UnboundedSender<P>,
}

impl<P> PackageSink<P> {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<P>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queues `package` for the handler.  False if the handle loop is gone.
    pub fn deliver(&self, package: P) -> bool {
        self.tx.send(package).is_ok()
    }
}

/// The protocol-specific half of a session.
#[async_trait]
pub trait SessionDriver<P: Package>: Send + 'static {
    /// Waits for the device to identify itself.  Packages produced on the way
    /// go to `sink`.  `Ok(None)` means the peer went away first.
    async fn identify(&mut self, sink: &PackageSink<P>) -> Result<Option<String>, SessionError>;

    /// Runs the receive path until the peer goes away (`Ok`) or fails.
    async fn pump(&mut self, sink: &PackageSink<P>) -> Result<(), SessionError>;
}

/// Drives a session from a decoded package stream.  The first package names
/// the device and is handled like any other.
pub struct DecoderDriver<S> {
    source: S,
}

impl<S> DecoderDriver<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<P, S> SessionDriver<P> for DecoderDriver<S>
where
    P: Package,
    S: PackageSource<P> + 'static,
{
    async fn identify(&mut self, sink: &PackageSink<P>) -> Result<Option<String>, SessionError> {
        let Some(package) = self.source.next_package().await? else {
            return Ok(None);
        };
        let key = package.device_key().to_owned();
        if key.is_empty() {
            return Err(SessionError::ProtocolViolation(
                "first package carries an empty device key".into(),
            ));
        }
        sink.deliver(package);
        Ok(Some(key))
    }

    async fn pump(&mut self, sink: &PackageSink<P>) -> Result<(), SessionError> {
        while let Some(package) = self.source.next_package().await? {
            if !sink.deliver(package) {
                break;
            }
        }
        Ok(())
    }
}

// ── DeviceSession ─────────────────────────────────────────────────────────────

pub struct DeviceSession<P: Package, D> {
    channel: Arc<dyn Channel>,
    handler: Arc<dyn PackageHandler<P>>,
    options: SessionOptions,
    properties: PropertyBag,
    device_key: OnceLock<String>,
    connected_at: OnceLock<SystemTime>,
    close_reason: OnceLock<CloseReason>,
    expired: AtomicBool,
    state: watch::Sender<SessionState>,
    start_lock: tokio::sync::Mutex<()>,
    driver: Mutex<Option<D>>,
    token: CancellationToken,
}

impl<P: Package, D: SessionDriver<P>> DeviceSession<P, D> {
    pub fn new(
        channel: Arc<dyn Channel>,
        driver: D,
        handler: Arc<dyn PackageHandler<P>>,
        options: SessionOptions,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::Created);
        Arc::new(Self {
            channel,
            handler,
            options,
            properties: PropertyBag::new(),
            device_key: OnceLock::new(),
            connected_at: OnceLock::new(),
            close_reason: OnceLock::new(),
            expired: AtomicBool::new(false),
            state,
            start_lock: tokio::sync::Mutex::new(()),
            driver: Mutex::new(Some(driver)),
            token: CancellationToken::new(),
        })
    }

    /// Waits for the device's identity and starts the receive and handle
    /// tasks.
    ///
    /// Returns `true` when the session is running.  Concurrent and repeated
    /// calls are safe: only the first does the work, later calls report its
    /// outcome.  On `false` the session is closed and its channel released.
    pub async fn start(self: &Arc<Self>) -> bool {
        let _guard = self.start_lock.lock().await;
        match self.state() {
            SessionState::Created => {}
            SessionState::Running => return true,
            _ => return false,
        }
        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut driver) = driver else {
            return false;
        };

        self.set_state(SessionState::Starting);
        let (sink, queue) = PackageSink::channel();
        self.set_state(SessionState::AwaitingIdentity);
        debug!(channel_id = %self.session_id(), "waiting for device identity");

        let timeout = self.options.identity_timeout;
        let identity = tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            outcome = tokio::time::timeout(timeout, driver.identify(&sink)) => Some(outcome),
        };

        let key = match identity {
            Some(Ok(Ok(Some(key)))) => key,
            Some(Ok(Ok(None))) => {
                info!(channel_id = %self.session_id(), "connection closed before identifying");
                self.abort_start(CloseReason::RemoteClose).await;
                return false;
            }
            Some(Ok(Err(SessionError::Refused(reason)))) => {
                info!(channel_id = %self.session_id(), %reason, "connection refused");
                self.abort_start(CloseReason::ServerClose).await;
                return false;
            }
            Some(Ok(Err(e))) => {
                warn!(channel_id = %self.session_id(), error = %e, "identification failed");
                self.abort_start(CloseReason::ServerClose).await;
                return false;
            }
            Some(Err(_)) => {
                warn!(channel_id = %self.session_id(), ?timeout, "no identity received in time");
                self.abort_start(CloseReason::Timeout).await;
                return false;
            }
            None => {
                self.abort_start(CloseReason::ServerClose).await;
                return false;
            }
        };

        let _ = self.device_key.set(key);
        let _ = self.connected_at.set(SystemTime::now());
        self.set_state(SessionState::Running);
        info!(
            device_key = %self.device_key(),
            channel_id = %self.session_id(),
            endpoint = ?self.channel.endpoint(),
            "session started"
        );

        self.spawn_handle_loop(queue);
        self.spawn_receive_loop(driver, sink);
        true
    }

    /// Forward-only state change; a session never leaves `Closed`.
    fn set_state(&self, next: SessionState) {
        self.state.send_if_modified(|current| {
            if next > *current {
                *current = next;
                true
            } else {
                false
            }
        });
    }

    fn record_close_reason(&self, reason: CloseReason) -> bool {
        self.close_reason.set(reason).is_ok()
    }

    async fn abort_start(&self, reason: CloseReason) {
        self.record_close_reason(reason);
        self.token.cancel();
        self.channel.close().await;
        self.set_state(SessionState::Closed);
    }

    fn spawn_handle_loop(self: &Arc<Self>, mut queue: mpsc::UnboundedReceiver<P>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(package) = queue.recv().await {
                session.dispatch(package).await;
            }
            debug!(device_key = %session.device_key(), "handle loop finished");
        });
    }

    async fn dispatch(&self, package: P) {
        debug!(device_key = %self.device_key(), len = package.payload().len(), "package received");
        let outcome = AssertUnwindSafe(self.handler.handle(self, package))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(device_key = %self.device_key(), error = %e, "package handler failed"),
            Err(_) => error!(device_key = %self.device_key(), "package handler panicked"),
        }
    }

    fn spawn_receive_loop(self: &Arc<Self>, mut driver: D, sink: PackageSink<P>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = session.token.cancelled() => None,
                result = driver.pump(&sink) => Some(result),
            };
            match outcome {
                None => {}
                Some(Ok(())) => {
                    session.record_close_reason(CloseReason::RemoteClose);
                }
                Some(Err(e)) => {
                    warn!(device_key = %session.device_key(), error = %e, "receive loop failed");
                    session.record_close_reason(CloseReason::ServerClose);
                }
            }

            session.set_state(SessionState::Closing);
            // Dropping the sink completes the queue; the handle loop drains
            // what is already queued and exits.
            drop(sink);
            drop(driver);
            session.token.cancel();
            session.channel.close().await;
            session.set_state(SessionState::Closed);
            info!(
                device_key = %session.device_key(),
                reason = ?session.close_reason(),
                "session closed"
            );
        });
    }
}

#[async_trait]
impl<P: Package, D: SessionDriver<P>> Session for DeviceSession<P, D> {
    fn session_id(&self) -> &str {
        self.channel.channel_id()
    }

    fn device_key(&self) -> &str {
        self.device_key
            .get()
            .map_or_else(|| self.channel.channel_id(), String::as_str)
    }

    fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    fn connected_at(&self) -> Option<SystemTime> {
        self.connected_at.get().copied()
    }

    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    fn mark_expired(&self) {
        self.expired.store(true, Ordering::Release);
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    async fn close(&self, reason: CloseReason) {
        if self.record_close_reason(reason) {
            debug!(device_key = %self.device_key(), %reason, "close requested");
        }
        match self.state() {
            SessionState::Created => {
                self.token.cancel();
                self.channel.close().await;
                self.set_state(SessionState::Closed);
            }
            SessionState::Running => {
                self.set_state(SessionState::Closing);
                self.token.cancel();
            }
            _ => self.token.cancel(),
        }
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

impl<P: Package, D> fmt::Debug for DeviceSession<P, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("channel_id", &self.channel.channel_id())
            .field("device_key", &self.device_key.get())
            .field("state", &*self.state.borrow())
            .field("close_reason", &self.close_reason.get())
            .finish_non_exhaustive()
    }
}

/// Runs one connection from start to finish: start the session, register it,
/// wait for it to close, and unregister it unless a newer session for the
/// same device has already taken its place.
///
/// Returns `false` if the session never started.
pub async fn serve_session<P, D>(session: Arc<DeviceSession<P, D>>, registry: &SessionRegistry) -> bool
where
    P: Package,
    D: SessionDriver<P>,
{
    if !session.start().await {
        return false;
    }

    let handle: Arc<dyn Session> = session.clone();
    registry.connect(Arc::clone(&handle)).await;
    session.closed().await;
    if !session.is_expired() {
        registry.disconnect_session(&handle).await;
    }
    true
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use devlink_core::RawPackage;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    use super::*;
    use crate::application::testing::{FakeChannel, RecordingHandler};

    /// What the scripted source yields next.
    enum Step {
        Package(RawPackage),
        Fail,
    }

    /// Package source fed from a test; dropping the sender ends the stream.
    struct ScriptedSource {
        steps: UnboundedReceiver<Step>,
    }

    #[async_trait]
    impl PackageSource<RawPackage> for ScriptedSource {
        async fn next_package(&mut self) -> Result<Option<RawPackage>, ChannelError> {
            match self.steps.recv().await {
                Some(Step::Package(p)) => Ok(Some(p)),
                Some(Step::Fail) => Err(ChannelError::Closed),
                None => Ok(None),
            }
        }
    }

    type TestSession = DeviceSession<RawPackage, DecoderDriver<ScriptedSource>>;

    fn session_with(
        options: SessionOptions,
    ) -> (Arc<TestSession>, UnboundedSender<Step>, Arc<FakeChannel>, Arc<RecordingHandler>) {
        let (tx, rx) = unbounded_channel();
        let channel = Arc::new(FakeChannel::new("chan-1"));
        let handler = Arc::new(RecordingHandler::default());
        let session = DeviceSession::new(
            channel.clone(),
            DecoderDriver::new(ScriptedSource { steps: rx }),
            handler.clone(),
            options,
        );
        (session, tx, channel, handler)
    }

    fn session() -> (Arc<TestSession>, UnboundedSender<Step>, Arc<FakeChannel>, Arc<RecordingHandler>) {
        session_with(SessionOptions::default())
    }

    fn pkg(key: &str, payload: &str) -> Step {
        Step::Package(RawPackage::new(key, payload.as_bytes().to_vec()))
    }

    async fn wait_closed(session: &TestSession) {
        timeout(Duration::from_secs(5), session.closed())
            .await
            .expect("session should close");
    }

    #[tokio::test]
    async fn test_first_package_identifies_and_is_handled() {
        // Arrange
        let (session, tx, _channel, handler) = session();
        assert_eq!(session.device_key(), "chan-1");
        tx.send(pkg("meter-7", "hello")).unwrap();

        // Act
        let started = session.start().await;

        // Assert
        assert!(started);
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(session.device_key(), "meter-7");
        assert_eq!(session.session_id(), "chan-1");
        assert!(session.connected_at().is_some());
        assert!(session.is_started());
        handler.wait_for(1).await;
        assert_eq!(handler.payloads(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics_do_not_stop_later_packages() {
        let (session, tx, _channel, handler) = session();
        tx.send(pkg("dev", "first")).unwrap();
        assert!(session.start().await);

        tx.send(pkg("dev", "fail")).unwrap();
        tx.send(pkg("dev", "panic")).unwrap();
        tx.send(pkg("dev", "last")).unwrap();

        handler.wait_for(4).await;
        assert_eq!(handler.payloads(), vec!["first", "fail", "panic", "last"]);
    }

    #[tokio::test]
    async fn test_end_of_stream_closes_with_remote_close() {
        let (session, tx, channel, _handler) = session();
        tx.send(pkg("dev", "x")).unwrap();
        assert!(session.start().await);

        drop(tx);
        wait_closed(&session).await;

        assert_eq!(session.close_reason(), Some(CloseReason::RemoteClose));
        assert!(session.is_closed());
        assert!(!session.is_started());
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_receive_error_closes_with_server_close() {
        let (session, tx, channel, _handler) = session();
        tx.send(pkg("dev", "x")).unwrap();
        assert!(session.start().await);

        tx.send(Step::Fail).unwrap();
        wait_closed(&session).await;

        assert_eq!(session.close_reason(), Some(CloseReason::ServerClose));
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_timeout_fails_start() {
        // Arrange: nothing is ever sent
        let (session, _tx, channel, handler) = session_with(SessionOptions {
            identity_timeout: Duration::from_secs(3),
        });

        // Act
        let started = session.start().await;

        // Assert
        assert!(!started);
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Timeout));
        assert!(channel.is_closed());
        assert!(handler.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_end_of_stream_before_identity_fails_start() {
        let (session, tx, _channel, _handler) = session();
        drop(tx);

        assert!(!session.start().await);
        assert_eq!(session.close_reason(), Some(CloseReason::RemoteClose));
    }

    #[tokio::test]
    async fn test_empty_device_key_is_rejected() {
        let (session, tx, channel, _handler) = session();
        tx.send(pkg("", "x")).unwrap();

        assert!(!session.start().await);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_close_records_first_reason_only() {
        let (session, tx, channel, _handler) = session();
        tx.send(pkg("dev", "x")).unwrap();
        assert!(session.start().await);

        session.close(CloseReason::Timeout).await;
        session.close(CloseReason::ServerShutdown).await;
        wait_closed(&session).await;

        assert_eq!(session.close_reason(), Some(CloseReason::Timeout));
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_close_before_start_prevents_start() {
        let (session, tx, channel, _handler) = session();
        tx.send(pkg("dev", "x")).unwrap();

        session.close(CloseReason::ServerShutdown).await;

        assert_eq!(session.state(), SessionState::Closed);
        assert!(channel.is_closed());
        assert!(!session.start().await);
    }

    #[tokio::test]
    async fn test_close_during_identity_wait_fails_start() {
        let (session, _tx, _channel, _handler) = session();

        let starter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.close(CloseReason::ServerShutdown).await;

        assert!(!starter.await.unwrap());
        assert_eq!(session.close_reason(), Some(CloseReason::ServerShutdown));
    }

    #[tokio::test]
    async fn test_concurrent_start_calls_agree() {
        let (session, tx, _channel, handler) = session();

        let a = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.start().await }
        });
        let b = tokio::spawn({
            let s = Arc::clone(&session);
            async move { s.start().await }
        });
        tx.send(pkg("dev", "once")).unwrap();

        assert!(a.await.unwrap());
        assert!(b.await.unwrap());
        handler.wait_for(1).await;
        assert_eq!(handler.payloads(), vec!["once"]);
    }

    #[tokio::test]
    async fn test_properties_are_per_session() {
        let (session, _tx, _channel, _handler) = session();
        session.properties().insert("firmware", "1.2.3".to_string());

        assert_eq!(session.properties().get::<String>("firmware").as_deref(), Some("1.2.3"));
        assert_eq!(session.properties().get::<u32>("firmware"), None);
    }

    #[tokio::test]
    async fn test_queued_packages_are_drained_after_close() {
        let (session, tx, _channel, handler) = session();
        handler.block();
        tx.send(pkg("dev", "a")).unwrap();
        assert!(session.start().await);
        tx.send(pkg("dev", "b")).unwrap();
        tx.send(pkg("dev", "c")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        session.close(CloseReason::ServerClose).await;
        wait_closed(&session).await;
        handler.unblock();

        handler.wait_for(3).await;
        assert_eq!(handler.payloads(), vec!["a", "b", "c"]);
    }
}
