//! Transport channels.
//!
//! - **`tcp`** – Raw TCP connections framed by a [`PackageDecoder`].
//! - **`websocket`** – WebSocket connections; message payloads are fed to a
//!   decoder through a watermark-bounded [`pipe::BytePipe`].
//! - **`mqtt`** – TCP connections speaking MQTT 3.1.1.
//!
//! [`PackageDecoder`]: devlink_core::PackageDecoder

pub mod mqtt;
pub mod pipe;
pub mod tcp;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bookkeeping every channel carries: identity, peer, liveness.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    id: String,
    endpoint: Option<SocketAddr>,
    closed: AtomicBool,
    last_active: Mutex<Instant>,
    token: CancellationToken,
}

impl ConnectionState {
    pub(crate) fn new(endpoint: Option<SocketAddr>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint,
            closed: AtomicBool::new(false),
            last_active: Mutex::new(Instant::now()),
            token: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn last_active(&self) -> Instant {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records that bytes just arrived.
    pub(crate) fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Flags the channel closed and wakes pending reads.  Returns `true`
    /// only for the call that actually closed it.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    /// Cancelled once the channel closes.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
