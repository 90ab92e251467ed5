//! Session lifecycle vocabulary: why a session closed, and which connection
//! event a registry listener is being told about.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a session was closed.
///
/// A session records the first reason it is closed with; later close calls
/// (for example the registry's disconnect after the peer already hung up) do
/// not overwrite it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// The peer closed the connection or the transport reported end-of-stream.
    RemoteClose,
    /// The server closed the connection: protocol violation, malformed
    /// framing, or an oversized package.
    ServerClose,
    /// The server is shutting down.
    ServerShutdown,
    /// The idle reaper found no traffic for longer than the idle timeout.
    Timeout,
    /// A newer session for the same device identity replaced this one.
    SessionExpired,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::RemoteClose => "remote close",
            Self::ServerClose => "server close",
            Self::ServerShutdown => "server shutdown",
            Self::Timeout => "idle timeout",
            Self::SessionExpired => "session expired",
        };
        f.write_str(s)
    }
}

/// Event delivered to registry listeners.
///
/// Events are never persisted.  Delivery is best effort: each listener gets
/// each event at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// A device identity was registered for the first time.
    Connect,
    /// A device identity was removed from the registry.
    Disconnect,
    /// A new session replaced a still-registered session for the same identity.
    Reconnect,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Reconnect => "reconnect",
        };
        f.write_str(s)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
