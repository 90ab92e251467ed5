//! Channel contracts.
//!
//! A [`Channel`] is the send side of one live connection plus the bits of
//! state the rest of the server looks at (id, peer, last activity).  The
//! receive side is a [`PackageSource`], owned by exactly one session, so
//! reads need no lock.

use std::net::SocketAddr;

use async_trait::async_trait;
use devlink_core::mqtt::CodecError;
use devlink_core::FramingError;
use thiserror::Error;
use tokio::time::Instant;

/// Errors raised by channel reads and writes.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel has been closed; no further reads or writes happen.
    #[error("channel is closed")]
    Closed,

    /// The operation needs a data path that is not attached yet.
    #[error("channel is not ready: {0}")]
    InvalidState(&'static str),

    /// The payload cannot be sent in the configured frame type (non-UTF-8
    /// bytes on a text WebSocket).
    #[error("payload is not valid UTF-8 and cannot be sent as a text frame")]
    InvalidPayload,

    /// More undecoded bytes arrived than the maximum package length allows.
    #[error("package too long: {buffered} bytes buffered, limit is {max}")]
    PackageTooLong { buffered: usize, max: usize },

    #[error("framing error: {0}")]
    Framing(FramingError),

    #[error("MQTT codec error: {0}")]
    Codec(CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

impl From<FramingError> for ChannelError {
    fn from(e: FramingError) -> Self {
        match e {
            FramingError::PackageTooLong { buffered, max } => Self::PackageTooLong { buffered, max },
            other => Self::Framing(other),
        }
    }
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::PacketTooLarge { size, max } => Self::PackageTooLong {
                buffered: size,
                max,
            },
            other => Self::Codec(other),
        }
    }
}

/// Send side of one live connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Unique connection id (a UUID v4 string).
    fn channel_id(&self) -> &str;

    /// Remote peer address, when the transport has one.
    fn endpoint(&self) -> Option<SocketAddr>;

    /// When bytes were last received.  Starts at channel creation.
    fn last_active(&self) -> Instant;

    fn is_closed(&self) -> bool;

    /// Sends `data` as one unit.  Concurrent senders are serialized so frames
    /// never interleave.
    ///
    /// # Errors
    ///
    /// [`ChannelError::Closed`] once the channel is closed,
    /// [`ChannelError::InvalidState`] before a data path is attached.
    async fn send(&self, data: &[u8]) -> Result<(), ChannelError>;

    /// Closes both directions.  Idempotent.
    async fn close(&self);
}

/// Receive side: yields decoded packages in arrival order.
#[async_trait]
pub trait PackageSource<P>: Send {
    /// Next package, or `Ok(None)` once the peer has gone away.
    async fn next_package(&mut self) -> Result<Option<P>, ChannelError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
