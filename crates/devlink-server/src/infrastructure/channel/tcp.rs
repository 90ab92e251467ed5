//! Raw TCP channel.
//!
//! The socket is split in two: the write half lives in the [`TcpChannel`]
//! behind an async mutex so concurrent sends never interleave, the read half
//! lives in the [`TcpPackageSource`] owned by the session's receive task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use devlink_core::{PackageDecoder, PackageReader};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::ConnectionState;
use crate::application::channel::{Channel, ChannelError, PackageSource};

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub struct TcpChannel {
    state: ConnectionState,
    writer: Mutex<Option<BoxedWriter>>,
}

impl TcpChannel {
    /// Wraps an accepted socket.
    pub fn from_tcp_stream<D: PackageDecoder>(
        stream: TcpStream,
        decoder: D,
        max_package_length: usize,
    ) -> (Arc<Self>, TcpPackageSource<D>) {
        let endpoint = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        Self::pair(reader, writer, endpoint, decoder, max_package_length)
    }

    /// Builds a channel over any reader/writer pair.
    pub fn pair<D, R, W>(
        reader: R,
        writer: W,
        endpoint: Option<SocketAddr>,
        decoder: D,
        max_package_length: usize,
    ) -> (Arc<Self>, TcpPackageSource<D, R>)
    where
        D: PackageDecoder,
        R: AsyncRead + Send + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let channel = Self::with_writer(writer, endpoint);
        let source = TcpPackageSource {
            channel: Arc::clone(&channel),
            reader,
            packages: PackageReader::new(decoder, max_package_length),
            buf: vec![0; READ_CHUNK],
        };
        (channel, source)
    }

    /// A channel that only writes; reads go through [`Self::read_some`].
    pub(crate) fn with_writer<W>(writer: W, endpoint: Option<SocketAddr>) -> Arc<Self>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(Self {
            state: ConnectionState::new(endpoint),
            writer: Mutex::new(Some(Box::new(writer))),
        })
    }

    /// Reads from `reader` into `buf`, racing the channel's close.
    ///
    /// `Ok(None)` means the peer went away.  Every successful read counts as
    /// activity.
    pub(crate) async fn read_some<R>(&self, reader: &mut R, buf: &mut [u8]) -> Result<Option<usize>, ChannelError>
    where
        R: AsyncRead + Unpin,
    {
        if self.state.is_closed() {
            return Err(ChannelError::Closed);
        }
        let read = tokio::select! {
            biased;
            _ = self.state.token().cancelled() => return Err(ChannelError::Closed),
            read = reader.read(buf) => read,
        };
        match read {
            Ok(0) => Ok(None),
            Ok(n) => {
                self.state.touch();
                Ok(Some(n))
            }
            Err(e) if is_peer_gone(&e) => {
                debug!(channel_id = %self.state.id(), error = %e, "peer connection dropped");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Transport errors that just mean the peer is gone.
pub(crate) fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[async_trait]
impl Channel for TcpChannel {
    fn channel_id(&self) -> &str {
        self.state.id()
    }

    fn endpoint(&self) -> Option<SocketAddr> {
        self.state.endpoint()
    }

    fn last_active(&self) -> Instant {
        self.state.last_active()
    }

    fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.state.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(if self.state.is_closed() {
                ChannelError::Closed
            } else {
                ChannelError::InvalidState("no writer attached")
            });
        };
        tokio::select! {
            biased;
            _ = self.state.token().cancelled() => Err(ChannelError::Closed),
            written = async {
                writer.write_all(data).await?;
                writer.flush().await
            } => written.map_err(ChannelError::from),
        }
    }

    async fn close(&self) {
        if !self.state.mark_closed() {
            return;
        }
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(channel_id = %self.state.id(), error = %e, "shutdown after close failed");
            }
        }
        debug!(channel_id = %self.state.id(), "tcp channel closed");
    }
}

/// Read side of a [`TcpChannel`]: decodes packages from the byte stream.
pub struct TcpPackageSource<D, R = OwnedReadHalf> {
    channel: Arc<TcpChannel>,
    reader: R,
    packages: PackageReader<D>,
    buf: Vec<u8>,
}

impl<D: PackageDecoder, R> TcpPackageSource<D, R> {
    pub fn channel(&self) -> &Arc<TcpChannel> {
        &self.channel
    }
}

#[async_trait]
impl<D, R> PackageSource<D::Item> for TcpPackageSource<D, R>
where
    D: PackageDecoder,
    R: AsyncRead + Send + Unpin,
{
    async fn next_package(&mut self) -> Result<Option<D::Item>, ChannelError> {
        loop {
            match self.packages.next_package() {
                Ok(Some(package)) => return Ok(Some(package)),
                Ok(None) => {}
                Err(e) => {
                    self.channel.close().await;
                    return Err(e.into());
                }
            }

            let Some(n) = self.channel.read_some(&mut self.reader, &mut self.buf).await? else {
                return Ok(None);
            };
            if let Err(e) = self.packages.feed(&self.buf[..n]) {
                self.channel.close().await;
                return Err(e.into());
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
