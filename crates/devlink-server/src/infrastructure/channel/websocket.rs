//! WebSocket channel.
//!
//! Inbound text and binary message payloads are written, in order, into a
//! [`BytePipe`]; the [`WsPackageSource`] reads the pipe as a byte stream and
//! runs it through the configured decoder, so a package may span several
//! messages or share one.  Outbound data goes out as one message per send,
//! text or binary depending on [`MessageType`].

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use devlink_core::{PackageDecoder, PackageReader};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use super::pipe::BytePipe;
use super::ConnectionState;
use crate::application::channel::{Channel, ChannelError, PackageSource};

/// Bytes taken from the pipe per decode round.
const READ_CHUNK: usize = 8 * 1024;

/// Frame type used for outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Binary,
}

type WsSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

pub struct WsChannel {
    state: ConnectionState,
    sink: Mutex<Option<WsSink>>,
    message_type: MessageType,
    pipe: Arc<BytePipe>,
}

impl WsChannel {
    /// Wraps an upgraded WebSocket and starts pumping its inbound messages.
    pub fn from_websocket<S, D>(
        ws: WebSocketStream<S>,
        endpoint: Option<SocketAddr>,
        message_type: MessageType,
        decoder: D,
        max_package_length: usize,
    ) -> (Arc<Self>, WsPackageSource<D>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        D: PackageDecoder,
    {
        let (sink, stream) = ws.split();
        Self::from_parts(sink, stream, endpoint, message_type, decoder, max_package_length)
    }

    /// Builds a channel from a separate message sink and stream.
    pub fn from_parts<Si, St, D>(
        sink: Si,
        stream: St,
        endpoint: Option<SocketAddr>,
        message_type: MessageType,
        decoder: D,
        max_package_length: usize,
    ) -> (Arc<Self>, WsPackageSource<D>)
    where
        Si: Sink<Message, Error = WsError> + Send + 'static,
        St: Stream<Item = Result<Message, WsError>> + Send + Unpin + 'static,
        D: PackageDecoder,
    {
        let channel = Arc::new(Self {
            state: ConnectionState::new(endpoint),
            sink: Mutex::new(Some(Box::pin(sink))),
            message_type,
            pipe: Arc::new(BytePipe::default()),
        });
        tokio::spawn(pump_inbound(Arc::clone(&channel), stream));
        let source = WsPackageSource {
            channel: Arc::clone(&channel),
            packages: PackageReader::new(decoder, max_package_length),
        };
        (channel, source)
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

/// Copies inbound message payloads into the pipe until the socket or the
/// channel closes.  A full pipe stops reading from the socket.
async fn pump_inbound<St>(channel: Arc<WsChannel>, mut stream: St)
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let token = channel.state.token().clone();
    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = stream.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!(channel_id = %channel.state.id(), error = %e, "websocket read failed");
                break;
            }
            None => break,
        };
        // Control frames (ping, pong, close) do not count as activity.
        let data = match message {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(frame) => {
                debug!(channel_id = %channel.state.id(), ?frame, "websocket close received");
                break;
            }
            _ => continue,
        };
        if data.is_empty() {
            continue;
        }
        channel.state.touch();
        let written = tokio::select! {
            biased;
            _ = token.cancelled() => false,
            written = channel.pipe.write(&data) => written,
        };
        if !written {
            break;
        }
    }
    channel.pipe.close();
}

#[async_trait]
impl Channel for WsChannel {
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

    /// Sends `data` as one message.
    ///
    /// # Errors
    ///
    /// [`ChannelError::InvalidPayload`] if the channel sends text frames and
    /// `data` is not valid UTF-8.
    async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if self.state.is_closed() {
            return Err(ChannelError::Closed);
        }
        let message = match self.message_type {
            MessageType::Binary => Message::Binary(data.to_vec()),
            MessageType::Text => {
                let text = std::str::from_utf8(data).map_err(|_| ChannelError::InvalidPayload)?;
                Message::Text(text.to_owned())
            }
        };

        let mut guard = self.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(if self.state.is_closed() {
                ChannelError::Closed
            } else {
                ChannelError::InvalidState("no websocket attached")
            });
        };
        tokio::select! {
            biased;
            _ = self.state.token().cancelled() => Err(ChannelError::Closed),
            sent = sink.send(message) => sent.map_err(|e| ChannelError::WebSocket(e.to_string())),
        }
    }

    async fn close(&self) {
        if !self.state.mark_closed() {
            return;
        }
        self.pipe.close();
        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!(channel_id = %self.state.id(), error = %e, "websocket close handshake failed");
            }
        }
        debug!(channel_id = %self.state.id(), "websocket channel closed");
    }
}

/// Read side of a [`WsChannel`].
pub struct WsPackageSource<D> {
    channel: Arc<WsChannel>,
    packages: PackageReader<D>,
}

#[async_trait]
impl<D: PackageDecoder> PackageSource<D::Item> for WsPackageSource<D> {
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

            let Some(chunk) = self.channel.pipe.read(READ_CHUNK).await else {
                return Ok(None);
            };
            if let Err(e) = self.packages.feed(&chunk) {
                self.channel.close().await;
                return Err(e.into());
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
