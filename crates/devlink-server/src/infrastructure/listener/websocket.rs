//! WebSocket listener.
//!
//! Upgrade requests are matched against the configured paths; requests for
//! any other path are answered with HTTP 404 and never become sessions.

use std::net::SocketAddr;
use std::sync::Arc;

use devlink_core::PackageDecoder;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::{accept_loop, ServerContext};
use crate::application::session::{serve_session, DecoderDriver, DeviceSession};
use crate::infrastructure::channel::websocket::{MessageType, WsChannel};

#[derive(Debug, Clone, Default)]
pub struct WebSocketOptions {
    /// Accepted upgrade paths; empty accepts any.
    pub paths: Vec<String>,
    pub message_type: MessageType,
}

/// True if an upgrade for `path` is allowed.
pub fn path_allowed(paths: &[String], path: &str) -> bool {
    paths.is_empty() || paths.iter().any(|p| p == path)
}

/// Runs the upgrade handshake, refusing unknown paths with 404.
async fn upgrade(stream: TcpStream, paths: &[String]) -> Result<WebSocketStream<TcpStream>, WsError> {
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if path_allowed(paths, request.uri().path()) {
            Ok(response)
        } else {
            let mut refusal = ErrorResponse::new(None);
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };
    tokio_tungstenite::accept_hdr_async(stream, check_path).await
}

/// Serves WebSocket connections on `listener` until `shutdown` is
/// cancelled.
///
/// The upgrade handshake must finish within the session's identity
/// timeout.
///
/// # Errors
///
/// Returns an error only if the listener's local address cannot be read.
pub async fn serve_websocket<D, F>(
    listener: TcpListener,
    make_decoder: F,
    options: WebSocketOptions,
    ctx: ServerContext<D::Item>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    D: PackageDecoder + 'static,
    F: Fn() -> anyhow::Result<D> + Send + Sync + 'static,
{
    let paths: Arc<[String]> = options.paths.into();
    let message_type = options.message_type;

    accept_loop(listener, shutdown, "websocket", |stream, peer| {
        let decoder = match make_decoder() {
            Ok(decoder) => decoder,
            Err(e) => {
                error!(%peer, error = %e, "could not build decoder, dropping connection");
                return;
            }
        };
        let paths = Arc::clone(&paths);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            serve_connection(stream, peer, &paths, message_type, decoder, ctx).await;
        });
    })
    .await
}

async fn serve_connection<D: PackageDecoder + 'static>(
    stream: TcpStream,
    peer: SocketAddr,
    paths: &[String],
    message_type: MessageType,
    decoder: D,
    ctx: ServerContext<D::Item>,
) {
    let ws = match tokio::time::timeout(ctx.session.identity_timeout, upgrade(stream, paths)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "websocket upgrade refused or failed");
            return;
        }
        Err(_) => {
            debug!(%peer, "websocket upgrade timed out");
            return;
        }
    };

    let (channel, source) = WsChannel::from_websocket(ws, Some(peer), message_type, decoder, ctx.max_package_length);
    let session = DeviceSession::new(channel, DecoderDriver::new(source), ctx.handler, ctx.session);
    serve_session(session, &ctx.registry).await;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_path_list_allows_everything() {
        assert!(path_allowed(&[], "/"));
        assert!(path_allowed(&[], "/anything"));
    }

    #[test]
    fn test_only_listed_paths_are_allowed() {
        let paths = vec!["/devices".to_string(), "/meters".to_string()];

        assert!(path_allowed(&paths, "/devices"));
        assert!(path_allowed(&paths, "/meters"));
        assert!(!path_allowed(&paths, "/"));
        assert!(!path_allowed(&paths, "/devices/extra"));
    }
}
