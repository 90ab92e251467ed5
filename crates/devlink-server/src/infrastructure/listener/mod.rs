//! Accept loops.
//!
//! Each listener accepts connections until its shutdown token is cancelled
//! and hands every connection to a dedicated Tokio task that builds the
//! channel and the session and runs [`serve_session`] to completion.  One
//! slow or misbehaving device never delays the accept loop.
//!
//! [`serve_session`]: crate::application::session::serve_session

pub mod mqtt;
pub mod tcp;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use devlink_core::Package;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::application::handler::PackageHandler;
use crate::application::registry::SessionRegistry;
use crate::application::session::SessionOptions;

/// Pause after a failed `accept` (typically file-descriptor exhaustion).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// What every accepted connection needs to become a session.
pub struct ServerContext<P: Package> {
    pub registry: Arc<SessionRegistry>,
    pub handler: Arc<dyn PackageHandler<P>>,
    pub session: SessionOptions,
    pub max_package_length: usize,
}

impl<P: Package> Clone for ServerContext<P> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            handler: Arc::clone(&self.handler),
            session: self.session.clone(),
            max_package_length: self.max_package_length,
        }
    }
}

/// Binds a listener, naming the listener kind in the error.
///
/// # Errors
///
/// Returns an error if `bind` does not parse or the socket cannot be bound
/// (address in use, missing permission).
pub async fn bind(kind: &str, bind: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid {kind} bind address {bind:?}"))?;
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {kind} listener on {addr}"))
}

/// Accepts connections until `shutdown` is cancelled, calling
/// `on_connection` for each.  `on_connection` must not block.
pub(crate) async fn accept_loop<F>(
    listener: TcpListener,
    shutdown: CancellationToken,
    kind: &'static str,
    mut on_connection: F,
) -> anyhow::Result<()>
where
    F: FnMut(TcpStream, SocketAddr),
{
    let local = listener
        .local_addr()
        .with_context(|| format!("{kind} listener has no local address"))?;
    info!(%local, kind, "listening");

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, kind, "connection accepted");
                on_connection(stream, peer);
            }
            Err(e) => {
                error!(kind, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }

    info!(%local, kind, "listener stopped");
    Ok(())
}
