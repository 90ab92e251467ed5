//! Raw TCP listener.

use std::sync::Arc;

use devlink_core::PackageDecoder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::{accept_loop, ServerContext};
use crate::application::session::{serve_session, DecoderDriver, DeviceSession};
use crate::infrastructure::channel::tcp::TcpChannel;

/// Serves framed TCP connections on `listener` until `shutdown` is
/// cancelled.  `make_decoder` is called once per connection.
///
/// # Errors
///
/// Returns an error only if the listener's local address cannot be read.
pub async fn serve_tcp<D, F>(
    listener: TcpListener,
    make_decoder: F,
    ctx: ServerContext<D::Item>,
    shutdown: CancellationToken,
) -> anyhow::Result<()>
where
    D: PackageDecoder + 'static,
    F: Fn() -> anyhow::Result<D> + Send + Sync + 'static,
{
    accept_loop(listener, shutdown, "tcp", |stream, peer| {
        let decoder = match make_decoder() {
            Ok(decoder) => decoder,
            Err(e) => {
                error!(%peer, error = %e, "could not build decoder, dropping connection");
                return;
            }
        };
        let (channel, source) = TcpChannel::from_tcp_stream(stream, decoder, ctx.max_package_length);
        let session = DeviceSession::new(
            channel,
            DecoderDriver::new(source),
            Arc::clone(&ctx.handler),
            ctx.session.clone(),
        );
        let registry = Arc::clone(&ctx.registry);
        tokio::spawn(async move {
            serve_session(session, &registry).await;
        });
    })
    .await
}
