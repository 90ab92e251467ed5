//! MQTT listener.

use std::sync::Arc;

use devlink_core::mqtt::MqttPackage;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::{accept_loop, ServerContext};
use crate::application::mqtt_engine::MqttEngine;
use crate::application::session::{serve_session, DeviceSession, Session};
use crate::infrastructure::channel::mqtt::{MqttChannel, MQTT_CHANNEL_PROPERTY};

/// Serves MQTT 3.1.1 and 5 connections on `listener` until `shutdown` is
/// cancelled.  Each session carries its [`MqttChannel`] as a property so
/// handlers can publish back to the device.
///
/// # Errors
///
/// Returns an error only if the listener's local address cannot be read.
pub async fn serve_mqtt(
    listener: TcpListener,
    ctx: ServerContext<MqttPackage>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    accept_loop(listener, shutdown, "mqtt", |stream, _peer| {
        let (channel, reader) = MqttChannel::from_tcp_stream(stream, ctx.max_package_length);
        let engine = MqttEngine::new(reader, channel.clone());
        let session = DeviceSession::new(
            channel.clone(),
            engine,
            Arc::clone(&ctx.handler),
            ctx.session.clone(),
        );
        session.properties().insert(MQTT_CHANNEL_PROPERTY, channel);
        let registry = Arc::clone(&ctx.registry);
        tokio::spawn(async move {
            serve_session(session, &registry).await;
        });
    })
    .await
}
