//! devlink server entry point.
//!
//! Accepts long-lived device connections over raw TCP, WebSocket and MQTT,
//! turns their byte streams into packages and keeps one session per device.
//! Packages are logged; embedders wanting other behaviour plug their own
//! [`PackageHandler`] into the library.
//!
//! # Usage
//!
//! ```text
//! devlink-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>      Configuration file [default: devlink.toml]
//!   --tcp-bind <ADDR>    Enable the TCP listener on ADDR
//!   --ws-bind <ADDR>     Enable the WebSocket listener on ADDR
//!   --mqtt-bind <ADDR>   Enable the MQTT listener on ADDR
//!   --log-level <LEVEL>  Log level when RUST_LOG is unset
//!   --init               Write a default configuration file and exit
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable          | Default        | Description            |
//! |-------------------|----------------|------------------------|
//! | `DEVLINK_CONFIG`  | `devlink.toml` | Configuration file     |
//! | `RUST_LOG`        | config value   | `tracing` filter       |

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use devlink_core::mqtt::MqttPackage;
use devlink_core::{ConnectionEvent, Package, RawPackage};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use devlink_server::application::handler::PackageHandler;
use devlink_server::application::reaper::IdleReaper;
use devlink_server::application::registry::SessionRegistry;
use devlink_server::application::session::Session;
use devlink_server::infrastructure::listener::mqtt::serve_mqtt;
use devlink_server::infrastructure::listener::tcp::serve_tcp;
use devlink_server::infrastructure::listener::websocket::{serve_websocket, WebSocketOptions};
use devlink_server::infrastructure::listener::{bind, ServerContext};
use devlink_server::infrastructure::storage::config::{load_config, save_config, ServerConfig};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// devlink device-connection server.
#[derive(Debug, Parser)]
#[command(
    name = "devlink-server",
    about = "Device connection server for TCP, WebSocket and MQTT devices",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "devlink.toml", env = "DEVLINK_CONFIG")]
    config: PathBuf,

    /// Bind address for the TCP listener; enables it.
    #[arg(long)]
    tcp_bind: Option<String>,

    /// Bind address for the WebSocket listener; enables it.
    #[arg(long)]
    ws_bind: Option<String>,

    /// Bind address for the MQTT listener; enables it.
    #[arg(long)]
    mqtt_bind: Option<String>,

    /// `tracing` level used when `RUST_LOG` is not set.
    #[arg(long)]
    log_level: Option<String>,

    /// Write a default configuration to `--config` and exit.
    #[arg(long)]
    init: bool,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    fn apply_overrides(&self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = &self.tcp_bind {
            config.tcp.enabled = true;
            config.tcp.bind = bind.clone();
        }
        if let Some(bind) = &self.ws_bind {
            config.websocket.enabled = true;
            config.websocket.bind = bind.clone();
        }
        if let Some(bind) = &self.mqtt_bind {
            config.mqtt.enabled = true;
            config.mqtt.bind = bind.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config
    }
}

// ── Package handlers ──────────────────────────────────────────────────────────

/// Logs every package it receives.
struct LoggingHandler;

#[async_trait]
impl PackageHandler<RawPackage> for LoggingHandler {
    async fn handle(&self, session: &dyn Session, package: RawPackage) -> anyhow::Result<()> {
        info!(
            device_key = %package.device_key(),
            session_id = %session.session_id(),
            len = package.payload().len(),
            "package received"
        );
        Ok(())
    }
}

#[async_trait]
impl PackageHandler<MqttPackage> for LoggingHandler {
    async fn handle(&self, session: &dyn Session, package: MqttPackage) -> anyhow::Result<()> {
        info!(
            device_key = %package.device_key(),
            session_id = %session.session_id(),
            topic = %package.topic,
            qos = ?package.qos,
            len = package.payload.len(),
            "mqtt publish received"
        );
        Ok(())
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.init {
        if cli.config.exists() {
            anyhow::bail!("{} already exists", cli.config.display());
        }
        save_config(&cli.config, &ServerConfig::default())
            .with_context(|| format!("failed to write {}", cli.config.display()))?;
        println!("wrote default configuration to {}", cli.config.display());
        return Ok(());
    }

    let config = load_config(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let config = cli.apply_overrides(config);

    // ── Logging setup ─────────────────────────────────────────────────────────
    //
    // `RUST_LOG` wins; otherwise the configured level, otherwise `info`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&config.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    config.validate().context("invalid configuration")?;
    run(config).await
}

/// Starts every enabled listener and the idle reaper, then waits for Ctrl+C.
async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let registry = Arc::new(SessionRegistry::new());
    registry
        .register_listener(Arc::new(|session: Arc<dyn Session>, event: ConnectionEvent| async move {
            info!(device_key = %session.device_key(), endpoint = ?session.channel().endpoint(), %event, "connection event");
            Ok::<(), anyhow::Error>(())
        }))
        .await;

    let reaper = IdleReaper::new(
        Arc::clone(&registry),
        config.session.sweep_interval(),
        config.session.idle_timeout(),
    );
    reaper.start();

    let shutdown = CancellationToken::new();
    let handler = Arc::new(LoggingHandler);
    let options = config.session.session_options();
    let max_package_length = config.session.max_package_length;
    let mut listeners = JoinSet::new();

    if config.tcp.enabled {
        let listener = bind("tcp", &config.tcp.bind).await?;
        let framing = config.framing.clone();
        let ctx = ServerContext::<RawPackage> {
            registry: Arc::clone(&registry),
            handler: handler.clone(),
            session: options.clone(),
            max_package_length,
        };
        listeners.spawn(serve_tcp(
            listener,
            move || framing.build_decoder().map_err(anyhow::Error::from),
            ctx,
            shutdown.clone(),
        ));
    }

    if config.websocket.enabled {
        let listener = bind("websocket", &config.websocket.bind).await?;
        let framing = config.framing.clone();
        let ctx = ServerContext::<RawPackage> {
            registry: Arc::clone(&registry),
            handler: handler.clone(),
            session: options.clone(),
            max_package_length,
        };
        let ws_options = WebSocketOptions {
            paths: config.websocket.paths.clone(),
            message_type: config.websocket.message_type,
        };
        listeners.spawn(serve_websocket(
            listener,
            move || framing.build_decoder().map_err(anyhow::Error::from),
            ws_options,
            ctx,
            shutdown.clone(),
        ));
    }

    if config.mqtt.enabled {
        let listener = bind("mqtt", &config.mqtt.bind).await?;
        let ctx = ServerContext::<MqttPackage> {
            registry: Arc::clone(&registry),
            handler: handler.clone(),
            session: options.clone(),
            max_package_length,
        };
        listeners.spawn(serve_mqtt(listener, ctx, shutdown.clone()));
    }

    info!(listeners = listeners.len(), "devlink server started");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => info!("received Ctrl+C, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl+C, shutting down"),
        },
        Some(ended) = listeners.join_next() => {
            warn!(result = ?ended.map(|r| r.map_err(|e| format!("{e:#}"))), "listener stopped unexpectedly, shutting down");
        }
    }

    shutdown.cancel();
    while let Some(ended) = listeners.join_next().await {
        match ended {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %format!("{e:#}"), "listener failed"),
            Err(e) => error!(error = %e, "listener task panicked"),
        }
    }
    reaper.stop().await;

    info!("devlink server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
