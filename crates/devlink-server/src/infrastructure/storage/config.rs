//! TOML configuration for the devlink server.
//!
//! Every field has a default, so an empty file (or no file at all) is a
//! working configuration: a TCP listener on port 5000 framing packages
//! between STX and ETX bytes.
//!
//! ```toml
//! log_level = "debug"
//!
//! [session]
//! clear_idle_session_interval = 120   # seconds between idle sweeps
//! idle_session_timeout = 300          # seconds without traffic before close
//! max_package_length = 5242880        # bytes
//! identity_timeout = 120              # seconds to wait for the first package
//!
//! [framing]
//! kind = "fixed_header"
//! begin_mark = "$"
//! length_width = "u16"
//! endian = "big"
//! identity_separator = "|"
//!
//! [tcp]
//! bind = "0.0.0.0:5000"
//!
//! [websocket]
//! enabled = true
//! bind = "0.0.0.0:5080"
//! paths = ["/devices"]
//! message_type = "binary"
//!
//! [mqtt]
//! enabled = true
//! bind = "0.0.0.0:1883"
//! ```
//!
//! Fields missing from the file fall back to the `default_*` helpers below
//! through `#[serde(default = "...")]`.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devlink_core::protocol::{BeginEndMarkDecoder, Endian, FixedHeaderDecoder, FixedSizeDecoder, LengthWidth};
use devlink_core::{PackageDecoder, RawPackage, DEFAULT_MAX_PACKAGE_LENGTH};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::application::session::SessionOptions;
use crate::infrastructure::channel::websocket::MessageType;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The config parsed but its values are unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// `tracing` level used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub framing: FramingConfig,
    #[serde(default)]
    pub tcp: TcpConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
}

/// Session lifecycle limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    /// Seconds between idle-session sweeps.
    #[serde(default = "default_clear_idle_session_interval")]
    pub clear_idle_session_interval: u64,
    /// Seconds without inbound traffic after which a session is closed.
    #[serde(default = "default_idle_session_timeout")]
    pub idle_session_timeout: u64,
    /// Largest number of undecoded bytes (or MQTT packet size) accepted.
    #[serde(default = "default_max_package_length")]
    pub max_package_length: usize,
    /// Seconds a new connection may take to identify itself.
    #[serde(default = "default_identity_timeout")]
    pub identity_timeout: u64,
}

/// How TCP and WebSocket byte streams are cut into packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingKind {
    FixedSize,
    #[default]
    BeginEndMark,
    FixedHeader,
}

/// Framing for TCP and WebSocket listeners.
///
/// Every package body is `<device key><identity_separator><payload>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FramingConfig {
    #[serde(default)]
    pub kind: FramingKind,
    /// Frame size for `fixed_size`.
    #[serde(default)]
    pub size: usize,
    /// Start delimiter for `begin_end_mark`; optional sync mark for
    /// `fixed_header`.
    #[serde(default = "default_begin_mark")]
    pub begin_mark: String,
    /// End delimiter for `begin_end_mark`.
    #[serde(default = "default_end_mark")]
    pub end_mark: String,
    #[serde(default)]
    pub length_width: LengthWidth,
    #[serde(default)]
    pub endian: Endian,
    /// Bytes between the begin mark and the length field for `fixed_header`.
    #[serde(default)]
    pub offset: usize,
    /// Single ASCII character separating the device key from the payload.
    #[serde(default = "default_identity_separator")]
    pub identity_separator: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tcp_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_websocket_bind")]
    pub bind: String,
    /// Upgrade paths accepted; empty accepts any path.
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub message_type: MessageType,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_mqtt_bind")]
    pub bind: String,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_clear_idle_session_interval() -> u64 {
    120
}
fn default_idle_session_timeout() -> u64 {
    300
}
fn default_max_package_length() -> usize {
    DEFAULT_MAX_PACKAGE_LENGTH
}
fn default_identity_timeout() -> u64 {
    120
}
fn default_begin_mark() -> String {
    "\u{2}".to_string()
}
fn default_end_mark() -> String {
    "\u{3}".to_string()
}
fn default_identity_separator() -> String {
    "|".to_string()
}
fn default_true() -> bool {
    true
}
fn default_tcp_bind() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_websocket_bind() -> String {
    "0.0.0.0:5080".to_string()
}
fn default_mqtt_bind() -> String {
    "0.0.0.0:1883".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            session: SessionConfig::default(),
            framing: FramingConfig::default(),
            tcp: TcpConfig::default(),
            websocket: WebSocketConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            clear_idle_session_interval: default_clear_idle_session_interval(),
            idle_session_timeout: default_idle_session_timeout(),
            max_package_length: default_max_package_length(),
            identity_timeout: default_identity_timeout(),
        }
    }
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            kind: FramingKind::default(),
            size: 0,
            begin_mark: default_begin_mark(),
            end_mark: default_end_mark(),
            length_width: LengthWidth::default(),
            endian: Endian::default(),
            offset: 0,
            identity_separator: default_identity_separator(),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_tcp_bind(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_websocket_bind(),
            paths: Vec::new(),
            message_type: MessageType::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_mqtt_bind(),
        }
    }
}

// ── Derived values ────────────────────────────────────────────────────────────

impl SessionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.clear_idle_session_interval)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_session_timeout)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            identity_timeout: Duration::from_secs(self.identity_timeout),
        }
    }
}

impl FramingConfig {
    fn separator(&self) -> Result<u8, ConfigError> {
        match self.identity_separator.as_bytes() {
            [b] if b.is_ascii() => Ok(*b),
            _ => Err(ConfigError::Invalid(format!(
                "framing.identity_separator must be one ASCII character, got {:?}",
                self.identity_separator
            ))),
        }
    }

    /// Builds a fresh decoder for one connection.  Packages are
    /// [`RawPackage`]s keyed by the bytes before the identity separator.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] if the framing parameters cannot describe a
    /// frame (zero size, empty marks, bad separator).
    pub fn build_decoder(&self) -> Result<Box<dyn PackageDecoder<Item = RawPackage>>, ConfigError> {
        let separator = self.separator()?;
        let build = move |body: &[u8]| RawPackage::from_keyed_body(body, separator);

        let decoder: Box<dyn PackageDecoder<Item = RawPackage>> = match self.kind {
            FramingKind::FixedSize => {
                let size = NonZeroUsize::new(self.size).ok_or_else(|| {
                    ConfigError::Invalid("framing.size must be greater than zero".into())
                })?;
                Box::new(FixedSizeDecoder::new(size, build))
            }
            FramingKind::BeginEndMark => Box::new(
                BeginEndMarkDecoder::new(self.begin_mark.as_bytes(), self.end_mark.as_bytes(), build)
                    .map_err(|e| ConfigError::Invalid(format!("framing: {e}")))?,
            ),
            FramingKind::FixedHeader => Box::new(
                FixedHeaderDecoder::new(self.length_width, self.endian, build)
                    .with_begin_mark(self.begin_mark.as_bytes())
                    .with_offset(self.offset),
            ),
        };
        Ok(decoder)
    }
}

fn parse_bind(section: &str, bind: &str) -> Result<SocketAddr, ConfigError> {
    bind.parse()
        .map_err(|e| ConfigError::Invalid(format!("{section}.bind {bind:?} is not a socket address: {e}")))
}

impl ServerConfig {
    /// Checks the values serde cannot: non-zero limits, parsable bind
    /// addresses, usable framing, at least one listener.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        for (name, value) in [
            ("session.clear_idle_session_interval", s.clear_idle_session_interval),
            ("session.idle_session_timeout", s.idle_session_timeout),
            ("session.identity_timeout", s.identity_timeout),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if s.max_package_length == 0 {
            return Err(ConfigError::Invalid(
                "session.max_package_length must be greater than zero".into(),
            ));
        }

        if !(self.tcp.enabled || self.websocket.enabled || self.mqtt.enabled) {
            return Err(ConfigError::Invalid("no listener is enabled".into()));
        }
        if self.tcp.enabled {
            parse_bind("tcp", &self.tcp.bind)?;
        }
        if self.websocket.enabled {
            parse_bind("websocket", &self.websocket.bind)?;
            if let Some(bad) = self.websocket.paths.iter().find(|p| !p.starts_with('/')) {
                return Err(ConfigError::Invalid(format!(
                    "websocket.paths entry {bad:?} must start with '/'"
                )));
            }
        }
        if self.mqtt.enabled {
            parse_bind("mqtt", &self.mqtt.bind)?;
        }
        if self.tcp.enabled || self.websocket.enabled {
            self.framing.build_decoder()?;
        }
        Ok(())
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Loads the configuration at `path`, returning [`ServerConfig::default`] if
/// the file does not exist.  The result is not validated.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let cfg: ServerConfig = toml::from_str(&content)?;
            Ok(cfg)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfig::default()),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Writes `config` to `path`, creating parent directories as needed.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system failures or
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(path: &Path, config: &ServerConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
