//! Infrastructure layer: sockets and files.
//!
//! Contains the transport adapters (TCP, WebSocket, MQTT channels), the
//! accept loops that turn incoming connections into sessions, and the TOML
//! configuration store.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `devlink_core`, but MUST NOT be imported by the `application` layer.

pub mod channel;
pub mod listener;
pub mod storage;
