//! Application layer: session lifecycle and protocol handling.
//!
//! Nothing in here opens a socket.  Transports are reached through the
//! [`channel::Channel`] and [`channel::PackageSource`] traits, which the
//! infrastructure layer implements for TCP, WebSocket and MQTT.
//!
//! # Sub-modules
//!
//! - **`channel`** – The send-side contract of a live connection and the
//!   receive-side package source.
//! - **`handler`** – Hooks the application plugs in: the package handler and
//!   connection-event listeners.
//! - **`session`** – The device session state machine and its drivers.
//! - **`registry`** – Device identity → live session, with replacement on
//!   reconnect.
//! - **`reaper`** – Periodic idle-session sweep.
//! - **`mqtt_engine`** – MQTT 3.1.1 server-side protocol state machine.

pub mod channel;
pub mod handler;
pub mod mqtt_engine;
pub mod reaper;
pub mod registry;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
