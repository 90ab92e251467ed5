//! devlink-server library entry point.
//!
//! Re-exports all public modules so that integration tests in `tests/`
//! and the binary entry point in `main.rs` share the same module tree.
//!
//! # Architecture overview
//!
//! ```text
//! device ──bytes──▶ Channel ──▶ PackageReader / MQTT codec
//!                                   │
//!                          SessionDriver (decoder or MQTT engine)
//!                                   │ packages
//!                       DeviceSession queue ──▶ PackageHandler
//!                                   │
//!                SessionRegistry ◀──┴──▶ IdleReaper
//! ```
//!
//! - **`application`** – transport-independent session machinery: the
//!   channel and session contracts, the device session lifecycle, the
//!   registry, the idle reaper and the MQTT protocol engine.
//! - **`infrastructure`** – TCP, WebSocket and MQTT channels, the accept
//!   loops, and TOML configuration.

pub mod application;
pub mod infrastructure;
