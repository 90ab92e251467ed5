//! # devlink-core
//!
//! Shared library for devlink containing the package model, the resumable
//! byte-stream decoders, and the MQTT packet model.
//!
//! This crate has no dependencies on sockets or async runtimes; everything in
//! here can be driven from a unit test by handing it byte slices.
//!
//! # Architecture overview
//!
//! devlink is a device-connection server framework: many long-lived,
//! low-traffic connections (TCP, WebSocket, MQTT) are turned into typed
//! packages, one logical session per device identity.  This crate holds the
//! pieces that do not touch the network:
//!
//! - **`domain`** – What a decoded package is, the per-session property bag,
//!   and the vocabulary shared by sessions and listeners (close reasons,
//!   connection events).
//!
//! - **`protocol`** – How a byte stream becomes packages.  A
//!   [`PackageDecoder`] looks at the bytes received so far and either emits one
//!   package or reports how much it consumed and examined.  Three framing
//!   strategies are provided, plus a [`PackageReader`] that owns the growing
//!   byte window and enforces the maximum package length.
//!
//! - **`mqtt`** – The MQTT 3.1.1 / 5 packet model and its wire codec.

pub mod domain;
pub mod mqtt;
pub mod protocol;

pub use domain::lifecycle::{CloseReason, ConnectionEvent};
pub use domain::package::{Package, RawPackage};
pub use domain::properties::PropertyBag;
pub use protocol::decoder::{DecodeError, DecodeOutcome, PackageDecoder};
pub use protocol::reader::{FramingError, PackageReader, DEFAULT_MAX_PACKAGE_LENGTH};
