//! Storage infrastructure: the TOML configuration file.
//!
//! The `config` sub-module defines the file schema with its defaults, turns
//! the framing section into decoders, and validates what serde cannot.

pub mod config;
