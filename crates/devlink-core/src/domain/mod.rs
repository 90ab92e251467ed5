//! Domain types shared by every transport.

pub mod lifecycle;
pub mod package;
pub mod properties;

pub use lifecycle::{CloseReason, ConnectionEvent};
pub use package::{Package, RawPackage};
pub use properties::PropertyBag;
