//! Decoded application packages.
//!
//! A package is the unit a decoder emits and a handler consumes.  Every
//! package names the device it came from; the first package on a connection
//! is what tells the server which device is on the other end.

use bytes::Bytes;

use crate::protocol::decoder::DecodeError;

/// One complete, decoded application-level unit.
///
/// Packages are immutable once built.  They are moved from the receive loop
/// to the handle loop through the session's hand-off queue, so they must be
/// `Send + 'static`.
pub trait Package: Send + 'static {
    /// Identity of the device that produced this package.
    fn device_key(&self) -> &str;

    /// Application payload carried by the package.
    fn payload(&self) -> &[u8];
}

/// A package made of a device key and an opaque payload.
///
/// Useful when the application does not need its own package type; the
/// `devlink-server` binary uses it for every framing it can be configured
/// with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPackage {
    device_key: String,
    payload: Bytes,
}

impl RawPackage {
    pub fn new(device_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            device_key: device_key.into(),
            payload: payload.into(),
        }
    }

    /// Builds a package from a frame body of the form `<device key><separator><payload>`.
    ///
    /// The key must be valid UTF-8 and non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::MalformedBody`] when the separator is missing,
    /// the key is empty, or the key is not UTF-8.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use devlink_core::{Package, RawPackage};
    ///
    /// let pkg = RawPackage::from_keyed_body(b"sensor-7:23.5", b':').unwrap();
    /// assert_eq!(pkg.device_key(), "sensor-7");
    /// assert_eq!(pkg.payload(), b"23.5");
    /// ```
    pub fn from_keyed_body(body: &[u8], separator: u8) -> Result<Self, DecodeError> {
        let split = body
            .iter()
            .position(|&b| b == separator)
            .ok_or_else(|| DecodeError::MalformedBody("missing device key separator".into()))?;

        let key = std::str::from_utf8(&body[..split])
            .map_err(|e| DecodeError::MalformedBody(format!("device key is not UTF-8: {e}")))?;
        if key.is_empty() {
            return Err(DecodeError::MalformedBody("empty device key".into()));
        }

        Ok(Self::new(key, Bytes::copy_from_slice(&body[split + 1..])))
    }

    /// Consumes the package, returning the payload buffer.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl Package for RawPackage {
    fn device_key(&self) -> &str {
        &self.device_key
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_keyed_body_splits_at_first_separator() {
        let pkg = RawPackage::from_keyed_body(b"dev-1:a:b", b':').unwrap();

        assert_eq!(pkg.device_key(), "dev-1");
        assert_eq!(pkg.payload(), b"a:b");
    }

    #[test]
    fn test_from_keyed_body_allows_empty_payload() {
        let pkg = RawPackage::from_keyed_body(b"dev-1:", b':').unwrap();
        assert!(pkg.payload().is_empty());
    }

    #[test]
    fn test_from_keyed_body_without_separator_is_malformed() {
        let result = RawPackage::from_keyed_body(b"no-separator", b':');
        assert!(matches!(result, Err(DecodeError::MalformedBody(_))));
    }

    #[test]
    fn test_from_keyed_body_with_empty_key_is_malformed() {
        let result = RawPackage::from_keyed_body(b":payload", b':');
        assert!(matches!(result, Err(DecodeError::MalformedBody(_))));
    }

    #[test]
    fn test_from_keyed_body_with_non_utf8_key_is_malformed() {
        let result = RawPackage::from_keyed_body(&[0xFF, 0xFE, b':', 1], b':');
        assert!(matches!(result, Err(DecodeError::MalformedBody(_))));
    }
}
