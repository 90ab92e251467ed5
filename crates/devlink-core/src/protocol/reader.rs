//! The caller side of the decoder contract.
//!
//! [`PackageReader`] owns the byte window a decoder works on.  Transports
//! [`feed`](PackageReader::feed) it whatever they read and then pull packages
//! out with [`next_package`](PackageReader::next_package) until it returns
//! `Ok(None)`.  Decoding is greedy: a read that delivered three packages
//! yields three packages before the transport reads again.
//!
//! The reader also enforces the maximum package length.  The window only
//! holds bytes the decoder has not consumed yet, so if it grows past the
//! limit the peer is sending something that will never decode within bounds
//! and the connection must be dropped.

use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::decoder::{DecodeError, DecodeOutcome, PackageDecoder};

/// Default cap on undecoded bytes held for one connection: 5 MiB.
pub const DEFAULT_MAX_PACKAGE_LENGTH: usize = 5 * 1024 * 1024;

/// Errors raised while framing a byte stream.  All of them are fatal for the
/// connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// The undecoded bytes exceed the configured maximum package length.
    #[error("package too long: {buffered} undecoded bytes exceed the limit of {max}")]
    PackageTooLong { buffered: usize, max: usize },

    /// The decoder rejected the bytes.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The decoder reported a package without consuming any bytes, which would
    /// make the reader emit the same package forever.
    #[error("decoder produced a package without consuming input")]
    NoProgress,
}

/// Buffers a byte stream and drives a [`PackageDecoder`] over it.
#[derive(Debug)]
pub struct PackageReader<D> {
    decoder: D,
    window: BytesMut,
    max_package_length: usize,
    /// Bytes at the front of `window` the decoder has already examined
    /// without finding a package.
    examined: usize,
}

impl<D: PackageDecoder> PackageReader<D> {
    pub fn new(decoder: D, max_package_length: usize) -> Self {
        Self {
            decoder,
            window: BytesMut::with_capacity(4096),
            max_package_length,
            examined: 0,
        }
    }

    /// Appends freshly read bytes to the window.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::PackageTooLong`] when the window would exceed
    /// the maximum package length.  The bytes are not appended in that case.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        let buffered = self.window.len() + bytes.len();
        if buffered > self.max_package_length {
            debug!(
                buffered,
                max = self.max_package_length,
                "undecoded bytes exceed the maximum package length"
            );
            return Err(FramingError::PackageTooLong {
                buffered,
                max: self.max_package_length,
            });
        }
        self.window.extend_from_slice(bytes);
        Ok(())
    }

    /// Decodes the next package from the window, if one is complete.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    ///
    /// # Errors
    ///
    /// Propagates decoder failures as [`FramingError::Decode`].
    pub fn next_package(&mut self) -> Result<Option<D::Item>, FramingError> {
        // Nothing new since the decoder last looked at everything.
        if self.window.is_empty() || (self.examined > 0 && self.window.len() <= self.examined) {
            return Ok(None);
        }

        match self.decoder.try_decode(&self.window)? {
            DecodeOutcome::Complete { package, consumed } => {
                if consumed == 0 {
                    warn!("decoder returned a package without consuming input");
                    return Err(FramingError::NoProgress);
                }
                trace!(consumed, "package decoded");
                self.window.advance(consumed.min(self.window.len()));
                self.examined = 0;
                Ok(Some(package))
            }
            DecodeOutcome::Incomplete { consumed, examined } => {
                let consumed = consumed.min(self.window.len());
                // Noise before a frame start, or a begin mark already matched.
                if consumed > 0 {
                    debug!(consumed, buffered = self.window.len(), "dropped bytes without a package");
                }
                self.window.advance(consumed);
                self.examined = examined.saturating_sub(consumed);
                Ok(None)
            }
        }
    }

    /// Number of undecoded bytes currently held.
    pub fn buffered(&self) -> usize {
        self.window.len()
    }

    pub fn max_package_length(&self) -> usize {
        self.max_package_length
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
