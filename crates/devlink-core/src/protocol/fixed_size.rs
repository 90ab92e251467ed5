//! Fixed-size framing: every package is exactly `N` bytes on the wire.

use std::fmt;
use std::num::NonZeroUsize;

use super::decoder::{BodyBuilder, DecodeError, DecodeOutcome, PackageDecoder};
use crate::domain::package::Package;

/// Emits one package per `size` bytes.
///
/// The decoder holds no state between calls: until `size` bytes are
/// available it consumes nothing.
pub struct FixedSizeDecoder<P> {
    size: NonZeroUsize,
    build: BodyBuilder<P>,
}

impl<P: Package> FixedSizeDecoder<P> {
    /// Creates a decoder for frames of exactly `size` bytes.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::num::NonZeroUsize;
    /// use devlink_core::{DecodeOutcome, PackageDecoder, RawPackage};
    /// use devlink_core::protocol::FixedSizeDecoder;
    ///
    /// let size = NonZeroUsize::new(4).unwrap();
    /// let mut decoder = FixedSizeDecoder::new(size, |body| Ok(RawPackage::new("meter", body.to_vec())));
    ///
    /// assert!(matches!(decoder.try_decode(b"abc"), Ok(DecodeOutcome::Incomplete { consumed: 0, .. })));
    /// assert!(matches!(decoder.try_decode(b"abcde"), Ok(DecodeOutcome::Complete { consumed: 4, .. })));
    /// ```
    pub fn new(
        size: NonZeroUsize,
        build: impl FnMut(&[u8]) -> Result<P, DecodeError> + Send + 'static,
    ) -> Self {
        Self {
            size,
            build: Box::new(build),
        }
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }
}

impl<P: Package> PackageDecoder for FixedSizeDecoder<P> {
    type Item = P;

    fn try_decode(&mut self, window: &[u8]) -> Result<DecodeOutcome<P>, DecodeError> {
        let size = self.size.get();
        if window.len() < size {
            return Ok(DecodeOutcome::need_more(window.len()));
        }

        let package = (self.build)(&window[..size])?;
        Ok(DecodeOutcome::Complete {
            package,
            consumed: size,
        })
    }
}

impl<P> fmt::Debug for FixedSizeDecoder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedSizeDecoder")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
