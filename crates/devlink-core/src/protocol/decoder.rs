//! The decoder contract.
//!
//! TCP and WebSocket deliver a byte stream, not messages: one read may carry
//! half a package, or three and a half.  A [`PackageDecoder`] is handed the
//! bytes accumulated so far (the *window*) and answers one of two things:
//!
//! - **Complete** – here is one package, and the first `consumed` bytes of
//!   the window belonged to it.
//! - **Incomplete** – no package yet.  The first `consumed` bytes can be
//!   dropped (garbage, or a header the decoder has already parsed and
//!   remembered), and the first `examined` bytes have been looked at, so there
//!   is no point calling again until more bytes arrive.
//!
//! Decoders keep state between calls.  The caller promises that after an
//! `Incomplete { consumed, .. }` the next window starts with the bytes that
//! followed `consumed`, extended by whatever arrived in the meantime.  The
//! [`PackageReader`](super::reader::PackageReader) keeps that promise.

use thiserror::Error;

use crate::domain::package::Package;

/// Errors a decoder can report.  Any of these is fatal for the connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A length field announced a body larger than this platform can address.
    #[error("length field value {0} is too large")]
    LengthOverflow(u64),

    /// The frame was delimited correctly but its body could not be turned
    /// into a package.
    #[error("malformed package body: {0}")]
    MalformedBody(String),

    /// A delimiter decoder was configured with an empty begin or end mark.
    #[error("{0} mark must not be empty")]
    EmptyMark(&'static str),
}

/// Result of one decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeOutcome<P> {
    /// One package was decoded from the first `consumed` bytes of the window.
    Complete { package: P, consumed: usize },
    /// More bytes are needed.  `consumed <= examined <= window.len()`.
    Incomplete { consumed: usize, examined: usize },
}

impl<P> DecodeOutcome<P> {
    /// "Need more data" without consuming anything.
    pub fn need_more(examined: usize) -> Self {
        Self::Incomplete {
            consumed: 0,
            examined,
        }
    }
}

/// A stateful, resumable parser turning a byte window into packages.
pub trait PackageDecoder: Send {
    /// The package type this decoder produces.
    type Item: Package;

    /// Attempts to decode one package from the start of `window`.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] when the bytes can never form a valid
    /// package; the caller treats this as fatal for the connection.
    fn try_decode(
        &mut self,
        window: &[u8],
    ) -> Result<DecodeOutcome<Self::Item>, DecodeError>;
}

impl<D> PackageDecoder for Box<D>
where
    D: PackageDecoder + ?Sized,
{
    type Item = D::Item;

    fn try_decode(
        &mut self,
        window: &[u8],
    ) -> Result<DecodeOutcome<Self::Item>, DecodeError> {
        (**self).try_decode(window)
    }
}

/// Turns a complete frame body into a package.
///
/// Every framing strategy takes one of these instead of requiring a subtype:
/// the strategy finds the body, the builder gives it meaning.
pub type BodyBuilder<P> = Box<dyn FnMut(&[u8]) -> Result<P, DecodeError> + Send>;

/// Searches `haystack` for `needle`, returning the index of its first byte.
pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
