//! Fixed-header framing with a length field.
//!
//! ```text
//! +------------+-----------+--------+----------------------+
//! | begin mark |  offset   | length |        body          |
//! | (optional) | (N bytes) | 2/4/8  |  (length bytes)      |
//! +------------+-----------+--------+----------------------+
//! ```
//!
//! Parsing is a four-phase state machine.  Each phase consumes its bytes as
//! soon as it completes and the phase is remembered across calls, so a header
//! split over several reads is never parsed twice.  In particular the body
//! length lives in the `Body` phase itself: once the length field has been
//! read it is not read again, however many reads the body takes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::decoder::{find_subsequence, BodyBuilder, DecodeError, DecodeOutcome, PackageDecoder};
use crate::domain::package::Package;

/// Byte order of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// Width of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthWidth {
    #[default]
    U16,
    U32,
    U64,
}

impl LengthWidth {
    /// Number of bytes the field occupies on the wire.
    pub fn bytes(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }

    /// Builds a width from a byte count (2, 4 or 8).
    pub fn from_bytes(n: usize) -> Option<Self> {
        match n {
            2 => Some(Self::U16),
            4 => Some(Self::U32),
            8 => Some(Self::U64),
            _ => None,
        }
    }

    fn read(self, field: &[u8], endian: Endian) -> u64 {
        let field = &field[..self.bytes()];
        let accumulate = |acc: u64, b: &u8| (acc << 8) | u64::from(*b);
        match endian {
            Endian::Big => field.iter().fold(0, accumulate),
            Endian::Little => field.iter().rev().fold(0, accumulate),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    BeginMark,
    Offset,
    Length,
    Body { len: usize },
}

pub struct FixedHeaderDecoder<P> {
    begin: Vec<u8>,
    offset: usize,
    width: LengthWidth,
    endian: Endian,
    build: BodyBuilder<P>,
    phase: Phase,
}

impl<P: Package> FixedHeaderDecoder<P> {
    /// Creates a decoder with no begin mark and no offset: every frame is a
    /// length field followed by the body.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use devlink_core::{DecodeOutcome, PackageDecoder, RawPackage};
    /// use devlink_core::protocol::{Endian, FixedHeaderDecoder, LengthWidth};
    ///
    /// let mut decoder = FixedHeaderDecoder::new(LengthWidth::U16, Endian::Big, |body| {
    ///     Ok(RawPackage::new("meter", body.to_vec()))
    /// })
    /// .with_begin_mark(*b"\xAA\x55")
    /// .with_offset(1);
    ///
    /// let frame = [0xAA, 0x55, 0x01, 0x00, 0x02, b'o', b'k'];
    /// assert!(matches!(decoder.try_decode(&frame), Ok(DecodeOutcome::Complete { consumed: 7, .. })));
    /// ```
    pub fn new(
        width: LengthWidth,
        endian: Endian,
        build: impl FnMut(&[u8]) -> Result<P, DecodeError> + Send + 'static,
    ) -> Self {
        Self {
            begin: Vec::new(),
            offset: 0,
            width,
            endian,
            build: Box::new(build),
            phase: Phase::BeginMark,
        }
    }

    /// Requires every frame to start with `mark`.  Bytes before the mark are
    /// discarded.
    pub fn with_begin_mark(mut self, mark: impl Into<Vec<u8>>) -> Self {
        self.begin = mark.into();
        self
    }

    /// Skips `offset` bytes between the begin mark and the length field.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Body length announced by the current frame, once its length field has
    /// been read.
    pub fn pending_body_len(&self) -> Option<usize> {
        match self.phase {
            Phase::Body { len } => Some(len),
            _ => None,
        }
    }
}

impl<P: Package> PackageDecoder for FixedHeaderDecoder<P> {
    type Item = P;

    fn try_decode(&mut self, window: &[u8]) -> Result<DecodeOutcome<P>, DecodeError> {
        let need_more = |consumed: usize| {
            Ok(DecodeOutcome::Incomplete {
                consumed,
                examined: window.len(),
            })
        };
        let mut pos = 0;

        loop {
            let rest = &window[pos..];
            match self.phase {
                Phase::BeginMark => {
                    if self.begin.is_empty() {
                        self.phase = Phase::Offset;
                        continue;
                    }
                    if rest.len() < self.begin.len() {
                        return need_more(pos);
                    }
                    match find_subsequence(rest, &self.begin) {
                        Some(at) => {
                            pos += at + self.begin.len();
                            self.phase = Phase::Offset;
                        }
                        None => {
                            let keep = self.begin.len() - 1;
                            return need_more(window.len() - keep);
                        }
                    }
                }
                Phase::Offset => {
                    if rest.len() < self.offset {
                        return need_more(pos);
                    }
                    pos += self.offset;
                    self.phase = Phase::Length;
                }
                Phase::Length => {
                    let width = self.width.bytes();
                    if rest.len() < width {
                        return need_more(pos);
                    }
                    let value = self.width.read(rest, self.endian);
                    let len = usize::try_from(value).map_err(|_| DecodeError::LengthOverflow(value))?;
                    pos += width;
                    self.phase = Phase::Body { len };
                }
                Phase::Body { len } => {
                    if rest.len() < len {
                        return need_more(pos);
                    }
                    self.phase = Phase::BeginMark;
                    let package = (self.build)(&rest[..len])?;
                    return Ok(DecodeOutcome::Complete {
                        package,
                        consumed: pos + len,
                    });
                }
            }
        }
    }
}

impl<P> fmt::Debug for FixedHeaderDecoder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedHeaderDecoder")
            .field("begin", &self.begin)
            .field("offset", &self.offset)
            .field("width", &self.width)
            .field("endian", &self.endian)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
