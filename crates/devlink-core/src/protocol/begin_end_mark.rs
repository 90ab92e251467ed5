//! Delimiter framing: a package body sits between a begin mark and an end mark.
//!
//! ```text
//!   garbage   begin     body      end
//! [ x x x x | < < | a b c d e | > > ] ...
//! ```
//!
//! Anything before the begin mark is discarded.  Once the begin mark is found
//! the decoder remembers it (and consumes it), so a frame split over several
//! reads is never searched for its begin mark twice.  The end-mark search is
//! also resumed where the previous call stopped.

use std::fmt;

use super::decoder::{find_subsequence, BodyBuilder, DecodeError, DecodeOutcome, PackageDecoder};
use crate::domain::package::Package;

pub struct BeginEndMarkDecoder<P> {
    begin: Vec<u8>,
    end: Vec<u8>,
    build: BodyBuilder<P>,
    found_begin: bool,
    /// Leading body bytes already known not to start an end mark.
    scanned: usize,
}

impl<P: Package> BeginEndMarkDecoder<P> {
    /// Creates a decoder for bodies framed by `begin` and `end`.
    ///
    /// # Errors
    ///
    /// [`DecodeError::EmptyMark`] if either mark is empty.
    pub fn new(
        begin: impl Into<Vec<u8>>,
        end: impl Into<Vec<u8>>,
        build: impl FnMut(&[u8]) -> Result<P, DecodeError> + Send + 'static,
    ) -> Result<Self, DecodeError> {
        let begin = begin.into();
        let end = end.into();
        if begin.is_empty() {
            return Err(DecodeError::EmptyMark("begin"));
        }
        if end.is_empty() {
            return Err(DecodeError::EmptyMark("end"));
        }

        Ok(Self {
            begin,
            end,
            build: Box::new(build),
            found_begin: false,
            scanned: 0,
        })
    }

    /// True while the decoder sits between a begin mark and its end mark.
    pub fn is_inside_frame(&self) -> bool {
        self.found_begin
    }

    fn reset(&mut self) {
        self.found_begin = false;
        self.scanned = 0;
    }

    /// Searches `body` (which starts `offset` bytes into the window) for the end mark.
    fn scan_for_end(&mut self, body: &[u8], offset: usize) -> Result<DecodeOutcome<P>, DecodeError> {
        let from = self.scanned.min(body.len());

        match find_subsequence(&body[from..], &self.end) {
            Some(relative) => {
                let end_at = from + relative;
                let consumed = offset + end_at + self.end.len();
                self.reset();
                let package = (self.build)(&body[..end_at])?;
                Ok(DecodeOutcome::Complete { package, consumed })
            }
            None => {
                // The last `end.len() - 1` bytes could be the start of a split end mark.
                self.scanned = (body.len() + 1).saturating_sub(self.end.len()).max(from);
                Ok(DecodeOutcome::Incomplete {
                    consumed: offset,
                    examined: offset + body.len(),
                })
            }
        }
    }
}

impl<P: Package> PackageDecoder for BeginEndMarkDecoder<P> {
    type Item = P;

    fn try_decode(&mut self, window: &[u8]) -> Result<DecodeOutcome<P>, DecodeError> {
        if self.found_begin {
            return self.scan_for_end(window, 0);
        }

        if window.len() < self.begin.len() {
            return Ok(DecodeOutcome::need_more(window.len()));
        }

        match find_subsequence(window, &self.begin) {
            Some(at) => {
                self.found_begin = true;
                self.scanned = 0;
                let body_start = at + self.begin.len();
                self.scan_for_end(&window[body_start..], body_start)
            }
            None => {
                // Garbage.  Keep only a tail that might be the first half of a begin mark.
                let keep = self.begin.len() - 1;
                Ok(DecodeOutcome::Incomplete {
                    consumed: window.len() - keep,
                    examined: window.len(),
                })
            }
        }
    }
}

impl<P> fmt::Debug for BeginEndMarkDecoder<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeginEndMarkDecoder")
            .field("begin", &self.begin)
            .field("end", &self.end)
            .field("found_begin", &self.found_begin)
            .field("scanned", &self.scanned)
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::package::RawPackage;

    fn angle() -> BeginEndMarkDecoder<RawPackage> {
        BeginEndMarkDecoder::new(b"<".to_vec(), b">".to_vec(), |body| {
            Ok(RawPackage::new("marked", body.to_vec()))
        })
        .unwrap()
    }

    fn expect_package(outcome: DecodeOutcome<RawPackage>) -> (RawPackage, usize) {
        match outcome {
            DecodeOutcome::Complete { package, consumed } => (package, consumed),
            other => panic!("expected a package, got {other:?}"),
        }
    }

    #[test]
    fn test_single_frame_decodes_body_between_marks() {
        let mut d = angle();

        let (pkg, consumed) = expect_package(d.try_decode(b"<abc>").unwrap());

        assert_eq!(pkg.payload(), b"abc");
        assert_eq!(consumed, 5);
        assert!(!d.is_inside_frame());
    }

    #[test]
    fn test_split_frame_decodes_identically() {
        // Arrange: first read carries "<ab"
        let mut d = angle();
        let first = d.try_decode(b"<ab").unwrap();

        // Assert: begin mark consumed and remembered, body retained
        assert_eq!(
            first,
            DecodeOutcome::Incomplete {
                consumed: 1,
                examined: 3
            }
        );
        assert!(d.is_inside_frame());

        // Act: the caller drops the consumed byte and appends "c>"
        let (pkg, consumed) = expect_package(d.try_decode(b"abc>").unwrap());

        // Assert
        assert_eq!(pkg.payload(), b"abc");
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_window_without_begin_mark_discards_everything() {
        let mut d = angle();

        assert_eq!(
            d.try_decode(b"garbage").unwrap(),
            DecodeOutcome::Incomplete {
                consumed: 7,
                examined: 7
            }
        );
        assert!(!d.is_inside_frame());
    }

    #[test]
    fn test_garbage_before_begin_mark_is_consumed_with_frame() {
        let mut d = angle();

        let (pkg, consumed) = expect_package(d.try_decode(b"xx<hi>rest").unwrap());

        assert_eq!(pkg.payload(), b"hi");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_empty_window_needs_more() {
        let mut d = angle();
        assert_eq!(d.try_decode(b"").unwrap(), DecodeOutcome::need_more(0));
    }

    #[test]
    fn test_empty_body_decodes() {
        let mut d = angle();
        let (pkg, consumed) = expect_package(d.try_decode(b"<>").unwrap());
        assert!(pkg.payload().is_empty());
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_multibyte_marks_split_across_reads() {
        // Arrange: "##" begin, "$$" end
        let mut d = BeginEndMarkDecoder::new(b"##".to_vec(), b"$$".to_vec(), |body| {
            Ok(RawPackage::new("m", body.to_vec()))
        })
        .unwrap();

        // Act 1: only the first half of the begin mark plus garbage
        let first = d.try_decode(b"zz#").unwrap();
        // Assert: the possible partial mark is retained
        assert_eq!(
            first,
            DecodeOutcome::Incomplete {
                consumed: 2,
                examined: 3
            }
        );

        // Act 2: begin mark completes, body arrives, end mark is split
        let second = d.try_decode(b"##data$").unwrap();
        assert_eq!(
            second,
            DecodeOutcome::Incomplete {
                consumed: 2,
                examined: 7
            }
        );

        // Act 3: the rest of the end mark arrives
        let (pkg, consumed) = expect_package(d.try_decode(b"data$$").unwrap());

        // Assert
        assert_eq!(pkg.payload(), b"data");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_end_scan_resumes_without_rescanning() {
        let mut d = angle();
        let _ = d.try_decode(b"<0123456789").unwrap();

        // Everything after the begin mark has been scanned once.
        assert_eq!(d.scanned, 10);

        let (pkg, _) = expect_package(d.try_decode(b"0123456789AB>").unwrap());
        assert_eq!(pkg.payload(), b"0123456789AB");
    }

    #[test]
    fn test_state_resets_between_frames() {
        let mut d = angle();
        let (_, consumed) = expect_package(d.try_decode(b"<a><b>").unwrap());
        assert_eq!(consumed, 3);

        let (pkg, consumed) = expect_package(d.try_decode(b"<b>").unwrap());
        assert_eq!(pkg.payload(), b"b");
        assert_eq!(consumed, 3);
    }

    #[test]
    fn test_empty_marks_are_rejected() {
        let build = |body: &[u8]| Ok(RawPackage::new("m", body.to_vec()));

        let no_begin = BeginEndMarkDecoder::new(Vec::new(), b">".to_vec(), build).unwrap_err();
        let no_end = BeginEndMarkDecoder::new(b"<".to_vec(), Vec::new(), build).unwrap_err();

        assert_eq!(no_begin, DecodeError::EmptyMark("begin"));
        assert_eq!(no_end, DecodeError::EmptyMark("end"));
    }
}
