//! In-memory byte pipe with watermark back-pressure.
//!
//! A WebSocket delivers whole messages while decoders want a byte stream.
//! The WebSocket pump writes message payloads into a [`BytePipe`] and the
//! package source reads them back out.  When the buffer reaches the high
//! watermark the writer is paused until the reader drains it below the low
//! watermark.

use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio::sync::Notify;

pub const DEFAULT_HIGH_WATERMARK: usize = 64 * 1024;
pub const DEFAULT_LOW_WATERMARK: usize = 32 * 1024;

#[derive(Debug, Default)]
struct PipeState {
    buf: BytesMut,
    closed: bool,
    paused: bool,
}

#[derive(Debug)]
pub struct BytePipe {
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
    high: usize,
    low: usize,
}

impl Default for BytePipe {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATERMARK, DEFAULT_LOW_WATERMARK)
    }
}

impl BytePipe {
    /// # Panics
    ///
    /// Panics if `low` is not below `high`.
    pub fn new(high: usize, low: usize) -> Self {
        assert!(low < high, "low watermark must be below the high watermark");
        Self {
            state: Mutex::new(PipeState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
            high,
            low,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `data`, first waiting while the writer is paused.
    ///
    /// Returns `false` if the pipe is closed and the data was dropped.
    pub async fn write(&self, data: &[u8]) -> bool {
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return false;
                }
                if !state.paused {
                    state.buf.extend_from_slice(data);
                    if state.buf.len() >= self.high {
                        state.paused = true;
                    }
                    drop(state);
                    self.readable.notify_one();
                    return true;
                }
            }
            self.writable.notified().await;
        }
    }

    /// Takes up to `max` buffered bytes, waiting for data.
    ///
    /// Returns `None` once the pipe is closed and drained.
    pub async fn read(&self, max: usize) -> Option<Bytes> {
        loop {
            {
                let mut state = self.lock();
                if !state.buf.is_empty() {
                    let n = state.buf.len().min(max);
                    let chunk = state.buf.split_to(n).freeze();
                    let resume = state.paused && state.buf.len() < self.low;
                    if resume {
                        state.paused = false;
                    }
                    drop(state);
                    if resume {
                        self.writable.notify_one();
                    }
                    return Some(chunk);
                }
                if state.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Stops the pipe.  Pending and future writes fail; the reader drains
    /// what is buffered and then sees end of stream.
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_one();
        self.writable.notify_one();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    pub fn buffered(&self) -> usize {
        self.lock().buf.len()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
