//! Frame accumulation.
//!
//! Pure logic, no I/O: bytes go in as they arrive from the socket, and the
//! accumulator reports when the marker has been seen.

use bytes::BytesMut;
use thiserror::Error;

use super::{CLIENT_TOKEN, MARKER, MARKER_STR, SERVER_TOKEN};

/// Errors raised by [`FrameAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Content was requested before the marker arrived.
    #[error("frame is incomplete: marker not yet received")]
    Incomplete,
    /// The frame grew past the configured cap.
    #[error("frame exceeds maximum size of {limit} bytes ({size} bytes buffered)")]
    TooLarge { limit: usize, size: usize },
}

/// Buffers one connection's bytes until the marker is observed.
///
/// Received bytes are decoded as ASCII on the way in; anything above 0x7F
/// becomes `?`. The buffer therefore always holds valid UTF-8.
#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: BytesMut,
    /// Offset of the first marker byte, once found.
    marker_at: Option<usize>,
    /// Where the next marker search starts.
    scan_from: usize,
    max_frame_size: usize,
}

impl FrameAccumulator {
    /// Create an accumulator that rejects frames larger than `max_frame_size`
    /// bytes (content plus marker).
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            marker_at: None,
            scan_from: 0,
            max_frame_size,
        }
    }

    /// Append received bytes.
    ///
    /// Bytes received after the marker are kept (so they can be counted and
    /// logged) but never become part of the content.
    pub fn append(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.buffer.extend(data.iter().map(|&b| decode_ascii(b)));

        if self.marker_at.is_none() {
            self.marker_at = find_marker(&self.buffer[self.scan_from..]).map(|i| i + self.scan_from);
            // A marker may straddle this chunk and the next one.
            self.scan_from = self.buffer.len().saturating_sub(MARKER.len() - 1);
        }

        // Without a marker in the buffer, any future marker ends past the
        // current length, so the frame can no longer fit.
        let frame_len = match self.marker_at {
            Some(pos) => pos + MARKER.len(),
            None => self.buffer.len(),
        };
        if frame_len > self.max_frame_size {
            return Err(FrameError::TooLarge {
                limit: self.max_frame_size,
                size: frame_len,
            });
        }

        Ok(())
    }

    /// Whether the marker has been seen.
    pub fn is_complete(&self) -> bool {
        self.marker_at.is_some()
    }

    /// The reply text for the completed frame.
    pub fn extract_content(&self) -> Result<String, FrameError> {
        let end = self.marker_at.ok_or(FrameError::Incomplete)?;
        Ok(transform(&String::from_utf8_lossy(&self.buffer[..end])))
    }

    /// Bytes buffered after the first marker.
    pub fn trailing_len(&self) -> usize {
        match self.marker_at {
            Some(pos) => self.buffer.len() - (pos + MARKER.len()),
            None => 0,
        }
    }

    /// Total bytes buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/// Apply the reply rules to `text`: `Client` becomes `Server` and every
/// marker is removed.
pub fn transform(text: &str) -> String {
    text.replace(CLIENT_TOKEN, SERVER_TOKEN).replace(MARKER_STR, "")
}

fn decode_ascii(byte: u8) -> u8 {
    if byte.is_ascii() {
        byte
    } else {
        b'?'
    }
}

/// Find the marker in `buffer`, returning the offset of its first byte.
fn find_marker(buffer: &[u8]) -> Option<usize> {
    buffer.windows(MARKER.len()).position(|w| w == MARKER)
}
