//! Incremental NDJSON line decoder for agent output.
//!
//! Frames on `\n` with [`tokio_util::codec::AnyDelimiterCodec`] and a
//! configurable maximum line length, so an unterminated or oversized line
//! from a misbehaving agent cannot exhaust memory. Lines are framed as bytes
//! and converted lossily, so invalid UTF-8 never costs a whole event.
//!
//! Bytes are fed in arbitrary chunks; only newline-terminated lines are
//! returned. The incomplete trailing fragment stays buffered until more
//! bytes arrive or [`LineDecoder::finish`] flushes it once at process exit.
//!
//! # Examples
//!
//! ```rust
//! use agent_relay::exec::decoder::LineDecoder;
//!
//! let mut decoder = LineDecoder::new();
//! assert!(decoder.feed(b"{\"type\":").is_empty());
//! assert_eq!(decoder.feed(b"\"init\"}\n{\"ty"), vec!["{\"type\":\"init\"}".to_owned()]);
//! assert_eq!(decoder.finish(), Some("{\"ty".to_owned()));
//! ```

use bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};
use tracing::warn;

/// Maximum accepted line length: 16 MiB.
///
/// Tool results embedded in agent events can be large; anything beyond this
/// is discarded up to the next newline.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Append-only line buffer that yields complete lines.
#[derive(Debug)]
pub struct LineDecoder {
    codec: AnyDelimiterCodec,
    max_length: usize,
    buffer: BytesMut,
    finished: bool,
}

impl LineDecoder {
    /// Create a decoder with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a decoder with a custom line-length limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            codec: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
            max_length,
            buffer: BytesMut::new(),
            finished: false,
        }
    }

    /// Append `bytes` and return every line completed by them, in order.
    ///
    /// Line terminators (`\n`, `\r\n`) are stripped. Empty lines are
    /// returned as empty strings; callers skip them when parsing.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        if self.finished {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(line)) => lines.push(to_line(&line)),
                Ok(None) => break,
                Err(err) => self.log_codec_error(&err),
            }
        }
        lines
    }

    /// Flush the retained fragment as one final candidate line.
    ///
    /// Called once when the process exits. The fragment is returned at most
    /// once and is discarded afterwards regardless of what the caller does
    /// with it.
    pub fn finish(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        self.finished = true;

        let result = match self.codec.decode_eof(&mut self.buffer) {
            Ok(line) => line.map(|l| to_line(&l)).filter(|l| !l.trim().is_empty()),
            Err(err) => {
                self.log_codec_error(&err);
                None
            }
        };
        self.buffer.clear();
        result
    }

    /// Longest line accepted, in bytes.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Number of bytes currently retained as an incomplete fragment.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    fn log_codec_error(&self, err: &AnyDelimiterCodecError) {
        match err {
            AnyDelimiterCodecError::MaxChunkLengthExceeded => {
                warn!(
                    max_bytes = self.max_length,
                    "agent output line too long, discarding"
                );
            }
            AnyDelimiterCodecError::Io(io_err) => {
                warn!(error = %io_err, "agent output decode error");
            }
        }
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip a trailing `\r` and decode, replacing invalid UTF-8.
fn to_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
