//! Splitting a WebSocket byte stream into JSON-RPC messages
//!
//! A frame from a stdio-bridged agent is not guaranteed to hold exactly one
//! document. Observed shapes:
//!
//! - one document per frame (the common case)
//! - several newline-delimited documents in one frame
//! - one document split across several frames
//! - log noise in front of a document
//!
//! [`FrameExtractor`] handles all of them. While nothing is buffered it
//! tries the whole chunk as one document, then as newline-delimited
//! documents. Anything else goes into a buffer that is scanned for complete
//! top-level objects, with string and escape tracking so braces and
//! newlines inside string values never end an object early.
//!
//! Both fast paths are skipped while a partial object is buffered, so the
//! messages produced do not depend on where the transport cut the stream.
//!
//! ```rust
//! use tether_core::FrameExtractor;
//!
//! let mut extractor = FrameExtractor::new();
//!
//! assert_eq!(extractor.push(br#"{"jsonrpc":"2.0","id":1,"res"#).count(), 0);
//!
//! let messages: Vec<_> = extractor.push(br#"ult":{}}"#).collect();
//! assert_eq!(messages.len(), 1);
//! assert!(messages[0].as_ref().unwrap().is_reply());
//! ```

use crate::codec;
use crate::error::{Error, Result};
use crate::types::JsonRpcMessage;

/// Default cap on buffered bytes for an incomplete document
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Resumable brace-depth scan over the buffered object
///
/// `offset == 0` means no object start has been located yet.
#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

/// Incremental JSON-RPC message extractor
///
/// One extractor per connection. Call [`FrameExtractor::reset`] when the
/// underlying stream restarts.
#[derive(Debug)]
pub struct FrameExtractor {
    buffer: Vec<u8>,
    scan: ScanState,
    max_buffer_size: usize,
}

impl Default for FrameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameExtractor {
    /// Create an extractor with the default buffer cap
    pub fn new() -> Self {
        Self::with_max_buffer_size(DEFAULT_MAX_BUFFER_SIZE)
    }

    /// Create an extractor that gives up on documents larger than `max`
    pub fn with_max_buffer_size(max: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scan: ScanState::default(),
            max_buffer_size: max,
        }
    }

    /// Number of bytes held back waiting for the rest of a document
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any partial document
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scan = ScanState::default();
    }

    /// Feed a chunk and iterate the messages it completes
    ///
    /// Buffered extraction happens lazily as the iterator is advanced.
    /// Dropping the iterator early leaves the remaining objects buffered;
    /// they come out, in order, on the next push.
    ///
    /// A slice that is valid JSON but not a JSON-RPC envelope yields an
    /// `Err(DecodingFailed)` item and extraction carries on with the next
    /// object.
    pub fn push(&mut self, chunk: &[u8]) -> Frames<'_> {
        if self.buffer.is_empty() {
            if let Ok(message) = codec::decode(chunk) {
                return Frames::ready(vec![Ok(message)]);
            }

            if let Some(messages) = decode_lines(chunk) {
                return Frames::ready(messages.into_iter().map(Ok).collect());
            }
        }

        if self.buffer.len() + chunk.len() > self.max_buffer_size {
            tracing::warn!(
                buffered = self.buffer.len(),
                chunk = chunk.len(),
                max = self.max_buffer_size,
                "Frame buffer overflow, discarding partial document"
            );
            self.reset();
            return Frames::ready(vec![Err(Error::DecodingFailed(format!(
                "buffered document exceeds {} bytes",
                self.max_buffer_size
            )))]);
        }

        self.buffer.extend_from_slice(chunk);

        Frames {
            ready: Vec::new().into_iter(),
            extractor: Some(self),
        }
    }

    /// Pull the next complete object out of the buffer
    fn next_buffered(&mut self) -> Option<Result<JsonRpcMessage>> {
        if self.scan.offset == 0 {
            match self.buffer.iter().position(|&b| b == b'{') {
                Some(0) => {}
                Some(start) => {
                    tracing::debug!(dropped = start, "Dropping bytes before JSON object");
                    self.buffer.drain(..start);
                }
                None => {
                    if !self.buffer.is_empty() {
                        tracing::debug!(dropped = self.buffer.len(), "Dropping non-JSON bytes");
                    }
                    self.buffer.clear();
                    return None;
                }
            }
        }

        let end = self.scan_to_object_end()?;
        let object: Vec<u8> = self.buffer.drain(..=end).collect();
        self.scan = ScanState::default();

        Some(codec::decode(&object))
    }

    /// Advance the scan; returns the index of the closing brace once found
    fn scan_to_object_end(&mut self) -> Option<usize> {
        let mut scan = self.scan;

        for (i, &byte) in self.buffer.iter().enumerate().skip(scan.offset) {
            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => scan.in_string = true,
                b'{' => scan.depth += 1,
                b'}' => {
                    scan.depth = scan.depth.saturating_sub(1);
                    if scan.depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }

        scan.offset = self.buffer.len();
        self.scan = scan;
        None
    }
}

/// Decode every non-blank line, or nothing at all
fn decode_lines(chunk: &[u8]) -> Option<Vec<JsonRpcMessage>> {
    let mut messages = Vec::new();

    for line in chunk.split(|&b| b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        messages.push(codec::decode(line).ok()?);
    }

    if messages.is_empty() {
        None
    } else {
        Some(messages)
    }
}

/// Messages produced by one [`FrameExtractor::push`]
pub struct Frames<'a> {
    ready: std::vec::IntoIter<Result<JsonRpcMessage>>,
    extractor: Option<&'a mut FrameExtractor>,
}

impl Frames<'_> {
    fn ready(items: Vec<Result<JsonRpcMessage>>) -> Self {
        Self {
            ready: items.into_iter(),
            extractor: None,
        }
    }
}

impl Iterator for Frames<'_> {
    type Item = Result<JsonRpcMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(item) = self.ready.next() {
            return Some(item);
        }

        let item = self.extractor.as_mut()?.next_buffered();
        if item.is_none() {
            self.extractor = None;
        }
        item
    }
}
