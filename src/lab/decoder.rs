//! Incremental decoding of a chunked response body into text lines
//!
//! Bytes arrive in arbitrary-sized chunks. [`Utf8StreamDecoder`] turns them
//! into text without ever failing on a multi-byte character split across
//! chunks, [`LineDecoder`] cuts that text into newline-terminated lines, and
//! [`FrameReader`] drives both from any [`ChunkSource`].

use crate::error::{LabError, LabResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::debug;

const REPLACEMENT: char = '\u{FFFD}';

/// UTF-8 decoder that carries incomplete trailing sequences between calls
#[derive(Debug, Default)]
pub struct Utf8StreamDecoder {
    carry: Vec<u8>,
}

impl Utf8StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next chunk.
    ///
    /// A truncated sequence at the end of `bytes` is held back for the next
    /// call. Bytes that can never form valid UTF-8 are replaced with U+FFFD.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let joined;
        let data: &[u8] = if self.carry.is_empty() {
            bytes
        } else {
            let mut buf = std::mem::take(&mut self.carry);
            buf.extend_from_slice(bytes);
            joined = buf;
            &joined
        };

        let mut out = String::with_capacity(data.len());
        let mut rest = data;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(REPLACEMENT);
                            rest = &after[len..];
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush at end of stream; a dangling partial sequence becomes U+FFFD
    pub fn finish(&mut self) -> String {
        if self.carry.is_empty() {
            String::new()
        } else {
            self.carry.clear();
            REPLACEMENT.to_string()
        }
    }

    /// Number of bytes waiting for the rest of their character
    pub fn carried(&self) -> usize {
        self.carry.len()
    }
}

/// Splits decoded text into lines, buffering the unterminated tail
#[derive(Debug, Default)]
pub struct LineDecoder {
    utf8: Utf8StreamDecoder,
    pending: String,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed, without the `'\n'`.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        let text = self.utf8.decode(chunk);
        self.pending.push_str(&text);

        let Some(last) = self.pending.rfind('\n') else {
            return Vec::new();
        };
        let tail = self.pending.split_off(last + 1);
        let complete = std::mem::replace(&mut self.pending, tail);
        complete[..complete.len() - 1]
            .split('\n')
            .map(str::to_owned)
            .collect()
    }

    /// Text received after the last newline
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// End of stream. The unterminated remainder is handed back but is never a line.
    pub fn finish(&mut self) -> Option<String> {
        let flushed = self.utf8.finish();
        self.pending.push_str(&flushed);
        let remainder = std::mem::take(&mut self.pending);
        (!remainder.is_empty()).then_some(remainder)
    }
}

/// Source of raw body chunks. `Ok(None)` signals end of stream.
#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> LabResult<Option<Vec<u8>>>;
}

#[async_trait]
impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> LabResult<Option<Vec<u8>>> {
        // Any failure here is the connection going away, not a bad payload
        let chunk = self.chunk().await.map_err(LabError::body_read)?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}

/// Reads lines from a [`ChunkSource`] one at a time.
///
/// The source and decoder buffers are owned by the reader and released when
/// it is dropped, whichever way the stream ended.
pub struct FrameReader<S> {
    source: S,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    finished: bool,
    chunks_read: usize,
    bytes_read: usize,
}

impl<S: ChunkSource> FrameReader<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            decoder: LineDecoder::new(),
            ready: VecDeque::new(),
            finished: false,
            chunks_read: 0,
            bytes_read: 0,
        }
    }

    /// Next complete line, `Ok(None)` at end of stream.
    ///
    /// Only suspends on the source when every line of the previous chunk has
    /// been handed out. A read failure ends the sequence.
    pub async fn next_line(&mut self) -> LabResult<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.finished {
                return Ok(None);
            }
            match self.source.next_chunk().await {
                Ok(Some(chunk)) => {
                    self.chunks_read += 1;
                    self.bytes_read += chunk.len();
                    self.ready.extend(self.decoder.push(&chunk));
                }
                Ok(None) => {
                    self.finished = true;
                    if let Some(remainder) = self.decoder.finish() {
                        debug!(
                            "Discarding {} bytes of unterminated text at end of stream",
                            remainder.len()
                        );
                    }
                    debug!(
                        "Stream ended after {} chunks ({} bytes)",
                        self.chunks_read, self.bytes_read
                    );
                }
                Err(e) => {
                    self.finished = true;
                    self.decoder.finish();
                    return Err(e);
                }
            }
        }
    }

    pub fn chunks_read(&self) -> usize {
        self.chunks_read
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}
