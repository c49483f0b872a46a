//! Incremental decoder for upstream chat-completion event streams
//!
//! Upstream bodies arrive in chunks whose boundaries have nothing to do with
//! the protocol's lines. [`LineDecoder`] reassembles complete lines,
//! [`classify_line`] turns each line into a [`DataLine`], and [`TokenDecoder`]
//! combines the two into a token extractor that stops at the `[DONE]` sentinel.
//! [`token_stream`] wraps all of it as a lazy async stream over a body.

use async_stream::stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tracing::debug;

/// Prefix of every payload-carrying line
pub const DATA_PREFIX: &str = "data: ";

/// Payload marking the end of an upstream stream
pub const DONE_SENTINEL: &str = "[DONE]";

/// Splits a byte stream into newline-terminated lines
///
/// Lines are split on raw bytes and only then decoded as UTF-8, so a
/// multi-byte character split across two chunks is reassembled correctly.
/// After each `next_line` returns `None` the buffer holds at most one partial
/// trailing line.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of body bytes
    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Take the next complete line, without its terminator
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    /// Take whatever is left once the source is exhausted
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }

    /// Number of buffered bytes not yet returned as a line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Meaning of one decoded upstream line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLine {
    /// Blank separator, comment, or any other non-data line
    Ignored,
    /// The `[DONE]` sentinel
    Done,
    /// A delta record; `None` when it carried no user-facing text
    Delta(Option<String>),
    /// A data line whose payload could not be parsed
    Malformed,
}

#[derive(Debug, Deserialize)]
struct DeltaRecord {
    #[serde(default)]
    choices: Vec<DeltaChoice>,
}

#[derive(Debug, Deserialize)]
struct DeltaChoice {
    #[serde(default)]
    delta: Delta,
}

// `reasoning_content` and any other sibling fields are dropped by serde.
#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

/// Classify a single line of an upstream body
pub fn classify_line(line: &str) -> DataLine {
    let line = line.trim();
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return DataLine::Ignored;
    };
    if payload == DONE_SENTINEL {
        return DataLine::Done;
    }
    match serde_json::from_str::<DeltaRecord>(payload) {
        Ok(record) => DataLine::Delta(extract_token(record)),
        Err(e) => {
            debug!(error = %e, "classify_line: skipping malformed record");
            DataLine::Malformed
        }
    }
}

fn extract_token(record: DeltaRecord) -> Option<String> {
    record
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
}

/// Extracts tokens from an upstream body fed in arbitrary chunks
#[derive(Debug, Default)]
pub struct TokenDecoder {
    lines: LineDecoder,
    done: bool,
}

impl TokenDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the sentinel has been seen; later input is ignored
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one chunk and collect the tokens it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        if self.done {
            return Vec::new();
        }
        self.lines.push(chunk);
        let mut tokens = Vec::new();
        while let Some(line) = self.lines.next_line() {
            if self.accept(&line, &mut tokens) {
                break;
            }
        }
        tokens
    }

    /// Flush the final unterminated line once the body is exhausted
    pub fn finish(&mut self) -> Vec<String> {
        let mut tokens = Vec::new();
        if self.done {
            return tokens;
        }
        if let Some(line) = self.lines.finish() {
            self.accept(&line, &mut tokens);
        }
        self.done = true;
        tokens
    }

    // Returns true when the sentinel ends decoding.
    fn accept(&mut self, line: &str, tokens: &mut Vec<String>) -> bool {
        match classify_line(line) {
            DataLine::Done => {
                debug!(discarded = self.lines.pending(), "TokenDecoder: sentinel reached");
                self.done = true;
                self.lines = LineDecoder::new();
                true
            }
            DataLine::Delta(Some(token)) => {
                tokens.push(token);
                false
            }
            DataLine::Delta(None) | DataLine::Ignored | DataLine::Malformed => false,
        }
    }
}

/// Lazily decode tokens from a body byte stream
///
/// The stream ends at the sentinel or when `body` is exhausted. It borrows the
/// body so the caller can drain whatever follows the sentinel. A transport
/// error is yielded once and ends the stream.
pub fn token_stream<'a, S, E>(body: &'a mut S) -> impl Stream<Item = Result<String, E>> + Send + 'a
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
    E: Send + 'a,
{
    stream! {
        let mut decoder = TokenDecoder::new();
        let mut failed = false;
        while !decoder.is_done() {
            let Some(chunk) = body.next().await else {
                break;
            };
            match chunk {
                Ok(chunk) => {
                    for token in decoder.feed(&chunk) {
                        yield Ok(token);
                    }
                }
                Err(e) => {
                    failed = true;
                    yield Err(e);
                    break;
                }
            }
        }
        if !failed {
            for token in decoder.finish() {
                yield Ok(token);
            }
        }
    }
}
