//! Encodes and decodes the delimiter-framed key/value wire messages exchanged
//! with the master.
//!
//! Messages on the master link are delimited by three bytes `{0x01, 0x00,
//! 0x00}`. Within a message, key/value pairs are separated by a single NUL
//! (`0x00`); each pair is `key=value` with `=` (0x3D) separating key from
//! value. Values may contain arbitrary bytes except NUL; keys are expected to
//! be printable ASCII but are not validated beyond "no NUL, has a `=`".

use std::fmt;

pub const DELIM: [u8; 3] = [0x01, 0x00, 0x00];

pub type Pairs = Vec<(String, Vec<u8>)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The stream ended (EOF) with a partial message still in the cache.
    IncompleteFrame,
    /// A key/value pair within a message had no `=` separator.
    MalformedPair,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::IncompleteFrame => write!(f, "stream ended mid-message"),
            FrameError::MalformedPair => write!(f, "key/value pair missing '=' separator"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode a list of key/value pairs into a single message buffer, terminated
/// by [`DELIM`], suitable for one `write(2)`.
pub fn encode<K: AsRef<str>, V: AsRef<[u8]>>(pairs: &[(K, V)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (k, v)) in pairs.iter().enumerate() {
        if i > 0 {
            out.push(0u8);
        }
        out.extend_from_slice(k.as_ref().as_bytes());
        out.push(b'=');
        out.extend_from_slice(v.as_ref());
    }
    out.extend_from_slice(&DELIM);
    out
}

/// Incremental reader over an input byte stream, yielding complete messages.
///
/// The cache starts at [`crate::config::FRAME_CACHE_INITIAL_CAPACITY`] and
/// grows without bound for oversized messages — the master is trusted, per
/// spec.
pub struct Decoder {
    buf: Vec<u8>,
    /// Index into `buf` before which we know there is no delimiter occurrence.
    search_start: usize,
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_capacity(crate::config::FRAME_CACHE_INITIAL_CAPACITY)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Decoder {
            buf: Vec::with_capacity(cap),
            search_start: 0,
        }
    }

    /// Append bytes read from the stream to the internal cache.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// True if the cache holds unconsumed bytes (i.e. the stream ended mid-message).
    pub fn has_partial_message(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Call on EOF: errors if a partial message remains in the cache.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.has_partial_message() {
            Err(FrameError::IncompleteFrame)
        } else {
            Ok(())
        }
    }

    /// Pop and parse the next complete message from the cache, if any.
    ///
    /// Returns `Ok(None)` when no full message is available yet (more bytes
    /// are needed from the stream). Messages are consumed from the front of
    /// the cache as they're returned.
    pub fn next_message(&mut self) -> Result<Option<Pairs>, FrameError> {
        let search_from = self.search_start.min(self.buf.len());
        let Some(rel_idx) = find_delim(&self.buf[search_from..]) else {
            // No delimiter yet; next search can skip everything we just scanned
            // except the last two bytes (a delimiter could start there once more
            // bytes arrive).
            self.search_start = self.buf.len().saturating_sub(DELIM.len() - 1);
            return Ok(None);
        };
        let idx = search_from + rel_idx;

        let message_bytes: Vec<u8> = self.buf.drain(..idx).collect();
        // Drop the delimiter itself.
        self.buf.drain(..DELIM.len());
        self.search_start = 0;

        Ok(Some(parse_pairs(&message_bytes)?))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn find_delim(haystack: &[u8]) -> Option<usize> {
    if haystack.len() < DELIM.len() {
        return None;
    }
    haystack
        .windows(DELIM.len())
        .position(|window| window == DELIM)
}

fn parse_pairs(message: &[u8]) -> Result<Pairs, FrameError> {
    if message.is_empty() {
        return Ok(Vec::new());
    }
    message
        .split(|&b| b == 0u8)
        .map(|pair| {
            let eq = pair
                .iter()
                .position(|&b| b == b'=')
                .ok_or(FrameError::MalformedPair)?;
            let key = String::from_utf8_lossy(&pair[..eq]).into_owned();
            let value = pair[eq + 1..].to_vec();
            Ok((key, value))
        })
        .collect()
}
