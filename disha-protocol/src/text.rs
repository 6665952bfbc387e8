//! Reusable UTF-8 decoding for log output.
//!
//! Network names travel and are stored as raw bytes; they are only ever
//! decoded when a human-readable log line is built. Sessions keep one
//! decoder each so the output buffer is reused across messages instead of
//! allocating per field.

/// Stateful UTF-8 decoder with an owned output buffer that grows as
/// needed. A malformed sequence yields `None`, never a partial string.
pub struct StringDecoder {
    buf: String,
}

impl StringDecoder {
    pub fn new() -> Self {
        Self {
            buf: String::with_capacity(128),
        }
    }

    /// Decode `bytes` into the internal buffer and borrow the result.
    /// The returned slice is valid until the next call.
    pub fn decode(&mut self, bytes: &[u8]) -> Option<&str> {
        self.buf.clear();
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                self.buf.push_str(s);
                Some(&self.buf)
            }
            Err(_) => None,
        }
    }
}

impl Default for StringDecoder {
    fn default() -> Self {
        Self::new()
    }
}
