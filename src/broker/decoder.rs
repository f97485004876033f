//! Message boundary detection on the broker socket.
//!
//! The Relay forwards native-messaging payloads verbatim with no framing of
//! its own, so the broker splits the byte stream into consecutive JSON
//! values. Partial values stay buffered; the buffer is bounded by the
//! maximum message length.

use serde_json::Value;

use crate::error::{BridgeError, Result};

/// One item pulled off the stream.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Decoded {
    /// A complete JSON value.
    Message(Value),
    /// Bytes that can never become valid JSON. The buffer was discarded.
    Malformed(String),
}

/// Incremental JSON value splitter.
#[derive(Debug)]
pub(crate) struct MessageDecoder {
    buf: Vec<u8>,
    max_len: usize,
}

impl MessageDecoder {
    pub(crate) fn new(max_len: usize) -> Self {
        Self { buf: Vec::new(), max_len }
    }

    /// Feed bytes and extract every complete value.
    ///
    /// # Errors
    ///
    /// [`BridgeError::FrameTooLarge`] when the unfinished remainder exceeds
    /// the maximum message length.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Decoded>> {
        self.buf.extend_from_slice(bytes);
        let mut decoded = Vec::new();

        let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
        let mut consumed = 0;
        loop {
            match stream.next() {
                Some(Ok(value)) => {
                    decoded.push(Decoded::Message(value));
                    consumed = stream.byte_offset();
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    decoded.push(Decoded::Malformed(e.to_string()));
                    consumed = self.buf.len();
                    break;
                }
                None => {
                    consumed = stream.byte_offset();
                    break;
                }
            }
        }
        self.buf.drain(..consumed);

        if self.buf.len() > self.max_len {
            let len = self.buf.len();
            self.buf.clear();
            return Err(BridgeError::FrameTooLarge { len, max: self.max_len });
        }
        Ok(decoded)
    }
}
