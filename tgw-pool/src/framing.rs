//! # Delimiter Framing
//!
//! Outbound messages are `payload ++ delimiter`. Inbound bytes accumulate
//! until the decoded buffer contains the delimiter; completion is checked
//! against the whole buffer after every chunk, so a delimiter split across
//! chunks is still found.
//!
//! Hex is the exception: a hex delimiter names raw bytes, which are both
//! sent on the wire and matched in the undecoded buffer.

use bytes::BytesMut;

use tgw_common::{Encoding, GatewayResult};

/// Appends the delimiter's wire bytes (if any) to `payload`.
pub fn frame_payload(payload: &[u8], delimiter: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + delimiter.len());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(delimiter);
    frame
}

/// Accumulates one command's inbound bytes.
#[derive(Debug)]
pub struct ResponseBuffer {
    raw: BytesMut,
    encoding: Encoding,
    delimiter: String,
    wire_delimiter: Vec<u8>,
}

impl ResponseBuffer {
    /// # Errors
    /// Returns `GatewayError::Validation` when `encoding` cannot express
    /// `delimiter` (e.g. a malformed hex delimiter).
    pub fn new(encoding: Encoding, delimiter: impl Into<String>) -> GatewayResult<Self> {
        let delimiter = delimiter.into();
        let wire_delimiter = encoding.delimiter_bytes(&delimiter)?;
        Ok(ResponseBuffer {
            raw: BytesMut::new(),
            encoding,
            delimiter,
            wire_delimiter,
        })
    }

    /// Bytes to append to the outbound payload.
    pub fn wire_delimiter(&self) -> &[u8] {
        &self.wire_delimiter
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.raw.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Returns the response once the delimiter has arrived.
    ///
    /// The first delimiter occurrence is removed and the rest trimmed.
    /// Always `None` without a delimiter.
    pub fn complete(&self) -> Option<String> {
        if self.wire_delimiter.is_empty() {
            return None;
        }
        if self.encoding == Encoding::Hex {
            // Hex text has two chars per byte; matching it as text could
            // start mid-byte, so match the raw bytes instead.
            let at = self
                .raw
                .windows(self.wire_delimiter.len())
                .position(|window| window == self.wire_delimiter.as_slice())?;
            let mut rest = Vec::with_capacity(self.raw.len() - self.wire_delimiter.len());
            rest.extend_from_slice(&self.raw[..at]);
            rest.extend_from_slice(&self.raw[at + self.wire_delimiter.len()..]);
            return Some(self.encoding.decode(&rest));
        }

        let text = self.encoding.decode(&self.raw);
        let at = text.find(&self.delimiter)?;
        let mut response = String::with_capacity(text.len() - self.delimiter.len());
        response.push_str(&text[..at]);
        response.push_str(&text[at + self.delimiter.len()..]);
        Some(response.trim().to_string())
    }

    /// Everything received so far, decoded and trimmed.
    pub fn drain_all(&mut self) -> String {
        let raw = self.raw.split();
        self.encoding.decode(&raw).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_payload_with_delimiter() {
        assert_eq!(frame_payload(b"GET_STATUS", b"\n"), b"GET_STATUS\n".to_vec());
        assert_eq!(frame_payload(b"HELLO", b"\r\n"), b"HELLO\r\n".to_vec());
        assert_eq!(frame_payload(b"RAW", b""), b"RAW".to_vec());
    }

    #[test]
    fn completes_on_delimiter() {
        let mut buffer = ResponseBuffer::new(Encoding::Utf8, "\n").unwrap();
        buffer.push(b"STATUS");
        assert_eq!(buffer.complete(), None);
        buffer.push(b"_OK\n");
        assert_eq!(buffer.complete(), Some("STATUS_OK".to_string()));
    }

    #[test]
    fn finds_delimiter_split_across_chunks() {
        let mut buffer = ResponseBuffer::new(Encoding::Utf8, "\r\n").unwrap();
        buffer.push(b"HELLO_RESPONSE\r");
        assert_eq!(buffer.complete(), None);
        buffer.push(b"\n");
        assert_eq!(buffer.complete(), Some("HELLO_RESPONSE".to_string()));
    }

    #[test]
    fn removes_only_first_delimiter_occurrence() {
        let mut buffer = ResponseBuffer::new(Encoding::Utf8, "END").unwrap();
        buffer.push(b"  line one\nline two END trailing END ");
        assert_eq!(
            buffer.complete(),
            Some("line one\nline two  trailing END".to_string())
        );
    }

    #[test]
    fn split_utf8_sequence_is_decoded_once_complete() {
        let bytes = "é\n".as_bytes();
        let mut buffer = ResponseBuffer::new(Encoding::Utf8, "\n").unwrap();
        buffer.push(&bytes[..1]);
        assert_eq!(buffer.complete(), None);
        buffer.push(&bytes[1..]);
        assert_eq!(buffer.complete(), Some("é".to_string()));
    }

    #[test]
    fn never_completes_without_delimiter() {
        let mut buffer = ResponseBuffer::new(Encoding::Utf8, "").unwrap();
        buffer.push(b"  partial data \n");
        assert_eq!(buffer.complete(), None);
        assert_eq!(buffer.drain_all(), "partial data");
        assert!(buffer.is_empty());
    }

    #[test]
    fn hex_delimiter_matches_whole_bytes() {
        let mut buffer = ResponseBuffer::new(Encoding::Hex, "0a").unwrap();
        assert_eq!(buffer.wire_delimiter(), &[0x0a]);
        buffer.push(&[0xde, 0xad, 0x0a]);
        assert_eq!(buffer.complete(), Some("dead".to_string()));
    }

    #[test]
    fn hex_delimiter_ignores_mid_byte_text_match() {
        // "10a0ff" holds "0a" at offset 1, but no byte is 0x0a.
        let mut buffer = ResponseBuffer::new(Encoding::Hex, "0a").unwrap();
        buffer.push(&[0x10, 0xa0, 0xff]);
        assert_eq!(buffer.complete(), None);
        buffer.push(&[0x0a, 0x01]);
        assert_eq!(buffer.complete(), Some("10a0ff01".to_string()));
    }

    #[test]
    fn hex_delimiter_is_framed_as_raw_bytes() {
        let buffer = ResponseBuffer::new(Encoding::Hex, "0d0a").unwrap();
        assert_eq!(frame_payload(b"AB", buffer.wire_delimiter()), vec![b'A', b'B', 0x0d, 0x0a]);
        assert!(ResponseBuffer::new(Encoding::Hex, "0a1").is_err());
    }
}
