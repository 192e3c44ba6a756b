//! Binary codec for the mesh wire protocol.
//!
//! Every message on a stream is framed as
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────────┐
//! │ kind: u16  │ length: i32  │ payload: `length` bytes  │
//! └────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! All integers are little-endian with fixed width. The header is serialized with bincode using a
//! single centralized configuration, and payloads are assembled with [`PayloadWriter`] and taken
//! apart with [`PayloadReader`].
//!
//! [`decode_frame`] is used to peel consecutive frames off the front of one receive buffer. It
//! never panics: a short buffer yields [`Decoded::NeedMoreData`], garbage yields
//! [`Decoded::Malformed`] together with the number of bytes to discard.
//!
//! # Examples
//!
//! ```
//! use lockstep_mesh::network::codec::{decode_frame, encode_frame, Decoded};
//! use lockstep_mesh::network::messages::MessageKind;
//!
//! let bytes = encode_frame(MessageKind::ServerStartGame, &42i32.to_le_bytes()).unwrap();
//! match decode_frame(&bytes, 1024) {
//!     Decoded::Frame { message, consumed } => {
//!         assert_eq!(message.kind, MessageKind::ServerStartGame);
//!         assert_eq!(consumed, bytes.len());
//!     }
//!     other => panic!("unexpected {other:?}"),
//! }
//! ```

use std::fmt;
use std::net::Ipv4Addr;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::network::messages::{Message, MessageKind};

// Fixed-width little-endian integers keep the header at exactly HEADER_SIZE bytes.
fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Size of the frame header in bytes: a `u16` kind followed by an `i32` length.
pub const HEADER_SIZE: usize = 6;

/// Longest string that fits behind a one-byte length prefix.
pub const MAX_SHORT_STRING: usize = u8::MAX as usize;

/// Represents what operation was being performed when a codec error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecOperation {
    /// Encoding a frame header.
    EncodeHeader,
    /// Decoding a frame header.
    DecodeHeader,
    /// Appending to a payload buffer.
    AppendToBuffer,
    /// A generic encoding operation.
    Encode,
    /// A generic decoding operation.
    Decode,
}

impl fmt::Display for CodecOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeHeader => write!(f, "encoding frame header"),
            Self::DecodeHeader => write!(f, "decoding frame header"),
            Self::AppendToBuffer => write!(f, "appending to buffer"),
            Self::Encode => write!(f, "encoding"),
            Self::Decode => write!(f, "decoding"),
        }
    }
}

/// Errors that can occur during encoding or decoding.
///
/// The bincode variants carry the library's message as a `String` since bincode errors expose no
/// structured reason. Everything the wire format itself can get wrong has its own variant.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The encoding operation failed.
    EncodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// The decoding operation failed.
    DecodeError {
        /// The underlying bincode error message.
        message: String,
        /// The operation that was being performed.
        operation: CodecOperation,
    },
    /// A payload ended before a field could be read.
    Truncated {
        /// Bytes the field needed.
        needed: usize,
        /// Bytes that were left.
        available: usize,
    },
    /// A header declared a negative or oversized payload length.
    InvalidLength {
        /// The declared length.
        length: i64,
        /// The largest payload this side accepts.
        max: usize,
    },
    /// A header carried a message kind this side does not know.
    UnknownKind {
        /// The raw kind code.
        code: u16,
    },
    /// A game-event entry carried an unknown event kind.
    UnknownEventKind {
        /// The raw event kind.
        code: i32,
    },
    /// String bytes were not valid UTF-8.
    InvalidUtf8 {
        /// Offset of the first invalid byte within the string.
        valid_up_to: usize,
    },
    /// A string was too long for its one-byte length prefix.
    StringTooLong {
        /// Length of the offending string in bytes.
        len: usize,
    },
    /// A list declared a negative element count.
    InvalidCount {
        /// The declared count.
        count: i32,
    },
    /// A fixed-layout payload had bytes left over after its last field.
    TrailingBytes {
        /// How many bytes were left.
        count: usize,
    },
}

impl CodecError {
    /// Creates a new encode error with the given message and operation.
    pub fn encode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::EncodeError {
            message: message.into(),
            operation,
        }
    }

    /// Creates a new decode error with the given message and operation.
    pub fn decode(message: impl Into<String>, operation: CodecOperation) -> Self {
        Self::DecodeError {
            message: message.into(),
            operation,
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EncodeError { message, operation } => {
                write!(f, "encoding failed while {operation}: {message}")
            },
            Self::DecodeError { message, operation } => {
                write!(f, "decoding failed while {operation}: {message}")
            },
            Self::Truncated { needed, available } => {
                write!(
                    f,
                    "payload truncated: needed {needed} bytes, only {available} left"
                )
            },
            Self::InvalidLength { length, max } => {
                write!(f, "invalid payload length {length} (accepted range 0..={max})")
            },
            Self::UnknownKind { code } => write!(f, "unknown message kind {code}"),
            Self::UnknownEventKind { code } => write!(f, "unknown game event kind {code}"),
            Self::InvalidUtf8 { valid_up_to } => {
                write!(f, "string is not valid UTF-8 after byte {valid_up_to}")
            },
            Self::StringTooLong { len } => {
                write!(
                    f,
                    "string of {len} bytes exceeds the {MAX_SHORT_STRING} byte limit"
                )
            },
            Self::InvalidCount { count } => write!(f, "invalid element count {count}"),
            Self::TrailingBytes { count } => {
                write!(f, "{count} unexpected bytes after the last field")
            },
        }
    }
}

impl std::error::Error for CodecError {}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a value into a new `Vec<u8>`.
pub fn encode<T: Serialize>(value: &T) -> CodecResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, config())
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::Encode))
}

/// Encodes a value by appending to an existing `Vec<u8>`.
///
/// Returns the number of bytes appended.
///
/// # Examples
///
/// ```
/// use lockstep_mesh::network::codec::encode_append;
///
/// let mut buffer = Vec::new();
/// encode_append(&7u16, &mut buffer).unwrap();
/// encode_append(&-1i32, &mut buffer).unwrap();
/// assert_eq!(buffer, [7, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
/// ```
pub fn encode_append<T: Serialize>(value: &T, buffer: &mut Vec<u8>) -> CodecResult<usize> {
    let start_len = buffer.len();
    bincode::serde::encode_into_std_write(value, buffer, config())
        .map(|_| buffer.len() - start_len)
        .map_err(|e| CodecError::encode(e.to_string(), CodecOperation::AppendToBuffer))
}

/// Decodes a value from a byte slice.
///
/// Returns the decoded value and the number of bytes consumed.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<(T, usize)> {
    bincode::serde::decode_from_slice(bytes, config())
        .map_err(|e| CodecError::decode(e.to_string(), CodecOperation::Decode))
}

/// Decodes a value from a byte slice, ignoring the bytes consumed.
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> CodecResult<T> {
    decode(bytes).map(|(value, _)| value)
}

/// The fixed header in front of every frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FrameHeader {
    pub kind: u16,
    pub length: i32,
}

/// Outcome of trying to take one frame off the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame was present.
    Frame {
        /// The decoded message. `sender` is left empty for the caller to fill in.
        message: Message,
        /// Bytes to remove from the front of the buffer.
        consumed: usize,
    },
    /// The buffer does not yet hold a complete frame. Nothing should be consumed.
    NeedMoreData,
    /// The buffer starts with bytes that cannot be a valid frame.
    Malformed {
        /// What was wrong.
        error: CodecError,
        /// Bytes to discard before trying again. Always at least one.
        consumed: usize,
    },
}

/// Encodes one frame: header followed by `payload`.
///
/// # Errors
///
/// Returns [`CodecError::InvalidLength`] if the payload cannot be described by an `i32` length.
pub fn encode_frame(kind: MessageKind, payload: &[u8]) -> CodecResult<Vec<u8>> {
    let length = i32::try_from(payload.len()).map_err(|_err| CodecError::InvalidLength {
        length: payload.len() as i64,
        max: i32::MAX as usize,
    })?;
    let header = FrameHeader {
        kind: kind.code(),
        length,
    };
    let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
    encode_append(&header, &mut bytes).map_err(|e| match e {
        CodecError::EncodeError { message, .. } => {
            CodecError::encode(message, CodecOperation::EncodeHeader)
        },
        other => other,
    })?;
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Tries to decode one frame from the front of `buf`.
///
/// `max_payload` bounds the declared length. A negative or oversized length means the stream
/// position can no longer be trusted, so everything buffered is reported as consumed. A frame with
/// a sane length but an unknown kind is skipped whole.
#[must_use]
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Decoded {
    let Some(header_bytes) = buf.get(..HEADER_SIZE) else {
        return Decoded::NeedMoreData;
    };
    let header: FrameHeader = match decode_value(header_bytes) {
        Ok(header) => header,
        Err(CodecError::DecodeError { message, .. }) => {
            return Decoded::Malformed {
                error: CodecError::decode(message, CodecOperation::DecodeHeader),
                consumed: buf.len(),
            };
        },
        Err(error) => {
            return Decoded::Malformed {
                error,
                consumed: buf.len(),
            };
        },
    };

    let length = match usize::try_from(header.length) {
        Ok(length) if length <= max_payload => length,
        _ => {
            return Decoded::Malformed {
                error: CodecError::InvalidLength {
                    length: i64::from(header.length),
                    max: max_payload,
                },
                consumed: buf.len(),
            };
        },
    };

    let total = HEADER_SIZE + length;
    let Some(payload) = buf.get(HEADER_SIZE..total) else {
        return Decoded::NeedMoreData;
    };

    match MessageKind::try_from(header.kind) {
        Ok(kind) => Decoded::Frame {
            message: Message::new(kind, payload.to_vec()),
            consumed: total,
        },
        Err(error) => Decoded::Malformed {
            error,
            consumed: total,
        },
    }
}

/// Builds a payload field by field.
#[derive(Debug, Default, Clone)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a little-endian `u16`.
    pub fn write_u16(&mut self, value: u16) -> CodecResult<()> {
        encode_append(&value, &mut self.buf).map(|_| ())
    }

    /// Appends a little-endian `i32`.
    pub fn write_i32(&mut self, value: i32) -> CodecResult<()> {
        encode_append(&value, &mut self.buf).map(|_| ())
    }

    /// Appends a string behind a one-byte length prefix.
    pub fn write_short_str(&mut self, value: &str) -> CodecResult<()> {
        let len = value.len();
        if len > MAX_SHORT_STRING {
            return Err(CodecError::StringTooLong { len });
        }
        self.buf.push(len as u8);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Appends the raw octets of an IPv4 address.
    pub fn write_ipv4(&mut self, addr: Ipv4Addr) {
        self.buf.extend_from_slice(&addr.octets());
    }

    /// Appends raw bytes with no prefix. Only meaningful as the last field of a payload.
    pub fn write_rest(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the finished payload.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads a payload field by field. Every read is bounds-checked.
#[derive(Debug, Clone)]
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    /// Creates a reader positioned at the start of `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Bytes not yet read.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, count: usize) -> CodecResult<&'a [u8]> {
        let available = self.remaining();
        let end = self.pos + count;
        match self.bytes.get(self.pos..end) {
            Some(slice) => {
                self.pos = end;
                Ok(slice)
            },
            None => Err(CodecError::Truncated {
                needed: count,
                available,
            }),
        }
    }

    /// Reads a little-endian `u16`.
    pub fn read_u16(&mut self) -> CodecResult<u16> {
        decode_value(self.take(2)?)
    }

    /// Reads a little-endian `i32`.
    pub fn read_i32(&mut self) -> CodecResult<i32> {
        decode_value(self.take(4)?)
    }

    /// Reads a string behind a one-byte length prefix.
    pub fn read_short_str(&mut self) -> CodecResult<String> {
        let len = self.take(1)?[0] as usize;
        let raw = self.take(len)?;
        utf8(raw)
    }

    /// Reads the raw octets of an IPv4 address.
    pub fn read_ipv4(&mut self) -> CodecResult<Ipv4Addr> {
        let raw = self.take(4)?;
        Ok(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
    }

    /// Reads everything that is left as a UTF-8 string.
    pub fn read_rest_str(&mut self) -> CodecResult<String> {
        let raw = self.take(self.remaining())?;
        utf8(raw)
    }

    /// Confirms the payload was consumed exactly.
    pub fn finish(&self) -> CodecResult<()> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(CodecError::TrailingBytes { count }),
        }
    }
}

fn utf8(raw: &[u8]) -> CodecResult<String> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|e| CodecError::InvalidUtf8 {
            valid_up_to: e.valid_up_to(),
        })
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    const MAX: usize = 64 * 1024;

    #[test]
    fn header_is_six_little_endian_bytes() {
        let bytes = encode_frame(MessageKind::ServerChat, &[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        assert_eq!(&bytes[..2], &MessageKind::ServerChat.code().to_le_bytes());
        assert_eq!(&bytes[2..6], &3i32.to_le_bytes());
        assert_eq!(&bytes[6..], &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let bytes = encode_frame(MessageKind::ClientChat, &[]).unwrap();
        match decode_frame(&bytes, MAX) {
            Decoded::Frame { message, consumed } => {
                assert_eq!(consumed, HEADER_SIZE);
                assert_eq!(message.kind, MessageKind::ClientChat);
                assert!(message.payload.is_empty());
                assert!(message.sender.is_none());
            },
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn short_buffer_needs_more_data() {
        let bytes = encode_frame(MessageKind::PeerGameData, &[1, 2, 3, 4]).unwrap();
        for cut in 0..bytes.len() {
            assert_eq!(decode_frame(&bytes[..cut], MAX), Decoded::NeedMoreData);
        }
    }

    #[test]
    fn consecutive_frames_peel_in_order() {
        let mut buf = encode_frame(MessageKind::ClientChat, b"one").unwrap();
        buf.extend(encode_frame(MessageKind::ClientChat, b"two").unwrap());
        buf.extend_from_slice(&[0x01]);

        let mut seen = Vec::new();
        loop {
            match decode_frame(&buf, MAX) {
                Decoded::Frame { message, consumed } => {
                    seen.push(message.payload);
                    buf.drain(..consumed);
                },
                Decoded::NeedMoreData => break,
                Decoded::Malformed { error, .. } => panic!("unexpected {error}"),
            }
        }
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(buf, vec![0x01]);
    }

    #[test]
    fn negative_length_is_malformed_and_drops_the_buffer() {
        let mut buf = Vec::new();
        encode_append(&FrameHeader { kind: 1, length: -5 }, &mut buf).unwrap();
        buf.extend_from_slice(&[9, 9, 9]);
        match decode_frame(&buf, MAX) {
            Decoded::Malformed { error, consumed } => {
                assert!(matches!(error, CodecError::InvalidLength { length: -5, .. }));
                assert_eq!(consumed, buf.len());
            },
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn oversized_length_is_malformed() {
        let mut buf = Vec::new();
        encode_append(&FrameHeader { kind: 1, length: 100 }, &mut buf).unwrap();
        assert!(matches!(
            decode_frame(&buf, 99),
            Decoded::Malformed {
                error: CodecError::InvalidLength { length: 100, max: 99 },
                ..
            }
        ));
    }

    #[test]
    fn unknown_kind_skips_exactly_one_frame() {
        let mut buf = Vec::new();
        encode_append(&FrameHeader { kind: 999, length: 2 }, &mut buf).unwrap();
        buf.extend_from_slice(&[1, 2]);
        buf.extend(encode_frame(MessageKind::ClientChat, b"hi").unwrap());

        match decode_frame(&buf, MAX) {
            Decoded::Malformed { error, consumed } => {
                assert_eq!(error, CodecError::UnknownKind { code: 999 });
                assert_eq!(consumed, HEADER_SIZE + 2);
                buf.drain(..consumed);
            },
            other => panic!("expected malformed, got {other:?}"),
        }
        assert!(matches!(decode_frame(&buf, MAX), Decoded::Frame { .. }));
    }

    #[test]
    fn short_string_roundtrip_and_limit() {
        let mut writer = PayloadWriter::new();
        writer.write_short_str("alice").unwrap();
        writer.write_short_str("").unwrap();
        let too_long = "x".repeat(256);
        assert_eq!(
            writer.write_short_str(&too_long),
            Err(CodecError::StringTooLong { len: 256 })
        );
        writer.write_short_str(&"y".repeat(255)).unwrap();

        let bytes = writer.into_bytes();
        assert_eq!(bytes[0], 5);
        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_short_str().unwrap(), "alice");
        assert_eq!(reader.read_short_str().unwrap(), "");
        assert_eq!(reader.read_short_str().unwrap().len(), 255);
        reader.finish().unwrap();
    }

    #[test]
    fn reader_reports_truncation() {
        let mut reader = PayloadReader::new(&[3, b'a']);
        assert_eq!(
            reader.read_short_str(),
            Err(CodecError::Truncated {
                needed: 3,
                available: 1
            })
        );

        let mut reader = PayloadReader::new(&[1, 2, 3]);
        assert!(matches!(
            reader.read_i32(),
            Err(CodecError::Truncated { needed: 4, .. })
        ));
    }

    #[test]
    fn reader_rejects_invalid_utf8() {
        let mut reader = PayloadReader::new(&[2, 0xC3, 0x28]);
        assert_eq!(
            reader.read_short_str(),
            Err(CodecError::InvalidUtf8 { valid_up_to: 0 })
        );
    }

    #[test]
    fn trailing_bytes_are_reported() {
        let reader = PayloadReader::new(&[1, 2]);
        assert_eq!(reader.finish(), Err(CodecError::TrailingBytes { count: 2 }));
    }

    #[test]
    fn integers_and_addresses_roundtrip() {
        let mut writer = PayloadWriter::new();
        writer.write_u16(0xBEEF).unwrap();
        writer.write_i32(-42).unwrap();
        writer.write_ipv4(Ipv4Addr::new(10, 0, 0, 7));
        writer.write_rest(b"tail text");
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 2 + 4 + 4 + 9);

        let mut reader = PayloadReader::new(&bytes);
        assert_eq!(reader.read_u16().unwrap(), 0xBEEF);
        assert_eq!(reader.read_i32().unwrap(), -42);
        assert_eq!(reader.read_ipv4().unwrap(), Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(reader.read_rest_str().unwrap(), "tail text");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn codec_error_display() {
        let err = CodecError::decode("bad tag", CodecOperation::DecodeHeader);
        assert!(err.to_string().contains("decoding frame header"));
        assert!(CodecError::UnknownKind { code: 77 }.to_string().contains("77"));
        assert!(CodecError::StringTooLong { len: 300 }
            .to_string()
            .contains("255"));
    }

    #[test]
    fn encoding_is_deterministic() {
        let a = encode_frame(MessageKind::PeerChat, b"same").unwrap();
        let b = encode_frame(MessageKind::PeerChat, b"same").unwrap();
        assert_eq!(a, b);
    }
}
