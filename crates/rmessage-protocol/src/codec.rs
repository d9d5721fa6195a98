//! Codec for encoding and decoding rmessage frames.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! [1B marker|category][1B from len][1B to len][4B body len][2B additional len]
//! [from key][to key][body][additional][8B timestamp][4B crc32, optional]
//! ```
//!
//! `Ping` and `Pong` frames are the header byte alone (plus the checksum when
//! enabled). Decoding is incremental: [`FrameCodec::decode`] consumes whatever
//! bytes are available, keeps its position across calls, and yields a message
//! once a frame is complete.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::category::ProtocolCategory;
use crate::message::TransportMessage;
use crate::version::{header_byte, split_header, PROTOCOL_MARKER};

/// Default maximum body size (1 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024;

/// Size of the length block following a payload-bearing header.
pub const LENGTHS_SIZE: usize = 8;

/// Size of the timestamp trailer.
pub const TIMESTAMP_SIZE: usize = 8;

/// Size of the checksum trailer.
pub const CHECKSUM_SIZE: usize = 4;

/// Longest key the one-byte length fields can describe.
pub const MAX_KEY_LENGTH: usize = u8::MAX as usize;

/// Longest additional-fields block the two-byte length field can describe.
pub const MAX_ADDITIONAL_LENGTH: usize = u16::MAX as usize;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Header marker nibble does not match [`PROTOCOL_MARKER`].
    #[error("Bad frame marker {found:#x}, expected {PROTOCOL_MARKER:#x}")]
    BadMarker {
        /// Marker nibble found on the wire.
        found: u8,
    },

    /// Category nibble is not a known category.
    #[error("Unknown protocol category code {0}")]
    UnknownCategory(u8),

    /// Declared body length exceeds the configured maximum.
    #[error("Frame body size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Declared size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A field is longer than its wire length field can carry.
    #[error("Field {field} length {len} exceeds maximum {max}")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Wire maximum.
        max: usize,
    },

    /// A header-only category was given keys, body or a timestamp to encode.
    #[error("{0} frames are header-only and cannot carry a payload")]
    ControlPayload(ProtocolCategory),

    /// Trailing checksum does not match the frame contents.
    #[error("Checksum mismatch: frame carried {expected:#010x}, computed {actual:#010x}")]
    Checksum {
        /// Checksum carried by the frame.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// Not enough data to decode a whole frame.
    #[error("Incomplete frame")]
    Incomplete,

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether this is a framing violation (bad marker or unknown category).
    #[must_use]
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadMarker { .. } | ProtocolError::UnknownCategory(_)
        )
    }
}

/// Codec configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Maximum declared body length accepted or produced.
    pub max_body_size: usize,
    /// Whether frames carry a trailing CRC-32.
    pub checksum: bool,
    /// Whether a checksum mismatch should close the connection.
    pub close_on_checksum_error: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            checksum: false,
            close_on_checksum_error: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lengths {
    from: usize,
    to: usize,
    body: usize,
    additional: usize,
}

impl Lengths {
    fn payload(&self) -> usize {
        self.from + self.to + self.body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Header,
    Lengths(ProtocolCategory),
    Body(ProtocolCategory, Lengths),
    Additional(ProtocolCategory, Lengths),
    Crc,
}

/// Stateful, resumable frame codec.
///
/// One instance decodes one byte stream. Bytes handed to [`decode`](Self::decode)
/// are consumed from the caller's buffer as soon as they are parsed, so a
/// partial frame never has to be scanned twice.
#[derive(Debug)]
pub struct FrameCodec {
    config: CodecConfig,
    state: DecodeState,
    /// Bytes of the stage currently being accumulated.
    partial: BytesMut,
    /// Keys and body of the frame in progress.
    payload: Bytes,
    /// Decoded message waiting for its checksum.
    pending: Option<TransportMessage>,
    hasher: crc32fast::Hasher,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl FrameCodec {
    /// Create a new codec instance.
    #[must_use]
    pub fn new(config: CodecConfig) -> Self {
        Self {
            config,
            state: DecodeState::Header,
            partial: BytesMut::new(),
            payload: Bytes::new(),
            pending: None,
            hasher: crc32fast::Hasher::new(),
        }
    }

    /// Codec configuration.
    #[must_use]
    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Whether the decoder sits on a frame boundary.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::Header
    }

    /// Drop any partial frame and start over at the next header byte.
    pub fn reset(&mut self) {
        self.state = DecodeState::Header;
        self.partial.clear();
        self.payload = Bytes::new();
        self.pending = None;
        self.hasher = crc32fast::Hasher::new();
    }

    /// Whether `err` must close the connection it was raised on.
    #[must_use]
    pub fn is_fatal(&self, err: &ProtocolError) -> bool {
        match err {
            ProtocolError::Checksum { .. } => self.config.close_on_checksum_error,
            _ => true,
        }
    }

    /// Try to decode one message, consuming bytes from `buf`.
    ///
    /// Returns `Ok(None)` once `buf` is drained without completing a frame;
    /// progress is kept and the next call resumes where this one stopped.
    ///
    /// # Errors
    ///
    /// Returns a framing, size or checksum error. After an error the codec is
    /// back at the header state.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<TransportMessage>, ProtocolError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if !buf.has_remaining() {
                        return Ok(None);
                    }
                    self.hasher = crc32fast::Hasher::new();
                    let byte = buf.get_u8();
                    self.hasher.update(&[byte]);

                    let (marker, code) = split_header(byte);
                    if marker != PROTOCOL_MARKER {
                        return Err(ProtocolError::BadMarker { found: marker });
                    }
                    let category = ProtocolCategory::try_from(code)
                        .map_err(ProtocolError::UnknownCategory)?;

                    if category.is_control() {
                        let message = TransportMessage::new(category, Bytes::new(), Bytes::new())
                            .with_timestamp(0);
                        if let Some(message) = self.complete(message) {
                            return Ok(Some(message));
                        }
                    } else {
                        self.state = DecodeState::Lengths(category);
                    }
                }
                DecodeState::Lengths(category) => {
                    if !self.fill(buf, LENGTHS_SIZE, true) {
                        return Ok(None);
                    }
                    let mut block = self.partial.split();
                    let lengths = Lengths {
                        from: block.get_u8() as usize,
                        to: block.get_u8() as usize,
                        body: block.get_u32() as usize,
                        additional: block.get_u16() as usize,
                    };
                    if lengths.body > self.config.max_body_size {
                        self.reset();
                        return Err(ProtocolError::FrameTooLarge {
                            size: lengths.body,
                            max: self.config.max_body_size,
                        });
                    }
                    self.state = DecodeState::Body(category, lengths);
                }
                DecodeState::Body(category, lengths) => {
                    if !self.fill(buf, lengths.payload(), true) {
                        return Ok(None);
                    }
                    self.payload = self.partial.split().freeze();
                    self.state = DecodeState::Additional(category, lengths);
                }
                DecodeState::Additional(category, lengths) => {
                    if !self.fill(buf, lengths.additional + TIMESTAMP_SIZE, true) {
                        return Ok(None);
                    }
                    let mut trailer = self.partial.split();
                    let additional = trailer.split_to(lengths.additional).freeze();
                    let timestamp = trailer.get_u64();

                    let payload = std::mem::take(&mut self.payload);
                    let key_end = lengths.from + lengths.to;
                    let message = TransportMessage {
                        category,
                        from_key: payload.slice(..lengths.from),
                        to_key: payload.slice(lengths.from..key_end),
                        body: payload.slice(key_end..),
                        additional,
                        timestamp,
                    };
                    if let Some(message) = self.complete(message) {
                        return Ok(Some(message));
                    }
                }
                DecodeState::Crc => {
                    if !self.fill(buf, CHECKSUM_SIZE, false) {
                        return Ok(None);
                    }
                    let expected = self.partial.split().get_u32();
                    let actual = self.hasher.clone().finalize();
                    let message = self.pending.take();
                    self.state = DecodeState::Header;

                    if expected != actual {
                        return Err(ProtocolError::Checksum { expected, actual });
                    }
                    if let Some(message) = message {
                        return Ok(Some(message));
                    }
                }
            }
        }
    }

    /// Iterate over every message that can be decoded from `buf`.
    ///
    /// The iterator ends when `buf` runs dry or after a fatal error; a
    /// non-fatal error is yielded and decoding continues.
    pub fn frames<'a>(&'a mut self, buf: &'a mut BytesMut) -> Frames<'a> {
        Frames {
            codec: self,
            buf,
            done: false,
        }
    }

    /// Encode a message into `buf`.
    ///
    /// # Errors
    ///
    /// Returns an error if a field does not fit its wire length field, the
    /// body exceeds the configured maximum, or a header-only message carries
    /// anything besides its category.
    pub fn encode(&self, message: &TransportMessage, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let start = buf.len();
        let header = header_byte(PROTOCOL_MARKER, message.category.code());

        if message.category.is_control() {
            if !message.from_key.is_empty()
                || !message.to_key.is_empty()
                || !message.body.is_empty()
                || !message.additional.is_empty()
                || message.timestamp != 0
            {
                return Err(ProtocolError::ControlPayload(message.category));
            }
            buf.reserve(1 + CHECKSUM_SIZE);
            buf.put_u8(header);
        } else {
            check_len("from_key", message.from_key.len(), MAX_KEY_LENGTH)?;
            check_len("to_key", message.to_key.len(), MAX_KEY_LENGTH)?;
            check_len("additional", message.additional.len(), MAX_ADDITIONAL_LENGTH)?;
            if message.body.len() > self.config.max_body_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: message.body.len(),
                    max: self.config.max_body_size,
                });
            }

            buf.reserve(encoded_len(message) + CHECKSUM_SIZE);
            buf.put_u8(header);
            buf.put_u8(message.from_key.len() as u8);
            buf.put_u8(message.to_key.len() as u8);
            buf.put_u32(message.body.len() as u32);
            buf.put_u16(message.additional.len() as u16);
            buf.extend_from_slice(&message.from_key);
            buf.extend_from_slice(&message.to_key);
            buf.extend_from_slice(&message.body);
            buf.extend_from_slice(&message.additional);
            buf.put_u64(message.timestamp);
        }

        if self.config.checksum {
            let crc = crc32fast::hash(&buf[start..]);
            buf.put_u32(crc);
        }
        Ok(())
    }

    /// Move up to `needed - partial.len()` bytes from `buf` into the stage
    /// buffer. Returns `true` once the stage holds `needed` bytes.
    fn fill(&mut self, buf: &mut BytesMut, needed: usize, hash: bool) -> bool {
        let missing = needed - self.partial.len();
        let take = missing.min(buf.len());
        if take > 0 {
            let chunk = buf.split_to(take);
            if hash {
                self.hasher.update(&chunk);
            }
            self.partial.unsplit(chunk);
        }
        self.partial.len() == needed
    }

    /// Finish a frame body, either emitting it or parking it until the
    /// checksum arrives.
    fn complete(&mut self, message: TransportMessage) -> Option<TransportMessage> {
        if self.config.checksum {
            self.pending = Some(message);
            self.state = DecodeState::Crc;
            None
        } else {
            self.state = DecodeState::Header;
            Some(message)
        }
    }
}

/// Iterator returned by [`FrameCodec::frames`].
pub struct Frames<'a> {
    codec: &'a mut FrameCodec,
    buf: &'a mut BytesMut,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<TransportMessage, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.codec.decode(self.buf) {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(err) => {
                self.done = self.codec.is_fatal(&err);
                Some(Err(err))
            }
        }
    }
}

fn check_len(field: &'static str, len: usize, max: usize) -> Result<(), ProtocolError> {
    if len > max {
        return Err(ProtocolError::FieldTooLong { field, len, max });
    }
    Ok(())
}

/// Encoded size of a message without checksum.
#[must_use]
pub fn encoded_len(message: &TransportMessage) -> usize {
    if message.category.is_control() {
        return 1;
    }
    1 + LENGTHS_SIZE
        + message.from_key.len()
        + message.to_key.len()
        + message.body.len()
        + message.additional.len()
        + TIMESTAMP_SIZE
}

/// Encode a message to bytes with the default configuration.
///
/// # Errors
///
/// Returns an error if a field is too long.
pub fn encode(message: &TransportMessage) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::with_capacity(encoded_len(message));
    FrameCodec::default().encode(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one frame from `data` with the default configuration.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] if `data` holds less than a frame.
pub fn decode(data: &[u8]) -> Result<TransportMessage, ProtocolError> {
    let mut buf = BytesMut::from(data);
    FrameCodec::default()
        .decode(&mut buf)?
        .ok_or(ProtocolError::Incomplete)
}
