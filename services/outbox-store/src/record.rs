//! Record: on-disk encoding of one queued message
//!
//! # Binary Format (one record per file)
//! ```text
//! [body_len: u32]
//! [version: u8]
//! [id: 16 bytes]             // MessageId (UUID v7)
//! [written_at: i64]          // Unix nanoseconds from the store clock
//! [type_len: u16][type: bytes]
//! [payload_len: u32][payload: bytes]   // bincode-encoded Message
//! [checksum: u32]            // CRC32C over version..payload
//! ```
//!
//! The message type is duplicated in the frame so diagnostics can name a
//! record without decoding its payload.

use crc32c::crc32c;
use outbox_types::ids::MessageId;
use outbox_types::message::Message;
use thiserror::Error;

/// Current frame version.
pub const FRAME_VERSION: u8 = 1;

/// Largest body accepted when decoding; anything bigger is corruption.
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// version + id + written_at + type_len + payload_len + checksum
const MIN_BODY_LEN: usize = 1 + 16 + 8 + 2 + 4 + 4;

// ── Errors ──────────────────────────────────────────────────────────

/// Why a record file could not be turned back into a message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Truncated record: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("Implausible body length: {0} (likely corruption)")]
    ImplausibleLength(usize),

    #[error("Unexpected {0} trailing bytes after record")]
    TrailingBytes(usize),

    #[error("Unsupported record version: {0}")]
    UnsupportedVersion(u8),

    #[error("Checksum mismatch: stored={stored:#010x}, computed={computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("Message type is not valid UTF-8")]
    InvalidUtf8,

    #[error("Payload decode error: {0}")]
    Payload(String),

    #[error("Frame type '{frame}' does not match payload type '{payload}'")]
    TypeMismatch { frame: String, payload: String },
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("Message has no type")]
    MissingType,

    #[error("Message type longer than {max} bytes", max = u16::MAX)]
    TypeTooLong,

    #[error("Payload serialization error: {0}")]
    Payload(#[from] bincode::Error),

    #[error("Encoded payload of {0} bytes exceeds the record size limit")]
    TooLarge(usize),
}

// ── Record Frame ────────────────────────────────────────────────────

/// A decoded (or about to be written) record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordFrame {
    pub id: MessageId,
    pub written_at: i64,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl RecordFrame {
    /// Build a frame for `message`, computing the checksum.
    pub fn new(id: MessageId, written_at: i64, message: &Message) -> Result<Self, EncodeError> {
        let message_type = message.message_type().ok_or(EncodeError::MissingType)?;
        if message_type.len() > u16::MAX as usize {
            return Err(EncodeError::TypeTooLong);
        }
        let payload = bincode::serialize(message)?;
        if payload.len() + MIN_BODY_LEN + message_type.len() > MAX_BODY_LEN {
            return Err(EncodeError::TooLarge(payload.len()));
        }
        let checksum = Self::compute_checksum(&id, written_at, message_type, &payload);
        Ok(Self {
            id,
            written_at,
            message_type: message_type.to_string(),
            payload,
            checksum,
        })
    }

    /// CRC32C over (version, id, written_at, message_type, payload).
    pub fn compute_checksum(
        id: &MessageId,
        written_at: i64,
        message_type: &str,
        payload: &[u8],
    ) -> u32 {
        let mut buf = Vec::with_capacity(1 + 16 + 8 + message_type.len() + payload.len());
        buf.push(FRAME_VERSION);
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(&written_at.to_le_bytes());
        buf.extend_from_slice(message_type.as_bytes());
        buf.extend_from_slice(payload);
        crc32c(&buf)
    }

    pub fn verify_checksum(&self) -> bool {
        self.checksum
            == Self::compute_checksum(&self.id, self.written_at, &self.message_type, &self.payload)
    }

    /// Serialize to the file format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let type_bytes = self.message_type.as_bytes();
        let body_len = MIN_BODY_LEN + type_bytes.len() + self.payload.len();

        let mut buf = Vec::with_capacity(4 + body_len);
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.push(FRAME_VERSION);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&self.written_at.to_le_bytes());
        buf.extend_from_slice(&(type_bytes.len() as u16).to_le_bytes());
        buf.extend_from_slice(type_bytes);
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    /// Parse a whole record file, verifying length and checksum.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(data);
        let body_len = cursor.u32()? as usize;
        if body_len > MAX_BODY_LEN {
            return Err(DecodeError::ImplausibleLength(body_len));
        }
        if body_len < MIN_BODY_LEN {
            return Err(DecodeError::Truncated {
                need: MIN_BODY_LEN,
                have: body_len,
            });
        }
        if data.len() < 4 + body_len {
            return Err(DecodeError::Truncated {
                need: 4 + body_len,
                have: data.len(),
            });
        }
        if data.len() > 4 + body_len {
            return Err(DecodeError::TrailingBytes(data.len() - 4 - body_len));
        }

        let version = cursor.u8()?;
        if version != FRAME_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        let id = MessageId::from_bytes(cursor.array::<16>()?);
        let written_at = i64::from_le_bytes(cursor.array::<8>()?);
        let type_len = cursor.u16()? as usize;
        let message_type = std::str::from_utf8(cursor.take(type_len)?)
            .map_err(|_| DecodeError::InvalidUtf8)?
            .to_string();
        let payload_len = cursor.u32()? as usize;
        let payload = cursor.take(payload_len)?.to_vec();
        let checksum = cursor.u32()?;
        if cursor.remaining() != 0 {
            return Err(DecodeError::TrailingBytes(cursor.remaining()));
        }

        let frame = Self {
            id,
            written_at,
            message_type,
            payload,
            checksum,
        };
        if !frame.verify_checksum() {
            return Err(DecodeError::ChecksumMismatch {
                stored: checksum,
                computed: Self::compute_checksum(
                    &frame.id,
                    frame.written_at,
                    &frame.message_type,
                    &frame.payload,
                ),
            });
        }
        Ok(frame)
    }

    /// Decode the payload and check it agrees with the frame.
    pub fn message(&self) -> Result<Message, DecodeError> {
        let message: Message = bincode::deserialize(&self.payload)
            .map_err(|e| DecodeError::Payload(e.to_string()))?;
        match message.message_type() {
            Some(t) if t == self.message_type => Ok(message),
            other => Err(DecodeError::TypeMismatch {
                frame: self.message_type.clone(),
                payload: other.unwrap_or_default().to_string(),
            }),
        }
    }
}

/// Decode a record file into its frame and message.
pub fn decode(data: &[u8]) -> Result<(RecordFrame, Message), DecodeError> {
    let frame = RecordFrame::from_bytes(data)?;
    let message = frame.message()?;
    Ok((frame, message))
}

// ── Cursor ──────────────────────────────────────────────────────────

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                need: self.pos + n,
                have: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array::<2>()?))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
