//! Binary protocol for document sync and awareness.
//!
//! Wire format (y-protocols compatible, every integer a lib0 varint):
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ tag     │ body                                         │
//! ├─────────┼──────────────────────────────────────────────┤
//! │ 0 sync  │ sub-tag (0 step1, 1 step2, 2 update) + buf   │
//! │ 1 aware │ buf (awareness update blob)                  │
//! │ 2 auth  │ buf                                          │
//! │ 3 query │ (none)                                       │
//! │ ≥100    │ buf (custom, tag preserved)                  │
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Decoding is strict so that `encode(decode(b)) == b` for every accepted `b`.

pub use yrs::sync::protocol::{
    MSG_AUTH, MSG_AWARENESS, MSG_QUERY_AWARENESS, MSG_SYNC, MSG_SYNC_STEP_1, MSG_SYNC_STEP_2,
    MSG_SYNC_UPDATE,
};

use crate::encoding::{var_len, Reader, Write};

/// Lowest tag available to application-defined messages.
pub const MSG_CUSTOM_MIN: u32 = 100;

// Decoded tags are wider than the lib0 constants.
const TAG_SYNC: u64 = MSG_SYNC as u64;
const TAG_AWARENESS: u64 = MSG_AWARENESS as u64;
const TAG_AUTH: u64 = MSG_AUTH as u64;
const TAG_QUERY_AWARENESS: u64 = MSG_QUERY_AWARENESS as u64;
const TAG_SYNC_STEP_1: u64 = MSG_SYNC_STEP_1 as u64;
const TAG_SYNC_STEP_2: u64 = MSG_SYNC_STEP_2 as u64;
const TAG_SYNC_UPDATE: u64 = MSG_SYNC_UPDATE as u64;

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Encoded state vector of the sender; asks for everything it is missing.
    SyncStep1(Vec<u8>),
    /// Update answering a `SyncStep1`.
    SyncStep2(Vec<u8>),
    /// Incremental update produced by a committed transaction.
    SyncUpdate(Vec<u8>),
    /// Awareness update blob (see [`crate::awareness`]).
    Awareness(Vec<u8>),
    /// Request for a full awareness snapshot.
    QueryAwareness,
    /// Opaque authentication payload.
    Auth(Vec<u8>),
    /// Application-defined message with a tag of at least [`MSG_CUSTOM_MIN`].
    Custom(u32, Vec<u8>),
}

impl Message {
    pub fn sync_step1(state_vector: impl Into<Vec<u8>>) -> Self {
        Self::SyncStep1(state_vector.into())
    }

    pub fn sync_step2(update: impl Into<Vec<u8>>) -> Self {
        Self::SyncStep2(update.into())
    }

    pub fn sync_update(update: impl Into<Vec<u8>>) -> Self {
        Self::SyncUpdate(update.into())
    }

    /// Short variant name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SyncStep1(_) => "sync_step1",
            Self::SyncStep2(_) => "sync_step2",
            Self::SyncUpdate(_) => "sync_update",
            Self::Awareness(_) => "awareness",
            Self::QueryAwareness => "query_awareness",
            Self::Auth(_) => "auth",
            Self::Custom(..) => "custom",
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf: Vec<u8> = Vec::with_capacity(self.encoded_len_hint());
        match self {
            Self::SyncStep1(payload) => encode_sync(&mut buf, MSG_SYNC_STEP_1, payload),
            Self::SyncStep2(payload) => encode_sync(&mut buf, MSG_SYNC_STEP_2, payload),
            Self::SyncUpdate(payload) => encode_sync(&mut buf, MSG_SYNC_UPDATE, payload),
            Self::Awareness(payload) => {
                buf.write_var(MSG_AWARENESS);
                buf.write_buf(payload);
            }
            Self::QueryAwareness => buf.write_var(MSG_QUERY_AWARENESS),
            Self::Auth(payload) => {
                buf.write_var(MSG_AUTH);
                buf.write_buf(payload);
            }
            Self::Custom(tag, payload) => {
                if *tag < MSG_CUSTOM_MIN {
                    return Err(EncodeError::ReservedTag(*tag));
                }
                buf.write_var(*tag);
                buf.write_buf(payload);
            }
        }
        Ok(buf)
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.is_empty() {
            return Err(DecodeError::Empty);
        }
        let mut reader = Reader::new(bytes);
        let tag = reader.read_var()?;
        let msg = match tag {
            TAG_SYNC => {
                let sub_offset = reader.position();
                let sub = reader.read_var()?;
                let payload = reader.read_buf()?.to_vec();
                match sub {
                    TAG_SYNC_STEP_1 => Self::SyncStep1(payload),
                    TAG_SYNC_STEP_2 => Self::SyncStep2(payload),
                    TAG_SYNC_UPDATE => Self::SyncUpdate(payload),
                    other => {
                        return Err(DecodeError::UnknownSyncTag { offset: sub_offset, tag: other })
                    }
                }
            }
            TAG_AWARENESS => Self::Awareness(reader.read_buf()?.to_vec()),
            TAG_AUTH => Self::Auth(reader.read_buf()?.to_vec()),
            TAG_QUERY_AWARENESS => Self::QueryAwareness,
            tag if tag >= MSG_CUSTOM_MIN as u64 => {
                let tag = u32::try_from(tag)
                    .map_err(|_| DecodeError::ValueOutOfRange { offset: 0, value: tag })?;
                Self::Custom(tag, reader.read_buf()?.to_vec())
            }
            other => return Err(DecodeError::UnknownMessageTag(other)),
        };
        reader.finish()?;
        Ok(msg)
    }

    fn encoded_len_hint(&self) -> usize {
        let payload = match self {
            Self::SyncStep1(p) | Self::SyncStep2(p) | Self::SyncUpdate(p) => p.len() + 1,
            Self::Awareness(p) | Self::Auth(p) | Self::Custom(_, p) => p.len(),
            Self::QueryAwareness => 0,
        };
        1 + var_len(payload as u64) + payload
    }
}

fn encode_sync(buf: &mut Vec<u8>, sub_tag: u8, payload: &[u8]) {
    buf.write_var(MSG_SYNC);
    buf.write_var(sub_tag);
    buf.write_buf(payload);
}

/// Free-function form of [`Message::decode`].
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    Message::decode(bytes)
}

/// Free-function form of [`Message::encode`].
pub fn encode(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    msg.encode()
}

/// Malformed or truncated input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,

    #[error("unexpected end of input at byte {offset} while reading {expected}")]
    UnexpectedEof { offset: usize, expected: &'static str },

    #[error("payload at byte {offset} declares {declared} bytes but only {available} remain")]
    TruncatedPayload { offset: usize, declared: usize, available: usize },

    #[error("varint at byte {offset} does not fit in 64 bits")]
    VarintOverflow { offset: usize },

    #[error("varint at byte {offset} is not minimally encoded")]
    NonCanonicalVarint { offset: usize },

    #[error("value {value} at byte {offset} is out of range")]
    ValueOutOfRange { offset: usize, value: u64 },

    #[error("unknown message tag {0}")]
    UnknownMessageTag(u64),

    #[error("unknown sync message tag {tag} at byte {offset}")]
    UnknownSyncTag { offset: usize, tag: u64 },

    #[error("{count} trailing bytes after message end at byte {offset}")]
    TrailingBytes { offset: usize, count: usize },

    #[error("invalid UTF-8 string at byte {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("invalid awareness state JSON for client {client_id}: {reason}")]
    InvalidState { client_id: u64, reason: String },
}

/// A message that cannot be represented on the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("custom message tag {0} is reserved (custom tags start at {MSG_CUSTOM_MIN})")]
    ReservedTag(u32),
}
