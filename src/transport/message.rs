//! Serialized message unit.
//!
//! A [`Message`] is stored exactly as it travels on the wire: a 16-byte
//! header followed by the payload. The pool and the failover journal treat it
//! as an opaque, atomic unit; only the framing needed to delimit messages in a
//! byte stream lives here.
//!
//! ```text
//! 0       1       2          3           4              8         12         16
//! +-------+-------+----------+-----------+--------------+---------+----------+
//! |version|  tag  | priority | fragment  | payload len  | seconds | micros   |
//! +-------+-------+----------+-----------+--------------+---------+----------+
//! ```
//!
//! Multi-byte fields are big endian.

use std::io::{self, Read};

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed message header.
pub const HEADER_SIZE: usize = 16;

/// Header version written by this crate.
pub const MESSAGE_VERSION: u8 = 1;

/// Largest accepted payload. Anything bigger is treated as malformed.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// Header carries a version this crate does not understand.
    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),

    /// Payload length exceeds [`MAX_PAYLOAD_SIZE`].
    #[error("message payload of {0} bytes exceeds the limit")]
    TooLarge(usize),

    /// Buffer length does not match the header.
    #[error("truncated message: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Length announced by the header.
        expected: usize,
        /// Length available.
        actual: usize,
    },

    /// Underlying stream failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One serialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Vec<u8>,
}

impl Message {
    /// Tag of IDMEF alert/heartbeat payloads.
    pub const TAG_IDMEF: u8 = 0;
    /// Tag of the handshake sent after connecting.
    pub const TAG_HELLO: u8 = 1;
    /// Tag of administrative options requests.
    pub const TAG_OPTION: u8 = 2;

    /// No priority set.
    pub const PRIORITY_NONE: u8 = 0;
    /// Low priority.
    pub const PRIORITY_LOW: u8 = 1;
    /// Medium priority.
    pub const PRIORITY_MID: u8 = 2;
    /// High priority.
    pub const PRIORITY_HIGH: u8 = 3;

    /// Builds a message stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::TooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn new(tag: u8, priority: u8, payload: impl AsRef<[u8]>) -> Result<Self, MessageError> {
        let payload = payload.as_ref();
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|_| payload.len() <= MAX_PAYLOAD_SIZE)
            .ok_or(MessageError::TooLarge(payload.len()))?;

        let now = Utc::now();
        let seconds = u32::try_from(now.timestamp()).unwrap_or(u32::MAX);

        let mut bytes = Vec::with_capacity(HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&[MESSAGE_VERSION, tag, priority, 0]);
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&seconds.to_be_bytes());
        bytes.extend_from_slice(&now.timestamp_subsec_micros().to_be_bytes());
        bytes.extend_from_slice(payload);
        Ok(Self { bytes })
    }

    /// Builds an IDMEF message with no priority.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::TooLarge`] if the payload is too big.
    pub fn idmef(payload: impl AsRef<[u8]>) -> Result<Self, MessageError> {
        Self::new(Self::TAG_IDMEF, Self::PRIORITY_NONE, payload)
    }

    /// Marks the message as one fragment of a larger unit.
    #[must_use]
    pub fn with_fragment(mut self, fragment: bool) -> Self {
        if let Some(flag) = self.bytes.get_mut(3) {
            *flag = u8::from(fragment);
        }
        self
    }

    /// Decodes exactly one message from `buf`.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] if the header is invalid or `buf` does not
    /// hold exactly the announced length.
    pub fn decode(buf: &[u8]) -> Result<Self, MessageError> {
        let header = buf.get(..HEADER_SIZE).ok_or(MessageError::Truncated {
            expected: HEADER_SIZE,
            actual: buf.len(),
        })?;
        let expected = HEADER_SIZE + payload_len(header)?;
        if buf.len() != expected {
            return Err(MessageError::Truncated {
                expected,
                actual: buf.len(),
            });
        }
        Ok(Self {
            bytes: buf.to_vec(),
        })
    }

    /// Reads one message from a blocking reader.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] on I/O failure (including a short read) or
    /// an invalid header.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, MessageError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let len = payload_len(&header)?;

        let mut bytes = vec![0u8; HEADER_SIZE + len];
        let (head, body) = bytes.split_at_mut(HEADER_SIZE);
        head.copy_from_slice(&header);
        reader.read_exact(body)?;
        Ok(Self { bytes })
    }

    /// Reads one message from an async stream.
    ///
    /// # Errors
    ///
    /// Returns a [`MessageError`] on I/O failure, end of stream or an
    /// invalid header.
    pub async fn read_async<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self, MessageError> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        let len = payload_len(&header)?;

        let mut bytes = vec![0u8; HEADER_SIZE + len];
        let (head, body) = bytes.split_at_mut(HEADER_SIZE);
        head.copy_from_slice(&header);
        reader.read_exact(body).await?;
        Ok(Self { bytes })
    }

    /// Writes the serialized message to an async stream.
    ///
    /// # Errors
    ///
    /// Returns the stream's I/O error.
    pub async fn write_async<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.bytes).await?;
        writer.flush().await
    }

    /// Serialized length (header included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`: a message carries at least its header.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Serialized bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Payload bytes.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.bytes.get(HEADER_SIZE..).unwrap_or_default()
    }

    /// Message tag.
    #[must_use]
    pub fn tag(&self) -> u8 {
        self.header_byte(1)
    }

    /// Message priority.
    #[must_use]
    pub fn priority(&self) -> u8 {
        self.header_byte(2)
    }

    /// Whether the message is a fragment of a larger unit.
    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.header_byte(3) != 0
    }

    /// Creation time recorded in the header.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let seconds = read_u32(&self.bytes, 8)?;
        let micros = read_u32(&self.bytes, 12)?;
        DateTime::from_timestamp(i64::from(seconds), micros.saturating_mul(1000))
    }

    fn header_byte(&self, offset: usize) -> u8 {
        self.bytes.get(offset).copied().unwrap_or_default()
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let raw: [u8; 4] = buf.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

/// Validates a header and returns the payload length it announces.
fn payload_len(header: &[u8]) -> Result<usize, MessageError> {
    let version = header.first().copied().unwrap_or_default();
    if version != MESSAGE_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    let len = read_u32(header, 4).ok_or(MessageError::Truncated {
        expected: HEADER_SIZE,
        actual: header.len(),
    })?;
    let len = usize::try_from(len).map_err(|_| MessageError::TooLarge(usize::MAX))?;
    if len > MAX_PAYLOAD_SIZE {
        return Err(MessageError::TooLarge(len));
    }
    Ok(len)
}
