use bytes::{BufMut, Bytes, BytesMut};

pub const DEFAULT_PORT: u16 = 16727;
pub const DEFAULT_FRAME_RATE: u32 = 60;
pub const PROTOCOL_VERSION: u16 = 3;

pub const FRAME_HEADER_LEN: usize = 4;
pub const MAX_BODY_LEN: usize = u16::MAX as usize;
pub const MAX_DATAGRAM_SIZE: usize = 1200;

const REPLY_FLAG: u8 = 0x80;

/// Logical path a message type is statically bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Reliable and ordered. Handshake, settings and lifecycle messages.
    Reliable,
    /// May be lost or reordered. Positions, controls and pings.
    Unreliable,
}

/// Registry key of a message shape. Requests and replies may share a type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey {
    pub type_id: u8,
    pub is_reply: bool,
}

impl MessageKey {
    pub const fn new(type_id: u8, is_reply: bool) -> Self {
        Self { type_id, is_reply }
    }

    pub const fn request(type_id: u8) -> Self {
        Self::new(type_id, false)
    }

    pub const fn reply(type_id: u8) -> Self {
        Self::new(type_id, true)
    }
}

impl std::fmt::Display for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_reply {
            write!(f, "{}/reply", self.type_id)
        } else {
            write!(f, "{}", self.type_id)
        }
    }
}

/// Frame header (wire format).
///
/// Layout (bytes, network byte order):
/// - 0     type id
/// - 1     flags, bit 7 = is-reply, other bits reserved
/// - 2..4  body length (u16)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub key: MessageKey,
    pub body_len: u16,
}

impl FrameHeader {
    pub const LEN: usize = FRAME_HEADER_LEN;

    pub fn new(key: MessageKey, body_len: usize) -> Result<Self, ProtocolError> {
        let body_len = u16::try_from(body_len).map_err(|_| ProtocolError::BodyTooLarge(body_len))?;
        Ok(Self { key, body_len })
    }

    pub fn flags(&self) -> u8 {
        if self.key.is_reply { REPLY_FLAG } else { 0 }
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.put_u8(self.key.type_id);
        out.put_u8(self.flags());
        out.put_u16(self.body_len);
    }

    /// Reads the header at the start of `buf` without checking the body.
    pub fn peek(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ProtocolError::TooShort);
        }
        let key = MessageKey::new(buf[0], buf[1] & REPLY_FLAG != 0);
        let body_len = u16::from_be_bytes([buf[2], buf[3]]);
        Ok(Self { key, body_len })
    }

    /// Decodes a buffer that holds exactly one `[Header][Body]` frame.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), ProtocolError> {
        let header = Self::peek(buf)?;
        if buf.len() != FRAME_HEADER_LEN + header.body_len as usize {
            return Err(ProtocolError::LengthMismatch {
                expected: header.body_len as usize,
                actual: buf.len() - FRAME_HEADER_LEN,
            });
        }
        Ok((header, &buf[FRAME_HEADER_LEN..]))
    }

    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_LEN + self.body_len as usize
    }
}

/// Builds a complete frame from an already serialized body.
pub fn encode_frame(key: MessageKey, body: &[u8]) -> Result<Bytes, ProtocolError> {
    let header = FrameHeader::new(key, body.len())?;
    let mut out = BytesMut::with_capacity(header.frame_len());
    header.encode_into(&mut out);
    out.extend_from_slice(body);
    Ok(out.freeze())
}

/// Splits a datagram into the frames it carries.
///
/// A datagram must consist of whole frames only; a trailing partial frame
/// rejects the whole datagram.
pub fn split_frames(buf: &[u8]) -> Result<Vec<&[u8]>, ProtocolError> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while offset < buf.len() {
        let header = FrameHeader::peek(&buf[offset..])?;
        let end = offset + header.frame_len();
        if end > buf.len() {
            return Err(ProtocolError::LengthMismatch {
                expected: header.body_len as usize,
                actual: buf.len() - offset - FRAME_HEADER_LEN,
            });
        }
        frames.push(&buf[offset..end]);
        offset = end;
    }

    Ok(frames)
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("buffer too short")]
    TooShort,
    #[error("body length mismatch: header says {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),
    #[error("body too large for frame: {0} bytes")]
    BodyTooLarge(usize),
    #[error("unknown message {0}")]
    UnknownMessage(MessageKey),
    #[error("count overflow: {count} does not fit in {bits} bits")]
    CountOverflow { count: usize, bits: u32 },
    #[error("invalid {what} tag {tag}")]
    InvalidTag { what: &'static str, tag: u8 },
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("unknown canonical string id {0}")]
    UnknownCanonical(u16),
    #[error("canonical string table is full at {0} names")]
    CanonicalTableFull(usize),
    #[error("per-item field counts disagree in {0}")]
    CountMismatch(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_network_order() {
        let frame = encode_frame(MessageKey::reply(7), &[0xAA; 0x0102]).unwrap();

        assert_eq!(frame[0], 7);
        assert_eq!(frame[1], 0x80);
        assert_eq!(&frame[2..4], &[0x01, 0x02]);
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 0x0102);
    }

    #[test]
    fn test_decode_requires_exact_length() {
        let frame = encode_frame(MessageKey::request(3), &[1, 2, 3]).unwrap();
        let (header, body) = FrameHeader::decode(&frame).unwrap();
        assert_eq!(header.key, MessageKey::request(3));
        assert_eq!(body, &[1, 2, 3]);

        let mut too_long = frame.to_vec();
        too_long.push(9);
        assert!(matches!(
            FrameHeader::decode(&too_long),
            Err(ProtocolError::LengthMismatch { .. })
        ));
        assert!(FrameHeader::decode(&frame[..frame.len() - 1]).is_err());
        assert!(matches!(
            FrameHeader::decode(&frame[..2]),
            Err(ProtocolError::TooShort)
        ));
    }

    #[test]
    fn test_oversized_body_is_rejected() {
        let body = vec![0u8; MAX_BODY_LEN + 1];
        assert!(matches!(
            encode_frame(MessageKey::request(1), &body),
            Err(ProtocolError::BodyTooLarge(_))
        ));
    }

    #[test]
    fn test_split_frames() {
        let mut datagram = encode_frame(MessageKey::request(1), &[1]).unwrap().to_vec();
        datagram.extend_from_slice(&encode_frame(MessageKey::reply(2), &[2, 2]).unwrap());

        let frames = split_frames(&datagram).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].len(), FRAME_HEADER_LEN + 2);

        datagram.pop();
        assert!(split_frames(&datagram).is_err());
    }
}
