use std::time::Instant;

use bytes::Bytes;

use super::messages::MessageBody;
use super::protocol::{Channel, MessageKey, ProtocolError, encode_frame};
use super::wire::{WireReader, WireWriter};

pub type ConnectionId = u32;

/// Binary layout of one message shape.
pub trait NetMessage: Sized + Into<MessageBody> + BodyVariant {
    const TYPE_ID: u8;
    const IS_REPLY: bool = false;
    const CHANNEL: Channel;
    const NAME: &'static str;

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError>;
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError>;

    fn key() -> MessageKey {
        MessageKey::new(Self::TYPE_ID, Self::IS_REPLY)
    }
}

/// Typed access to the variant of [`MessageBody`] that carries `Self`.
pub trait BodyVariant {
    fn from_body(body: &MessageBody) -> Option<&Self>;
}

/// Gameplay messages stamped with the sender's frame number.
pub trait HasFrameNumber {
    fn frame_number(&self) -> u32;
}

/// Header shared by every message. Not part of the wire layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub connection_id: ConnectionId,
    pub created_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn new(connection_id: ConnectionId, created_at: Instant, body: impl Into<MessageBody>) -> Self {
        Self {
            header: MessageHeader {
                connection_id,
                created_at,
            },
            body: body.into(),
        }
    }

    pub fn key(&self) -> MessageKey {
        self.body.key()
    }

    pub fn channel(&self) -> Channel {
        self.body.channel()
    }

    pub fn frame_number(&self) -> Option<u32> {
        self.body.frame_number()
    }

    pub fn get<T: BodyVariant>(&self) -> Option<&T> {
        T::from_body(&self.body)
    }
}

impl MessageBody {
    /// Serializes the body and wraps it in a frame. Deterministic.
    pub fn encode_frame(&self) -> Result<Bytes, ProtocolError> {
        let mut writer = WireWriter::with_capacity(64);
        self.encode_body(&mut writer)?;
        encode_frame(self.key(), writer.as_slice())
    }
}
