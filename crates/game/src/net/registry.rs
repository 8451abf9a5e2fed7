//! Startup-built table binding `{type id, is-reply}` keys to decoders.

use std::collections::HashMap;
use std::time::Instant;

use super::message::{ConnectionId, Message, NetMessage};
use super::messages::{MessageBody, standard_entries};
use super::protocol::{Channel, FrameHeader, MessageKey, ProtocolError};
use super::wire::WireReader;

pub type DecodeFn = fn(&mut WireReader<'_>) -> Result<MessageBody, ProtocolError>;

#[derive(Debug, Clone, Copy)]
pub struct MessageEntry {
    pub key: MessageKey,
    pub name: &'static str,
    pub channel: Channel,
    decode: DecodeFn,
}

impl MessageEntry {
    pub fn new(key: MessageKey, name: &'static str, channel: Channel, decode: DecodeFn) -> Self {
        Self {
            key,
            name,
            channel,
            decode,
        }
    }

    pub fn of<T: NetMessage>() -> Self {
        Self::new(T::key(), T::NAME, T::CHANNEL, decode_as::<T>)
    }
}

fn decode_as<T: NetMessage>(reader: &mut WireReader<'_>) -> Result<MessageBody, ProtocolError> {
    T::decode(reader).map(Into::into)
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("message key {key} registered twice ({first} and {second})")]
    Duplicate {
        key: MessageKey,
        first: &'static str,
        second: &'static str,
    },
}

#[derive(Debug)]
pub struct MessageRegistry {
    entries: HashMap<MessageKey, MessageEntry>,
}

impl MessageRegistry {
    /// Builds a registry, rejecting any key collision.
    pub fn from_entries<I>(entries: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = MessageEntry>,
    {
        let mut map: HashMap<MessageKey, MessageEntry> = HashMap::new();
        for entry in entries {
            if let Some(existing) = map.get(&entry.key) {
                return Err(RegistryError::Duplicate {
                    key: entry.key,
                    first: existing.name,
                    second: entry.name,
                });
            }
            map.insert(entry.key, entry);
        }
        log::debug!("Message registry built with {} entries", map.len());
        Ok(Self { entries: map })
    }

    /// Registry holding every built-in connection and gameplay message.
    pub fn standard() -> Result<Self, RegistryError> {
        Self::from_entries(standard_entries())
    }

    pub fn get(&self, key: MessageKey) -> Option<&MessageEntry> {
        self.entries.get(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decodes one complete frame received on `connection_id` at `received_at`.
    pub fn decode(
        &self,
        frame: &[u8],
        connection_id: ConnectionId,
        received_at: Instant,
    ) -> Result<Message, ProtocolError> {
        let (header, body) = FrameHeader::decode(frame)?;
        let entry = self
            .entries
            .get(&header.key)
            .ok_or(ProtocolError::UnknownMessage(header.key))?;

        let mut reader = WireReader::new(body);
        let body = (entry.decode)(&mut reader)?;
        reader.finish()?;

        Ok(Message::new(connection_id, received_at, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::messages::{Ping, PingReply};
    use crate::net::protocol::encode_frame;

    #[test]
    fn test_standard_registry_has_no_collisions() {
        let registry = MessageRegistry::standard().unwrap();
        assert_eq!(registry.len(), standard_entries().len());
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let result = MessageRegistry::from_entries([
            MessageEntry::of::<Ping>(),
            MessageEntry::new(Ping::key(), "Impostor", Channel::Reliable, |_| {
                Err(ProtocolError::TooShort)
            }),
        ]);

        assert!(matches!(
            result,
            Err(RegistryError::Duplicate { first: "Ping", second: "Impostor", .. })
        ));
    }

    #[test]
    fn test_request_and_reply_share_type_id() {
        assert_eq!(Ping::TYPE_ID, PingReply::TYPE_ID);
        let registry = MessageRegistry::standard().unwrap();
        assert_eq!(registry.get(Ping::key()).unwrap().name, "Ping");
        assert_eq!(registry.get(PingReply::key()).unwrap().name, "PingReply");
    }

    #[test]
    fn test_unknown_key_fails() {
        let registry = MessageRegistry::standard().unwrap();
        let frame = encode_frame(MessageKey::request(250), &[]).unwrap();
        assert!(matches!(
            registry.decode(&frame, 1, Instant::now()),
            Err(ProtocolError::UnknownMessage(_))
        ));
    }

    #[test]
    fn test_body_must_be_consumed() {
        let registry = MessageRegistry::standard().unwrap();
        let mut frame = MessageBody::from(Ping {
            sent_at_ms: 1,
            frame_number: 2,
        })
        .encode_frame()
        .unwrap()
        .to_vec();
        frame[3] += 1;
        frame.push(0);

        assert!(matches!(
            registry.decode(&frame, 1, Instant::now()),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }
}
