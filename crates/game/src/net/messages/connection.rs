use crate::net::message::NetMessage;
use crate::net::protocol::{Channel, ProtocolError};
use crate::net::wire::{WireReader, WireWriter};

/// First message a client sends over the reliable channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub protocol_version: u16,
    /// Local port of the client's datagram socket, 0 if it has none.
    pub udp_port: u16,
}

impl NetMessage for HandshakeRequest {
    const TYPE_ID: u8 = 1;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "HandshakeRequest";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u16(self.protocol_version);
        writer.put_u16(self.udp_port);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            protocol_version: reader.get_u16()?,
            udp_port: reader.get_u16()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub connection_id: u32,
    pub challenge: u32,
    pub udp_port: u16,
}

impl NetMessage for HandshakeReply {
    const TYPE_ID: u8 = 1;
    const IS_REPLY: bool = true;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "HandshakeReply";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.connection_id);
        writer.put_u32(self.challenge);
        writer.put_u16(self.udp_port);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            connection_id: reader.get_u32()?,
            challenge: reader.get_u32()?,
            udp_port: reader.get_u16()?,
        })
    }
}

/// Hole-punch datagram. Sent in both directions until the unreliable path
/// is confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHandshake {
    pub connection_id: u32,
    pub challenge: u32,
}

impl NetMessage for UdpHandshake {
    const TYPE_ID: u8 = 2;
    const CHANNEL: Channel = Channel::Unreliable;
    const NAME: &'static str = "UdpHandshake";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.connection_id);
        writer.put_u32(self.challenge);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            connection_id: reader.get_u32()?,
            challenge: reader.get_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeComplete {
    pub connection_id: u32,
}

impl NetMessage for HandshakeComplete {
    const TYPE_ID: u8 = 3;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "HandshakeComplete";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.connection_id);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            connection_id: reader.get_u32()?,
        })
    }
}

/// Close notice sent once before a connection is torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosing {
    pub reason: String,
}

impl NetMessage for ConnectionClosing {
    const TYPE_ID: u8 = 4;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "ConnectionClosing";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_string(&self.reason)
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            reason: reader.get_string()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Sender-local milliseconds, echoed back untouched.
    pub sent_at_ms: u32,
    pub frame_number: u32,
}

impl NetMessage for Ping {
    const TYPE_ID: u8 = 5;
    const CHANNEL: Channel = Channel::Unreliable;
    const NAME: &'static str = "Ping";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.sent_at_ms);
        writer.put_u32(self.frame_number);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            sent_at_ms: reader.get_u32()?,
            frame_number: reader.get_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingReply {
    pub sent_at_ms: u32,
    /// Frame number of the replying peer when the reply was made.
    pub frame_number: u32,
}

impl NetMessage for PingReply {
    const TYPE_ID: u8 = 5;
    const IS_REPLY: bool = true;
    const CHANNEL: Channel = Channel::Unreliable;
    const NAME: &'static str = "PingReply";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.sent_at_ms);
        writer.put_u32(self.frame_number);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            sent_at_ms: reader.get_u32()?,
            frame_number: reader.get_u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::net::messages::MessageBody;
    use crate::net::registry::MessageRegistry;

    use super::*;

    fn round_trip(body: MessageBody) -> MessageBody {
        let registry = MessageRegistry::standard().unwrap();
        let frame = body.encode_frame().unwrap();
        registry.decode(&frame, 7, Instant::now()).unwrap().body
    }

    #[test]
    fn test_connection_messages_round_trip() {
        let messages: Vec<MessageBody> = vec![
            HandshakeRequest {
                protocol_version: 3,
                udp_port: 50123,
            }
            .into(),
            HandshakeReply {
                connection_id: 9,
                challenge: 0xDEADBEEF,
                udp_port: 16727,
            }
            .into(),
            UdpHandshake {
                connection_id: 9,
                challenge: 0xDEADBEEF,
            }
            .into(),
            HandshakeComplete { connection_id: 9 }.into(),
            ConnectionClosing {
                reason: "Server full".into(),
            }
            .into(),
            Ping {
                sent_at_ms: 1234,
                frame_number: 77,
            }
            .into(),
            PingReply {
                sent_at_ms: 1234,
                frame_number: 80,
            }
            .into(),
        ];

        for message in messages {
            assert_eq!(round_trip(message.clone()), message);
        }
    }

    #[test]
    fn test_reply_flag_on_wire() {
        let frame = MessageBody::from(PingReply {
            sent_at_ms: 0,
            frame_number: 0,
        })
        .encode_frame()
        .unwrap();
        assert_eq!(frame[0], 5);
        assert_eq!(frame[1] & 0x80, 0x80);
    }
}
