mod connection;
mod gameplay;

pub use connection::{
    ConnectionClosing, HandshakeComplete, HandshakeReply, HandshakeRequest, Ping, PingReply,
    UdpHandshake,
};
pub use gameplay::{
    ArenaFinish, ArenaStart, ArenaStatus, GameSettings, GobCreation, GobDeletion, GobUpdate,
    PlayerControls, PlayerDeletion, PlayerMessage, PlayerSettingsReply, PlayerSettingsRequest,
    PlayerUpdate, Standing,
};

use super::message::{BodyVariant, HasFrameNumber, NetMessage};
use super::protocol::{Channel, MessageKey, ProtocolError};
use super::registry::MessageEntry;
use super::wire::WireWriter;

macro_rules! message_set {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        /// Closed set of every message shape the protocol knows.
        #[derive(Debug, Clone, PartialEq)]
        pub enum MessageBody {
            $($variant($ty),)*
        }

        impl MessageBody {
            pub fn key(&self) -> MessageKey {
                match self {
                    $(Self::$variant(_) => <$ty as NetMessage>::key(),)*
                }
            }

            pub fn channel(&self) -> Channel {
                match self {
                    $(Self::$variant(_) => <$ty as NetMessage>::CHANNEL,)*
                }
            }

            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => <$ty as NetMessage>::NAME,)*
                }
            }

            pub fn encode_body(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
                match self {
                    $(Self::$variant(message) => message.encode(writer),)*
                }
            }
        }

        $(
            impl From<$ty> for MessageBody {
                fn from(message: $ty) -> Self {
                    Self::$variant(message)
                }
            }

            impl BodyVariant for $ty {
                fn from_body(body: &MessageBody) -> Option<&Self> {
                    match body {
                        MessageBody::$variant(message) => Some(message),
                        _ => None,
                    }
                }
            }
        )*

        /// Registration table of every built-in message, in type id order.
        pub fn standard_entries() -> Vec<MessageEntry> {
            vec![$(MessageEntry::of::<$ty>(),)*]
        }
    };
}

message_set! {
    HandshakeRequest(HandshakeRequest),
    HandshakeReply(HandshakeReply),
    UdpHandshake(UdpHandshake),
    HandshakeComplete(HandshakeComplete),
    ConnectionClosing(ConnectionClosing),
    Ping(Ping),
    PingReply(PingReply),
    GameSettings(GameSettings),
    PlayerSettingsRequest(PlayerSettingsRequest),
    PlayerSettingsReply(PlayerSettingsReply),
    PlayerDeletion(PlayerDeletion),
    PlayerControls(PlayerControls),
    PlayerUpdate(PlayerUpdate),
    ArenaStart(ArenaStart),
    ArenaStatus(ArenaStatus),
    ArenaFinish(ArenaFinish),
    GobCreation(GobCreation),
    GobUpdate(GobUpdate),
    GobDeletion(GobDeletion),
    PlayerMessage(PlayerMessage),
}

impl MessageBody {
    pub fn frame_number(&self) -> Option<u32> {
        match self {
            Self::PlayerControls(m) => Some(m.frame_number()),
            Self::PlayerUpdate(m) => Some(m.frame_number()),
            Self::ArenaFinish(m) => Some(m.frame_number()),
            Self::GobCreation(m) => Some(m.frame_number()),
            Self::GobUpdate(m) => Some(m.frame_number()),
            Self::GobDeletion(m) => Some(m.frame_number()),
            _ => None,
        }
    }

    /// Messages consumed by the session layer itself rather than game handlers.
    pub fn is_connection_control(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRequest(_)
                | Self::HandshakeReply(_)
                | Self::UdpHandshake(_)
                | Self::HandshakeComplete(_)
                | Self::ConnectionClosing(_)
                | Self::Ping(_)
                | Self::PingReply(_)
                | Self::ArenaStatus(_)
        )
    }
}
