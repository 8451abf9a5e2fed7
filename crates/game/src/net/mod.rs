//! Connection and message layer shared by the game client and server.

mod canonical;
mod client;
mod config;
mod connection;
mod events;
mod handlers;
mod message;
pub mod messages;
mod ping;
mod protocol;
mod registry;
mod serialization;
mod server;
pub mod transport;
mod wire;

pub use canonical::{CanonicalString, CanonicalStrings};
pub use client::{ClientGameState, ClientSession, ConnectCallback};
pub use config::NetConfig;
pub use connection::{
    ArenaState, Connection, GameClientConnection, GameServerConnection, HandshakeState, Received,
    RemovalState,
};
pub use events::{DropReason, SessionEvent};
pub use handlers::{HandlerContext, HandlerControl, HandlerId, MessageHandlers, Outbox, Target};
pub use message::{BodyVariant, ConnectionId, HasFrameNumber, Message, MessageHeader, NetMessage};
pub use messages::{
    ArenaFinish, ArenaStart, ArenaStatus, ConnectionClosing, GameSettings, GobCreation,
    GobDeletion, GobUpdate, HandshakeComplete, HandshakeReply, HandshakeRequest, MessageBody, Ping,
    PingReply, PlayerControls, PlayerDeletion, PlayerMessage, PlayerSettingsReply,
    PlayerSettingsRequest, PlayerUpdate, Standing, UdpHandshake,
};
pub use ping::PingInfo;
pub use protocol::{
    encode_frame, split_frames, Channel, FrameHeader, MessageKey, ProtocolError, DEFAULT_FRAME_RATE,
    DEFAULT_PORT, FRAME_HEADER_LEN, MAX_BODY_LEN, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
pub use registry::{MessageEntry, MessageRegistry, RegistryError};
pub use serialization::{
    BatchReadOutcome, EntityBatch, EntityBatchWriter, EntityLookup, NetSerializable,
    SerializationModeFlags, Staleness,
};
pub use server::{AdmissionFn, ServerGameState, ServerSession};
pub use transport::{
    Connector, InboundQueue, Listener, LocalRelayHub, PeerAddr, RawFrame, RelayPeerId, Transport,
    TransportError,
};
pub use wire::{
    decode_angle, decode_force, decode_velocity, encode_angle, encode_force, encode_velocity,
    WireReader, WireWriter,
};
