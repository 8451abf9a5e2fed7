pub mod game;
pub mod net;

pub use game::{
    Arena, Control, ControlState, Controls, GameState, Gob, GobKind, Player, ShipPhysics,
};
pub use net::{
    Channel, ClientSession, DropReason, MessageBody, MessageRegistry, NetConfig, ProtocolError,
    ServerSession, SessionEvent, TransportError, DEFAULT_FRAME_RATE, DEFAULT_PORT,
    PROTOCOL_VERSION,
};
