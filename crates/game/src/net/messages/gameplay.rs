use bytes::Bytes;

use crate::game::Controls;
use crate::net::canonical::CanonicalString;
use crate::net::message::{HasFrameNumber, NetMessage};
use crate::net::protocol::{Channel, ProtocolError};
use crate::net::serialization::EntityBatch;
use crate::net::wire::{WireReader, WireWriter};

macro_rules! frame_numbered {
    ($($ty:ty),*) => {
        $(impl HasFrameNumber for $ty {
            fn frame_number(&self) -> u32 {
                self.frame_number
            }
        })*
    };
}

frame_numbered!(
    PlayerControls,
    PlayerUpdate,
    ArenaFinish,
    GobCreation,
    GobUpdate,
    GobDeletion
);

/// Session-wide settings sent by the server after the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSettings {
    pub arena_playlist: Vec<CanonicalString>,
    pub time_limit_secs: u16,
}

impl NetMessage for GameSettings {
    const TYPE_ID: u8 = 20;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "GameSettings";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_count_u8(self.arena_playlist.len())?;
        for &arena in &self.arena_playlist {
            writer.put_canonical(arena);
        }
        writer.put_u16(self.time_limit_secs);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let count = reader.get_count_u8()?;
        let arena_playlist = (0..count)
            .map(|_| reader.get_canonical())
            .collect::<Result<_, _>>()?;
        Ok(Self {
            arena_playlist,
            time_limit_secs: reader.get_u16()?,
        })
    }
}

/// Client asks the server to register or update one of its local players.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSettingsRequest {
    /// Index of the player on the requesting machine.
    pub local_id: u8,
    /// Server-assigned id, present once the player has been registered.
    pub player_id: Option<u8>,
    pub name: String,
    pub ship: CanonicalString,
    pub weapon: CanonicalString,
}

impl NetMessage for PlayerSettingsRequest {
    const TYPE_ID: u8 = 21;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "PlayerSettingsRequest";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u8(self.local_id);
        writer.put_bool(self.player_id.is_some());
        writer.put_u8(self.player_id.unwrap_or(0));
        writer.put_string(&self.name)?;
        writer.put_canonical(self.ship);
        writer.put_canonical(self.weapon);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let local_id = reader.get_u8()?;
        let is_registered = reader.get_bool()?;
        let player_id = reader.get_u8()?;
        Ok(Self {
            local_id,
            player_id: is_registered.then_some(player_id),
            name: reader.get_string()?,
            ship: reader.get_canonical()?,
            weapon: reader.get_canonical()?,
        })
    }
}

/// Server's assignment of player ids to a client's local players.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSettingsReply {
    /// `(local_id, player_id)` pairs.
    pub assignments: Vec<(u8, u8)>,
}

impl NetMessage for PlayerSettingsReply {
    const TYPE_ID: u8 = 21;
    const IS_REPLY: bool = true;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "PlayerSettingsReply";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_count_u8(self.assignments.len())?;
        for &(local_id, player_id) in &self.assignments {
            writer.put_u8(local_id);
            writer.put_u8(player_id);
        }
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let count = reader.get_count_u8()?;
        let assignments = (0..count)
            .map(|_| Ok((reader.get_u8()?, reader.get_u8()?)))
            .collect::<Result<_, ProtocolError>>()?;
        Ok(Self { assignments })
    }
}

/// A player has left the game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerDeletion {
    pub player_id: u8,
}

impl NetMessage for PlayerDeletion {
    const TYPE_ID: u8 = 22;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "PlayerDeletion";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u8(self.player_id);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            player_id: reader.get_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerControls {
    pub frame_number: u32,
    pub player_id: u8,
    pub controls: Controls,
}

impl NetMessage for PlayerControls {
    const TYPE_ID: u8 = 23;
    const CHANNEL: Channel = Channel::Unreliable;
    const NAME: &'static str = "PlayerControls";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.frame_number);
        writer.put_u8(self.player_id);
        self.controls.encode(writer);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_number: reader.get_u32()?,
            player_id: reader.get_u8()?,
            controls: Controls::decode(reader)?,
        })
    }
}

/// Idempotent full score state of one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerUpdate {
    pub frame_number: u32,
    pub player_id: u8,
    pub kills: u16,
    pub deaths: u16,
    pub lives: u8,
}

impl NetMessage for PlayerUpdate {
    const TYPE_ID: u8 = 24;
    const CHANNEL: Channel = Channel::Unreliable;
    const NAME: &'static str = "PlayerUpdate";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.frame_number);
        writer.put_u8(self.player_id);
        writer.put_u16(self.kills);
        writer.put_u16(self.deaths);
        writer.put_u8(self.lives);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_number: reader.get_u32()?,
            player_id: reader.get_u8()?,
            kills: reader.get_u16()?,
            deaths: reader.get_u16()?,
            lives: reader.get_u8()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaStart {
    pub arena_name: CanonicalString,
    pub wall_count: u16,
    /// Time left in the arena when the message was sent.
    pub time_budget_ms: u32,
}

impl NetMessage for ArenaStart {
    const TYPE_ID: u8 = 25;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "ArenaStart";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_canonical(self.arena_name);
        writer.put_u16(self.wall_count);
        writer.put_u32(self.time_budget_ms);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            arena_name: reader.get_canonical()?,
            wall_count: reader.get_u16()?,
            time_budget_ms: reader.get_u32()?,
        })
    }
}

/// Client report of whether it is currently running an arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaStatus {
    pub is_running_arena: bool,
}

impl NetMessage for ArenaStatus {
    const TYPE_ID: u8 = 26;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "ArenaStatus";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_bool(self.is_running_arena);
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            is_running_arena: reader.get_bool()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Standing {
    pub player_id: u8,
    pub score: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaFinish {
    pub frame_number: u32,
    pub standings: Vec<Standing>,
}

impl NetMessage for ArenaFinish {
    const TYPE_ID: u8 = 27;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "ArenaFinish";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.frame_number);
        writer.put_count_u8(self.standings.len())?;
        for standing in &self.standings {
            writer.put_u8(standing.player_id);
            writer.put_i16(standing.score);
        }
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let frame_number = reader.get_u32()?;
        let count = reader.get_count_u8()?;
        let standings = (0..count)
            .map(|_| {
                Ok(Standing {
                    player_id: reader.get_u8()?,
                    score: reader.get_i16()?,
                })
            })
            .collect::<Result<_, ProtocolError>>()?;
        Ok(Self {
            frame_number,
            standings,
        })
    }
}

/// New gobs with their constant and current varying state.
///
/// Layout: frame number (u32), arena id (u8), gob count (u16), one layer
/// index byte per gob, one type name id (u16) per gob, one gob id (u16) per
/// gob, payload length (u16), payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GobCreation {
    pub frame_number: u32,
    pub arena_id: u8,
    pub layers: Vec<u8>,
    pub type_names: Vec<CanonicalString>,
    pub batch: EntityBatch,
}

impl NetMessage for GobCreation {
    const TYPE_ID: u8 = 28;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "GobCreation";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        let count = self.batch.len();
        if self.layers.len() != count || self.type_names.len() != count {
            return Err(ProtocolError::CountMismatch(Self::NAME));
        }
        writer.put_u32(self.frame_number);
        writer.put_u8(self.arena_id);
        writer.put_count_u16(count)?;
        for &layer in &self.layers {
            writer.put_u8(layer);
        }
        for &type_name in &self.type_names {
            writer.put_canonical(type_name);
        }
        self.batch.encode_ids(writer);
        writer.put_bytes(&self.batch.payload)
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let frame_number = reader.get_u32()?;
        let arena_id = reader.get_u8()?;
        let count = reader.get_count_u16()?;
        let layers = reader.get_raw(count)?.to_vec();
        let type_names = (0..count)
            .map(|_| reader.get_canonical())
            .collect::<Result<_, _>>()?;
        let ids = EntityBatch::decode_ids(reader, count)?;
        let payload = Bytes::copy_from_slice(reader.get_bytes()?);
        Ok(Self {
            frame_number,
            arena_id,
            layers,
            type_names,
            batch: EntityBatch::new(ids, payload),
        })
    }
}

/// Varying state of existing gobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GobUpdate {
    pub frame_number: u32,
    pub batch: EntityBatch,
}

impl NetMessage for GobUpdate {
    const TYPE_ID: u8 = 29;
    const CHANNEL: Channel = Channel::Unreliable;
    const NAME: &'static str = "GobUpdate";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.frame_number);
        self.batch.encode(writer)
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_number: reader.get_u32()?,
            batch: EntityBatch::decode(reader)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GobDeletion {
    pub frame_number: u32,
    pub gob_ids: Vec<u16>,
}

impl NetMessage for GobDeletion {
    const TYPE_ID: u8 = 30;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "GobDeletion";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u32(self.frame_number);
        writer.put_count_u16(self.gob_ids.len())?;
        for &id in &self.gob_ids {
            writer.put_u16(id);
        }
        Ok(())
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let frame_number = reader.get_u32()?;
        let count = reader.get_count_u16()?;
        Ok(Self {
            frame_number,
            gob_ids: EntityBatch::decode_ids(reader, count)?,
        })
    }
}

/// Chat text. Sent by clients to the server and relayed to everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerMessage {
    pub player_id: u8,
    pub text: String,
}

impl NetMessage for PlayerMessage {
    const TYPE_ID: u8 = 31;
    const CHANNEL: Channel = Channel::Reliable;
    const NAME: &'static str = "PlayerMessage";

    fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_u8(self.player_id);
        writer.put_string(&self.text)
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            player_id: reader.get_u8()?,
            text: reader.get_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use crate::game::{Control, ControlState};
    use crate::net::messages::MessageBody;
    use crate::net::registry::MessageRegistry;

    use super::*;

    #[test]
    fn test_gob_creation_layout() {
        let message = GobCreation {
            frame_number: 1,
            arena_id: 2,
            layers: vec![0, 1],
            type_names: vec![CanonicalString::from_id(3), CanonicalString::from_id(4)],
            batch: EntityBatch::new(vec![10, 11], Bytes::from_static(&[0xAB])),
        };
        let mut writer = WireWriter::new();
        message.encode(&mut writer).unwrap();
        assert_eq!(
            writer.as_slice(),
            &[0, 0, 0, 1, 2, 0, 2, 0, 1, 0, 3, 0, 4, 0, 10, 0, 11, 0, 1, 0xAB]
        );
    }

    #[test]
    fn test_gob_creation_rejects_inconsistent_counts() {
        let message = GobCreation {
            frame_number: 1,
            arena_id: 0,
            layers: vec![0],
            type_names: vec![],
            batch: EntityBatch::new(vec![10], Bytes::new()),
        };
        assert!(matches!(
            message.encode(&mut WireWriter::new()),
            Err(ProtocolError::CountMismatch("GobCreation"))
        ));
    }

    #[test]
    fn test_controls_survive_the_wire() {
        let registry = MessageRegistry::standard().unwrap();
        let message = PlayerControls {
            frame_number: 400,
            player_id: 3,
            controls: Controls::default()
                .with(Control::Left, ControlState::new(1.0, false))
                .with(Control::Fire1, ControlState::new(0.0, true)),
        };
        let frame = MessageBody::from(message).encode_frame().unwrap();
        let decoded = registry.decode(&frame, 1, Instant::now()).unwrap();
        let controls = decoded.get::<PlayerControls>().unwrap();

        assert_eq!(decoded.frame_number(), Some(400));
        assert_eq!(controls.controls.get(Control::Left).force, 1.0);
        assert!(controls.controls.get(Control::Fire1).pulse);
        assert_eq!(controls.controls.get(Control::Thrust), ControlState::default());
    }

    #[test]
    fn test_unregistered_player_settings() {
        let message = PlayerSettingsRequest {
            local_id: 0,
            player_id: None,
            name: "Kaylee".into(),
            ship: CanonicalString::from_id(4),
            weapon: CanonicalString::from_id(7),
        };
        let mut writer = WireWriter::new();
        message.encode(&mut writer).unwrap();
        let bytes = writer.into_bytes();
        let decoded = PlayerSettingsRequest::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(decoded, message);
    }
}
