use std::collections::BTreeMap;
use std::time::Duration;

use crate::net::{
    ArenaFinish, ArenaStart, BatchReadOutcome, CanonicalString, CanonicalStrings, ClientGameState,
    ConnectionId, GameSettings, GobCreation, GobUpdate, MessageBody, PlayerSettingsReply,
    PlayerSettingsRequest, ProtocolError, SerializationModeFlags, ServerGameState, Staleness, Standing,
    DEFAULT_FRAME_RATE,
};

use super::arena::Arena;
use super::player::Player;

/// Gameplay state shared by both roles. Only the parts the network layer
/// reads or writes live here.
#[derive(Debug)]
pub struct GameState {
    pub frame_number: u32,
    pub frame_rate: u32,
    pub strings: CanonicalStrings,
    pub settings: GameSettings,
    players: BTreeMap<u8, Player>,
    pub arena: Option<Arena>,
    /// Server: an arena is being played.
    pub arena_active: bool,
    /// Client: the local arena is running.
    pub running_arena: bool,
    arena_end_frame: Option<u32>,
    arena_count: u8,
    pub standings: Vec<Standing>,
    pub chat: Vec<(u8, String)>,
    /// Client: local players waiting for the server to assign an id.
    local_requests: BTreeMap<u8, PlayerSettingsRequest>,
}

impl Default for GameState {
    fn default() -> Self {
        Self::new(CanonicalStrings::standard())
    }
}

impl GameState {
    pub fn new(strings: CanonicalStrings) -> Self {
        Self {
            frame_number: 0,
            frame_rate: DEFAULT_FRAME_RATE,
            strings,
            settings: GameSettings {
                arena_playlist: Vec::new(),
                time_limit_secs: 0,
            },
            players: BTreeMap::new(),
            arena: None,
            arena_active: false,
            running_arena: false,
            arena_end_frame: None,
            arena_count: 0,
            standings: Vec::new(),
            chat: Vec::new(),
            local_requests: BTreeMap::new(),
        }
    }

    pub fn advance_frame(&mut self) {
        self.frame_number = self.frame_number.wrapping_add(1);
    }

    pub fn player(&self, id: u8) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player_mut(&mut self, id: u8) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut Player> {
        self.players.values_mut()
    }

    pub fn insert_player(&mut self, player: Player) {
        self.players.insert(player.id, player);
    }

    pub fn remove_player(&mut self, id: u8) -> Option<Player> {
        self.players.remove(&id)
    }

    /// Lowest id not used by any player, including disconnected ones.
    pub fn free_player_id(&self) -> Option<u8> {
        (0..u8::MAX).find(|id| !self.players.contains_key(id))
    }

    /// Ids of the connected players `connection_id` controls.
    pub fn players_of(&self, connection_id: ConnectionId) -> Vec<u8> {
        self.players
            .values()
            .filter(|player| player.is_owned_by(connection_id))
            .map(|player| player.id)
            .collect()
    }

    /// Server: starts `name` with a fresh arena id and the configured time limit.
    pub fn start_arena(&mut self, name: CanonicalString) -> &mut Arena {
        self.arena_count = self.arena_count.wrapping_add(1);
        let limit_frames = u32::from(self.settings.time_limit_secs) * self.frame_rate;
        self.arena_end_frame = (limit_frames > 0).then(|| self.frame_number.wrapping_add(limit_frames));
        self.arena_active = true;
        self.standings.clear();
        self.arena.insert(Arena::new(Some(self.arena_count), name))
    }

    /// Server: ends the arena and records the final standings.
    pub fn finish_arena(&mut self) {
        self.arena_active = false;
        self.arena_end_frame = None;
        let mut standings: Vec<Standing> = self
            .players
            .values()
            .filter(|player| !player.is_disconnected)
            .map(|player| Standing {
                player_id: player.id,
                score: player.score(),
            })
            .collect();
        standings.sort_by(|a, b| b.score.cmp(&a.score));
        self.standings = standings;
    }

    pub fn time_left(&self) -> Option<Duration> {
        self.arena_end_frame.map(|end| {
            let frames = end.saturating_sub(self.frame_number);
            Duration::from_millis(u64::from(frames) * 1000 / u64::from(self.frame_rate.max(1)))
        })
    }

    pub fn is_time_up(&self) -> bool {
        self.arena_end_frame
            .is_some_and(|end| self.frame_number >= end)
    }
}

// Client side.
impl GameState {
    /// Registers a local player and returns the request to send.
    pub fn request_local_player(
        &mut self,
        local_id: u8,
        name: impl Into<String>,
        ship: CanonicalString,
        weapon: CanonicalString,
    ) -> PlayerSettingsRequest {
        let request = PlayerSettingsRequest {
            local_id,
            player_id: None,
            name: name.into(),
            ship,
            weapon,
        };
        self.local_requests.insert(local_id, request.clone());
        request
    }

    /// Turns pending local players into real ones. Returns how many matched.
    pub fn apply_player_assignments(&mut self, reply: &PlayerSettingsReply) -> usize {
        let mut matched = 0;
        for &(local_id, player_id) in &reply.assignments {
            let Some(request) = self.local_requests.remove(&local_id) else {
                log::warn!("Server assigned player {player_id} to unknown local player {local_id}");
                continue;
            };
            let mut player = Player::from_request(player_id, None, &request);
            player.is_local = true;
            self.players.insert(player_id, player);
            matched += 1;
        }
        matched
    }

    pub fn local_player_ids(&self) -> Vec<u8> {
        self.players
            .values()
            .filter(|player| player.is_local)
            .map(|player| player.id)
            .collect()
    }

    pub fn begin_arena(&mut self, start: &ArenaStart) {
        let budget_frames = u64::from(start.time_budget_ms) * u64::from(self.frame_rate) / 1000;
        self.arena_end_frame = (budget_frames > 0)
            .then(|| self.frame_number.wrapping_add(u32::try_from(budget_frames).unwrap_or(u32::MAX)));
        self.arena = Some(Arena::new(None, start.arena_name));
        self.standings.clear();
        self.running_arena = true;
    }

    pub fn end_arena(&mut self, finish: &ArenaFinish) {
        self.standings.clone_from(&finish.standings);
        self.arena = None;
        self.arena_end_frame = None;
        self.running_arena = false;
    }

    pub fn apply_gob_creation(&mut self, creation: &GobCreation, frames_ago: f32) -> Result<usize, ProtocolError> {
        match self.arena.as_mut() {
            Some(arena) => arena.apply_creation(creation, &self.strings, Staleness::new(frames_ago, self.frame_rate)),
            None => Ok(0),
        }
    }

    pub fn apply_gob_update(
        &mut self,
        update: &GobUpdate,
        mode: SerializationModeFlags,
        frames_ago: f32,
    ) -> Result<Option<BatchReadOutcome>, ProtocolError> {
        self.arena
            .as_mut()
            .map(|arena| arena.apply_update(update, mode, Staleness::new(frames_ago, self.frame_rate)))
            .transpose()
    }
}

impl ServerGameState for GameState {
    fn frame_number(&self) -> u32 {
        self.frame_number
    }

    fn is_arena_active(&self) -> bool {
        self.arena_active
    }

    fn has_player_settings(&self, connection_id: ConnectionId) -> bool {
        self.players.values().any(|player| player.is_owned_by(connection_id))
    }

    fn arena_start(&self) -> Option<ArenaStart> {
        let arena = self.arena.as_ref()?;
        let time_budget_ms = self
            .time_left()
            .map(|left| u32::try_from(left.as_millis()).unwrap_or(u32::MAX))
            .unwrap_or(0);
        Some(ArenaStart {
            arena_name: arena.name,
            wall_count: u16::try_from(arena.wall_count()).unwrap_or(u16::MAX),
            time_budget_ms,
        })
    }

    fn arena_finish(&self) -> Option<ArenaFinish> {
        Some(ArenaFinish {
            frame_number: self.frame_number,
            standings: self.standings.clone(),
        })
    }

    fn welcome(&mut self, _connection_id: ConnectionId) -> Vec<MessageBody> {
        std::iter::once(MessageBody::from(self.settings.clone()))
            .chain(
                self.players
                    .values()
                    .filter(|player| !player.is_disconnected)
                    .map(|player| player.settings_message().into()),
            )
            .collect()
    }

    fn disconnect_players(&mut self, connection_id: ConnectionId) -> Vec<u8> {
        let ids = self.players_of(connection_id);
        for id in &ids {
            if let Some(player) = self.players.get_mut(id) {
                player.is_disconnected = true;
                player.controls = Default::default();
            }
            if let Some(arena) = self.arena.as_mut() {
                let ships: Vec<u16> = arena
                    .gobs()
                    .filter(|gob| gob.owner == Some(*id))
                    .map(|gob| gob.id)
                    .collect();
                for ship in ships {
                    arena.remove(ship);
                }
            }
        }
        ids
    }
}

impl ClientGameState for GameState {
    fn frame_number(&self) -> u32 {
        self.frame_number
    }

    fn is_running_arena(&self) -> bool {
        self.running_arena
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec2;

    use super::*;

    fn owned(id: u8, connection_id: ConnectionId) -> Player {
        let mut player = Player::new(id, format!("p{id}"));
        player.connection_id = Some(connection_id);
        player
    }

    #[test]
    fn test_disconnect_marks_only_owned_players() {
        let mut game = GameState::default();
        game.insert_player(owned(0, 1));
        game.insert_player(owned(1, 2));
        game.insert_player(owned(2, 1));

        assert_eq!(game.disconnect_players(1), vec![0, 2]);
        assert!(game.player(0).is_some_and(|p| p.is_disconnected));
        assert!(!game.player(1).is_some_and(|p| p.is_disconnected));
        assert!(!game.has_player_settings(1));
        assert!(game.has_player_settings(2));
        assert_eq!(game.free_player_id(), Some(3));
    }

    #[test]
    fn test_arena_start_reports_time_budget() {
        let mut game = GameState::default();
        game.settings.time_limit_secs = 2;
        let name = game.strings.get("Amazonas").unwrap_or_default();
        game.start_arena(name).spawn_wall(Default::default(), Default::default());
        for _ in 0..60 {
            game.advance_frame();
        }

        let start = ServerGameState::arena_start(&game).unwrap();
        assert_eq!(start.arena_name, name);
        assert_eq!(start.wall_count, 1);
        assert_eq!(start.time_budget_ms, 1000);
        assert!(!game.is_time_up());
    }

    #[test]
    fn test_finish_sorts_standings() {
        let mut game = GameState::default();
        let mut good = owned(0, 1);
        good.kills = 4;
        let mut bad = owned(1, 1);
        bad.deaths = 2;
        game.insert_player(bad);
        game.insert_player(good);
        game.arena_active = true;
        game.finish_arena();
        assert!(!game.arena_active);
        assert_eq!(game.standings[0], Standing { player_id: 0, score: 4 });
        assert_eq!(game.standings[1].score, -2);
    }

    #[test]
    fn test_stale_creation_extrapolates_at_session_frame_rate() {
        let mut server = GameState::default();
        server.frame_rate = 30;
        let name = server.strings.get("Eris").unwrap_or_default();
        let arena = server.start_arena(name);
        let ship = arena.spawn_ship(0, Vec2::new(10.0, 0.0));
        if let Some(gob) = arena.get_mut(ship) {
            gob.velocity = Vec2::new(30.0, 0.0);
        }
        let start = ServerGameState::arena_start(&server).unwrap();
        let creation = server
            .arena
            .as_ref()
            .unwrap()
            .creation_message(server.frame_number, None, &server.strings)
            .unwrap();

        let mut client = GameState::default();
        client.frame_rate = 30;
        client.begin_arena(&start);
        assert_eq!(client.apply_gob_creation(&creation, 15.0).unwrap(), 1);

        // Fifteen frames at 30 fps is half a second of flight.
        let position = client.arena.as_ref().and_then(|arena| arena.ship_of(0)).map(|gob| gob.position);
        assert!(position.is_some_and(|p| (p.x - 25.0).abs() < 0.01));
    }
}
