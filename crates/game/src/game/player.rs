use crate::net::{CanonicalString, ConnectionId, PlayerSettingsRequest, PlayerUpdate};

use super::controls::Controls;

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub id: u8,
    pub name: String,
    /// Connection owning the player. Only known on the server.
    pub connection_id: Option<ConnectionId>,
    /// Controlled on this machine.
    pub is_local: bool,
    /// Index of the player among its client's local players.
    pub local_id: u8,
    pub ship: CanonicalString,
    pub weapon: CanonicalString,
    pub controls: Controls,
    pub is_disconnected: bool,
    pub kills: u16,
    pub deaths: u16,
    pub lives: u8,
}

impl Player {
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            connection_id: None,
            is_local: false,
            local_id: 0,
            ship: CanonicalString::NONE,
            weapon: CanonicalString::NONE,
            controls: Controls::default(),
            is_disconnected: false,
            kills: 0,
            deaths: 0,
            lives: 3,
        }
    }

    pub fn from_request(id: u8, connection_id: Option<ConnectionId>, request: &PlayerSettingsRequest) -> Self {
        let mut player = Self::new(id, request.name.clone());
        player.connection_id = connection_id;
        player.local_id = request.local_id;
        player.apply_settings(request);
        player
    }

    pub fn apply_settings(&mut self, request: &PlayerSettingsRequest) {
        self.name.clone_from(&request.name);
        self.ship = request.ship;
        self.weapon = request.weapon;
    }

    pub fn is_owned_by(&self, connection_id: ConnectionId) -> bool {
        !self.is_disconnected && self.connection_id == Some(connection_id)
    }

    pub fn score(&self) -> i16 {
        (i32::from(self.kills) - i32::from(self.deaths)).clamp(i16::MIN.into(), i16::MAX.into()) as i16
    }

    /// Settings as the server announces them to other clients.
    pub fn settings_message(&self) -> PlayerSettingsRequest {
        PlayerSettingsRequest {
            local_id: self.local_id,
            player_id: Some(self.id),
            name: self.name.clone(),
            ship: self.ship,
            weapon: self.weapon,
        }
    }

    pub fn update_message(&self, frame_number: u32) -> PlayerUpdate {
        PlayerUpdate {
            frame_number,
            player_id: self.id,
            kills: self.kills,
            deaths: self.deaths,
            lives: self.lives,
        }
    }

    pub fn apply_update(&mut self, update: &PlayerUpdate) {
        self.kills = update.kills;
        self.deaths = update.deaths;
        self.lives = update.lives;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ownership_ends_on_disconnect() {
        let mut player = Player::new(3, "kaiser");
        player.connection_id = Some(7);
        assert!(player.is_owned_by(7));
        assert!(!player.is_owned_by(8));
        player.is_disconnected = true;
        assert!(!player.is_owned_by(7));
    }

    #[test]
    fn test_score_saturates() {
        let mut player = Player::new(1, "a");
        player.deaths = u16::MAX;
        assert_eq!(player.score(), i16::MIN);
    }
}
