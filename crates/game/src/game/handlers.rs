//! Gameplay message handlers for both roles.

use crate::net::{
    ArenaFinish, ArenaStart, GameSettings, GobCreation, GobDeletion, GobUpdate, HandlerControl,
    MessageHandlers, PlayerControls, PlayerDeletion, PlayerMessage, PlayerSettingsReply,
    PlayerSettingsRequest, PlayerUpdate, SerializationModeFlags, Staleness,
};

use super::player::Player;
use super::state::GameState;

pub fn register_server_handlers(handlers: &mut MessageHandlers<GameState>) {
    handlers.on::<PlayerSettingsRequest, _>(|request, ctx| {
        let connection_id = ctx.connection_id();
        let announcement = match request.player_id {
            Some(player_id) => {
                let Some(player) = ctx
                    .game
                    .player_mut(player_id)
                    .filter(|player| player.is_owned_by(connection_id))
                else {
                    log::warn!("Connection {connection_id} tried to change player {player_id}");
                    return HandlerControl::Keep;
                };
                player.apply_settings(request);
                player.settings_message()
            }
            None => {
                let existing = ctx
                    .game
                    .players()
                    .find(|player| player.is_owned_by(connection_id) && player.local_id == request.local_id)
                    .map(|player| player.id);
                let Some(player_id) = existing.or_else(|| ctx.game.free_player_id()) else {
                    log::warn!("No free player id for connection {connection_id}");
                    return HandlerControl::Keep;
                };
                let player = Player::from_request(player_id, Some(connection_id), request);
                let announcement = player.settings_message();
                ctx.game.insert_player(player);
                log::info!("Player {player_id} ({}) joined on connection {connection_id}", request.name);
                ctx.reply(PlayerSettingsReply {
                    assignments: vec![(request.local_id, player_id)],
                });
                announcement
            }
        };
        ctx.forward(announcement);
        HandlerControl::Keep
    });

    handlers.on::<PlayerControls, _>(|message, ctx| {
        let connection_id = ctx.connection_id();
        match ctx
            .game
            .player_mut(message.player_id)
            .filter(|player| player.is_owned_by(connection_id))
        {
            Some(player) => player.controls = message.controls,
            None => log::debug!(
                "Ignoring controls for player {} from connection {connection_id}",
                message.player_id
            ),
        }
        HandlerControl::Keep
    });

    handlers.on::<GobUpdate, _>(|update, ctx| {
        let owned = ctx.game.players_of(ctx.connection_id());
        let staleness = Staleness::new(ctx.frames_ago, ctx.game.frame_rate);
        if let Some(arena) = ctx.game.arena.as_mut() {
            let mut lookup = arena.owned_by(&owned);
            if let Err(e) = update
                .batch
                .read(&mut lookup, SerializationModeFlags::VARYING_FROM_CLIENT, staleness)
            {
                log::warn!("Bad gob update from connection {}: {e}", ctx.header.connection_id);
            }
        }
        HandlerControl::Keep
    });

    handlers.on::<PlayerMessage, _>(|message, ctx| {
        let connection_id = ctx.connection_id();
        if !ctx
            .game
            .player(message.player_id)
            .is_some_and(|player| player.is_owned_by(connection_id))
        {
            return HandlerControl::Keep;
        }
        log::info!("[{}] {}", message.player_id, message.text);
        ctx.game.chat.push((message.player_id, message.text.clone()));
        ctx.forward(message.clone());
        HandlerControl::Keep
    });
}

pub fn register_client_handlers(handlers: &mut MessageHandlers<GameState>) {
    handlers.on::<GameSettings, _>(|settings, ctx| {
        ctx.game.settings = settings.clone();
        HandlerControl::Keep
    });

    handlers.on::<PlayerSettingsRequest, _>(|announcement, ctx| {
        let Some(player_id) = announcement.player_id else {
            return HandlerControl::Keep;
        };
        match ctx.game.player_mut(player_id) {
            Some(player) => player.apply_settings(announcement),
            None => ctx
                .game
                .insert_player(Player::from_request(player_id, None, announcement)),
        }
        HandlerControl::Keep
    });

    handlers.on::<PlayerSettingsReply, _>(|reply, ctx| {
        ctx.game.apply_player_assignments(reply);
        HandlerControl::Keep
    });

    handlers.on::<PlayerDeletion, _>(|deletion, ctx| {
        if let Some(player) = ctx.game.remove_player(deletion.player_id) {
            log::info!("Player {} ({}) left", player.id, player.name);
        }
        HandlerControl::Keep
    });

    handlers.on::<PlayerUpdate, _>(|update, ctx| {
        if let Some(player) = ctx.game.player_mut(update.player_id) {
            player.apply_update(update);
        }
        HandlerControl::Keep
    });

    handlers.on::<ArenaStart, _>(|start, ctx| {
        ctx.game.begin_arena(start);
        HandlerControl::Keep
    });

    handlers.on::<ArenaFinish, _>(|finish, ctx| {
        ctx.game.end_arena(finish);
        HandlerControl::Keep
    });

    handlers.on::<GobCreation, _>(|creation, ctx| {
        let frames_ago = ctx.frames_ago;
        if let Err(e) = ctx.game.apply_gob_creation(creation, frames_ago) {
            log::warn!("Bad gob creation: {e}");
        }
        HandlerControl::Keep
    });

    handlers.on::<GobUpdate, _>(|update, ctx| {
        let frames_ago = ctx.frames_ago;
        if let Err(e) = ctx
            .game
            .apply_gob_update(update, SerializationModeFlags::VARYING_FROM_SERVER, frames_ago)
        {
            log::warn!("Bad gob update: {e}");
        }
        HandlerControl::Keep
    });

    handlers.on::<GobDeletion, _>(|deletion, ctx| {
        if let Some(arena) = ctx.game.arena.as_mut() {
            arena.apply_deletion(deletion);
        }
        HandlerControl::Keep
    });

    handlers.on::<PlayerMessage, _>(|message, ctx| {
        ctx.game.chat.push((message.player_id, message.text.clone()));
        HandlerControl::Keep
    });
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::game::{Control, ControlState, Controls};
    use crate::net::{Message, Outbox, Target};

    fn request(local_id: u8) -> PlayerSettingsRequest {
        PlayerSettingsRequest {
            local_id,
            player_id: None,
            name: "vasko".into(),
            ship: Default::default(),
            weapon: Default::default(),
        }
    }

    #[test]
    fn test_server_registers_player_and_replies() {
        let mut handlers = MessageHandlers::new();
        register_server_handlers(&mut handlers);
        let mut game = GameState::default();
        let mut outbox = Outbox::default();

        let message = Message::new(4, Instant::now(), request(0));
        handlers.dispatch(&[(message, 0.0)], &mut game, &mut outbox);

        assert!(game.player(0).is_some_and(|player| player.is_owned_by(4)));
        let queued = outbox.take();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].0, Target::One(4));
        assert_eq!(queued[1].0, Target::AllExcept(4));
    }

    #[test]
    fn test_controls_only_apply_to_owned_player() {
        let mut handlers = MessageHandlers::new();
        register_server_handlers(&mut handlers);
        let mut game = GameState::default();
        let mut player = Player::new(3, "owned");
        player.connection_id = Some(1);
        game.insert_player(player);

        let controls = Controls::default().with(Control::Left, ControlState::new(1.0, false));
        let forged = Message::new(
            2,
            Instant::now(),
            PlayerControls {
                frame_number: 1,
                player_id: 3,
                controls,
            },
        );
        let genuine = Message::new(
            1,
            Instant::now(),
            PlayerControls {
                frame_number: 1,
                player_id: 3,
                controls: controls.with(Control::Thrust, ControlState::new(0.5, false)),
            },
        );
        let mut outbox = Outbox::default();

        handlers.dispatch(&[(forged, 0.0)], &mut game, &mut outbox);
        assert_eq!(game.player(3).map(|p| p.controls.get(Control::Left).force), Some(0.0));

        handlers.dispatch(&[(genuine, 0.0)], &mut game, &mut outbox);
        let state = game.player(3).map(|p| p.controls).unwrap_or_default();
        assert_eq!(state.get(Control::Left).force, 1.0);
        assert_eq!(state.get(Control::Thrust).force, 0.5);
    }

    #[test]
    fn test_client_tracks_assignments_and_announcements() {
        let mut handlers = MessageHandlers::new();
        register_client_handlers(&mut handlers);
        let mut game = GameState::default();
        game.request_local_player(0, "me", Default::default(), Default::default());

        let reply = Message::new(
            1,
            Instant::now(),
            PlayerSettingsReply {
                assignments: vec![(0, 5)],
            },
        );
        let other = PlayerSettingsRequest {
            player_id: Some(2),
            ..request(0)
        };
        let announcement = Message::new(1, Instant::now(), other);
        let mut outbox = Outbox::default();
        handlers.dispatch(&[(reply, 0.0), (announcement, 0.0)], &mut game, &mut outbox);

        assert_eq!(game.local_player_ids(), vec![5]);
        assert!(game.player(2).is_some_and(|player| !player.is_local));
        assert!(outbox.is_empty());
    }
}
