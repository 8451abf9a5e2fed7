use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec2;
use tokio::runtime::Handle;

use skirmish::game::register_client_handlers;
use skirmish::net::transport::SocketConnector;
use skirmish::net::{
    ClientSession, Connector, MessageRegistry, PeerAddr, PlayerControls, SessionEvent,
    TransportError,
};
use skirmish::{Controls, GameState, Gob};

use super::config::ClientConfig;
use super::input::ScriptedInput;
use super::prediction::{ShipLocationEntry, ShipLocationHistory};

/// Largest gap between predicted and authoritative ship position that is
/// still corrected smoothly; anything further restarts the history.
const SNAP_DISTANCE: f32 = 50.0;

/// Server's view of our ship, used to spot fresh updates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ShipSample {
    position: Vec2,
    velocity: Vec2,
    rotation: f32,
}

impl From<&Gob> for ShipSample {
    fn from(gob: &Gob) -> Self {
        Self {
            position: gob.position,
            velocity: gob.velocity,
            rotation: gob.rotation,
        }
    }
}

pub struct NetworkClient {
    config: ClientConfig,
    session: ClientSession<GameState>,
    game: GameState,
    /// Present while our ship is in the arena.
    prediction: Option<ShipLocationHistory>,
    input: ScriptedInput,
    started: Instant,
    last_tick_time: Instant,
    accumulator: Duration,
    player_requested: bool,
    last_sample: Option<ShipSample>,
}

impl NetworkClient {
    pub fn new(config: ClientConfig, registry: Arc<MessageRegistry>) -> Self {
        let mut session = ClientSession::new(config.net.clone(), registry);
        register_client_handlers(session.handlers_mut());
        let now = Instant::now();

        Self {
            session,
            game: GameState::default(),
            prediction: None,
            input: ScriptedInput::patrol(),
            started: now,
            last_tick_time: now,
            accumulator: Duration::ZERO,
            player_requested: false,
            last_sample: None,
            config,
        }
    }

    pub fn with_input(mut self, input: ScriptedInput) -> Self {
        self.input = input;
        self
    }

    /// Races TCP connects to every configured server address.
    pub fn connect(&mut self, handle: &Handle) -> Result<(), TransportError> {
        log::info!("Connecting to {:?}", self.config.servers);
        let connector = SocketConnector::start(handle, self.config.servers.clone(), self.config.udp_bind)?;
        self.connect_with(Box::new(connector));
        Ok(())
    }

    pub fn connect_with(&mut self, connector: Box<dyn Connector>) {
        self.reset();
        self.session.connect(
            connector,
            Some(Box::new(|result: Result<PeerAddr, &TransportError>| {
                if let Err(e) = result {
                    log::error!("No server answered: {e}");
                }
            })),
        );
    }

    pub fn disconnect(&mut self) {
        self.session.disconnect();
        self.reset();
    }

    fn reset(&mut self) {
        self.game = GameState::default();
        self.player_requested = false;
        self.last_sample = None;
        self.prediction = None;
    }

    pub fn is_connecting(&self) -> bool {
        self.session.is_connecting()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn game(&self) -> &GameState {
        &self.game
    }

    pub fn prediction(&self) -> Option<&ShipLocationHistory> {
        self.prediction.as_ref()
    }

    pub fn ping_time(&self) -> Option<Duration> {
        self.session.ping_time()
    }

    pub fn player_id(&self) -> Option<u8> {
        self.game.local_player_ids().first().copied()
    }

    /// Where our ship is believed to be right now.
    pub fn predicted_ship(&self, now: Instant) -> Option<ShipLocationEntry> {
        let time = now.saturating_duration_since(self.started);
        self.prediction.as_ref().map(|history| history.get_ship_location(time))
    }

    /// Runs as many fixed-length ticks as have elapsed since the last call.
    pub fn update(&mut self, now: Instant) -> Vec<SessionEvent> {
        let tick = self.config.tick();
        self.accumulator += now.saturating_duration_since(self.last_tick_time);
        self.last_tick_time = now;

        let mut events = Vec::new();
        while self.accumulator >= tick {
            self.accumulator -= tick;
            events.extend(self.tick(now));
        }
        events
    }

    pub fn tick(&mut self, now: Instant) -> Vec<SessionEvent> {
        self.game.advance_frame();
        self.session.tick(&mut self.game, now);

        let events: Vec<SessionEvent> = self.session.drain_events().collect();
        for event in &events {
            self.handle_event(event);
        }

        let game_time = now.saturating_duration_since(self.started);
        self.fly(game_time);
        events
    }

    fn handle_event(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::HandshakeCompleted { connection_id } => {
                log::info!("Joined as connection {connection_id}");
                self.request_player();
            }
            SessionEvent::ConnectionDropped { reason, .. } => {
                log::warn!("Disconnected from server: {reason}");
                self.reset();
            }
            SessionEvent::ConnectFailed { error } => {
                log::error!("Connection failed: {error}");
            }
            _ => log::debug!("{event:?}"),
        }
    }

    fn request_player(&mut self) {
        if self.player_requested {
            return;
        }
        let ship = self.canonical(&self.config.ship);
        let weapon = self.canonical(&self.config.weapon);
        let request = self
            .game
            .request_local_player(0, self.config.player_name.clone(), ship, weapon);
        self.session.send(request);
        self.player_requested = true;
    }

    fn canonical(&self, name: &str) -> skirmish::net::CanonicalString {
        self.game.strings.get(name).unwrap_or_else(|| {
            log::warn!("Unknown equipment '{name}', using the default");
            Default::default()
        })
    }

    fn fly(&mut self, game_time: Duration) {
        let Some(player_id) = self.player_id() else {
            return;
        };
        let controls = self.input.at(self.game.frame_number).to_controls();
        self.session.send(PlayerControls {
            frame_number: self.game.frame_number,
            player_id,
            controls,
        });

        let ship = self
            .game
            .arena
            .as_ref()
            .filter(|_| self.game.running_arena)
            .and_then(|arena| arena.ship_of(player_id))
            .cloned();
        let Some(ship) = ship else {
            self.prediction = None;
            self.last_sample = None;
            return;
        };

        let sample = ShipSample::from(&ship);
        if self.last_sample != Some(sample) {
            self.last_sample = Some(sample);
            self.reconcile(game_time, sample);
        }
        self.predict(game_time, controls, ship);
    }

    /// Folds a fresh authoritative ship state into the history.
    fn reconcile(&mut self, game_time: Duration, sample: ShipSample) {
        let Some(history) = self.prediction.as_mut() else {
            return;
        };
        let at = game_time.saturating_sub(self.session.lag().unwrap_or_default());
        if !history.update_old_ship_location(at, sample.rotation) {
            return;
        }
        let drift = history.get_ship_location(at).position.distance(sample.position);
        if drift > SNAP_DISTANCE {
            log::debug!("Prediction drifted {drift:.1} units, snapping to server");
            self.prediction = None;
        }
    }

    /// Moves the live ship to `game_time` and keeps its old state as history.
    fn predict(&mut self, game_time: Duration, controls: Controls, mut ship: Gob) {
        let Some(history) = self.prediction.as_mut() else {
            let live = ShipLocationEntry::new(game_time, ship.position, ship.velocity, ship.rotation)
                .with_controls(controls);
            self.prediction = Some(ShipLocationHistory::new(self.config.prediction.clone(), live));
            return;
        };

        let previous = *history.live();
        if game_time <= previous.time {
            return;
        }
        let dt = (game_time - previous.time).as_secs_f32();
        ship.position = previous.position;
        ship.velocity = previous.velocity;
        ship.rotation = previous.rotation;
        match previous.controls.as_ref() {
            Some(held) => ship.steer(held, &self.config.prediction.physics, dt),
            None => ship.integrate(dt),
        }

        let live = history.live_mut();
        live.time = game_time;
        live.position = ship.position;
        live.velocity = ship.velocity;
        live.rotation = ship.rotation;
        live.controls = Some(controls);
        if let Err(e) = history.add(previous) {
            log::warn!("Dropping predicted location: {e}");
            return;
        }
        if previous.controls != Some(controls) {
            history.store_control_states(controls, game_time);
        }
    }
}
