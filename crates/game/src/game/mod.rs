mod arena;
mod controls;
mod gob;
mod handlers;
mod player;
mod state;

pub use arena::{Arena, OwnedShips};
pub use controls::{Control, ControlState, Controls};
pub use gob::{Gob, GobKind, ShipPhysics};
pub use handlers::{register_client_handlers, register_server_handlers};
pub use player::Player;
pub use state::GameState;
