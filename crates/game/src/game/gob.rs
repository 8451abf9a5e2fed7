use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::net::{
    CanonicalString, CanonicalStrings, NetSerializable, ProtocolError, SerializationModeFlags,
    Staleness, WireReader, WireWriter,
};

use super::controls::Controls;

/// Owner byte on the wire for gobs no player owns.
const NO_OWNER: u8 = u8::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GobKind {
    Ship,
    Shot,
    Wall,
}

impl GobKind {
    pub fn type_name(self) -> &'static str {
        match self {
            GobKind::Ship => "ship",
            GobKind::Shot => "shot",
            GobKind::Wall => "wall",
        }
    }

    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            "ship" => Some(GobKind::Ship),
            "shot" => Some(GobKind::Shot),
            "wall" => Some(GobKind::Wall),
            _ => None,
        }
    }

    pub fn canonical(self, strings: &CanonicalStrings) -> Result<CanonicalString, ProtocolError> {
        strings
            .get(self.type_name())
            .ok_or(ProtocolError::UnknownCanonical(0))
    }

    pub fn from_canonical(value: CanonicalString, strings: &CanonicalStrings) -> Result<Self, ProtocolError> {
        let name = strings.resolve(value)?;
        Self::from_type_name(name).ok_or(ProtocolError::UnknownCanonical(value.id()))
    }

    /// Whether the gob moves and carries per-tick state.
    pub fn is_dynamic(self) -> bool {
        !matches!(self, GobKind::Wall)
    }
}

/// Ship movement parameters shared by the server simulation and client
/// prediction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipPhysics {
    /// Radians per second at full turn input.
    pub turn_speed: f32,
    /// Force at full thrust input.
    pub thrust_force: f32,
    pub mass: f32,
}

impl Default for ShipPhysics {
    fn default() -> Self {
        Self {
            turn_speed: 3.0,
            thrust_force: 12000.0,
            mass: 200.0,
        }
    }
}

impl ShipPhysics {
    pub fn turn_rate(&self, controls: &Controls) -> f32 {
        self.turn_speed * controls.turn()
    }

    /// Velocity gained per second of thrust along `rotation`.
    pub fn acceleration(&self, controls: &Controls, rotation: f32) -> Vec2 {
        if self.mass <= 0.0 {
            return Vec2::ZERO;
        }
        Vec2::from_angle(rotation) * (controls.thrust() * self.thrust_force / self.mass)
    }
}

/// A replicated world object.
#[derive(Debug, Clone, PartialEq)]
pub struct Gob {
    pub id: u16,
    pub kind: GobKind,
    pub layer: u8,
    pub owner: Option<u8>,
    pub position: Vec2,
    pub velocity: Vec2,
    /// Radians, counter-clockwise from +x.
    pub rotation: f32,
    /// Walls only.
    pub size: Vec2,
    /// Ships only. In `[0, 1]`.
    pub health: f32,
}

impl Gob {
    pub fn new(id: u16, kind: GobKind, layer: u8) -> Self {
        Self {
            id,
            kind,
            layer,
            owner: None,
            position: Vec2::ZERO,
            velocity: Vec2::ZERO,
            rotation: 0.0,
            size: Vec2::ZERO,
            health: 1.0,
        }
    }

    pub fn ship(id: u16, owner: u8, position: Vec2) -> Self {
        Self {
            owner: Some(owner),
            position,
            ..Self::new(id, GobKind::Ship, 1)
        }
    }

    pub fn wall(id: u16, position: Vec2, size: Vec2) -> Self {
        Self {
            position,
            size,
            ..Self::new(id, GobKind::Wall, 0)
        }
    }

    /// Advances one ship by `dt` seconds under `controls`.
    pub fn steer(&mut self, controls: &Controls, physics: &ShipPhysics, dt: f32) {
        if self.kind != GobKind::Ship {
            return;
        }
        self.rotation = (self.rotation + physics.turn_rate(controls) * dt).rem_euclid(std::f32::consts::TAU);
        self.velocity += physics.acceleration(controls, self.rotation) * dt;
        self.position += self.velocity * dt;
    }

    pub fn integrate(&mut self, dt: f32) {
        if self.kind.is_dynamic() {
            self.position += self.velocity * dt;
        }
    }

    /// Moves a freshly received state forward to the present.
    fn extrapolate(&mut self, staleness: Staleness) {
        let age = staleness.seconds();
        if age > 0.0 {
            self.integrate(age);
        }
    }

    fn write_motion(&self, writer: &mut WireWriter) {
        writer.put_vec2(self.position);
        writer.put_velocity(self.velocity);
        writer.put_angle(self.rotation);
    }

    fn read_motion(&mut self, reader: &mut WireReader<'_>) -> Result<(), ProtocolError> {
        self.position = reader.get_vec2()?;
        self.velocity = reader.get_velocity()?;
        self.rotation = reader.get_angle()?;
        Ok(())
    }
}

impl NetSerializable for Gob {
    fn net_id(&self) -> u16 {
        self.id
    }

    fn serialize(&self, writer: &mut WireWriter, mode: SerializationModeFlags) -> Result<(), ProtocolError> {
        if mode.contains(SerializationModeFlags::CONSTANT_FROM_SERVER) {
            writer.put_u8(self.owner.unwrap_or(NO_OWNER));
            if self.kind == GobKind::Wall {
                writer.put_vec2(self.position);
                writer.put_vec2(self.size);
            }
        }
        if mode.contains(SerializationModeFlags::VARYING_FROM_SERVER) && self.kind.is_dynamic() {
            self.write_motion(writer);
            if self.kind == GobKind::Ship {
                writer.put_u8((self.health.clamp(0.0, 1.0) * 255.0).round() as u8);
            }
        }
        if mode.contains(SerializationModeFlags::VARYING_FROM_CLIENT) && self.kind == GobKind::Ship {
            self.write_motion(writer);
        }
        Ok(())
    }

    fn deserialize(
        &mut self,
        reader: &mut WireReader<'_>,
        mode: SerializationModeFlags,
        staleness: Staleness,
    ) -> Result<(), ProtocolError> {
        if mode.contains(SerializationModeFlags::CONSTANT_FROM_SERVER) {
            let owner = reader.get_u8()?;
            self.owner = (owner != NO_OWNER).then_some(owner);
            if self.kind == GobKind::Wall {
                self.position = reader.get_vec2()?;
                self.size = reader.get_vec2()?;
            }
        }
        let mut moved = false;
        if mode.contains(SerializationModeFlags::VARYING_FROM_SERVER) && self.kind.is_dynamic() {
            self.read_motion(reader)?;
            if self.kind == GobKind::Ship {
                self.health = reader.get_u8()? as f32 / 255.0;
            }
            moved = true;
        }
        if mode.contains(SerializationModeFlags::VARYING_FROM_CLIENT) && self.kind == GobKind::Ship {
            self.read_motion(reader)?;
            moved = true;
        }
        if moved {
            self.extrapolate(staleness);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Control, ControlState};

    fn reread(gob: &Gob, mode: SerializationModeFlags, staleness: Staleness) -> Gob {
        let mut writer = WireWriter::new();
        gob.serialize(&mut writer, mode).unwrap();
        let bytes = writer.into_bytes();
        let mut copy = Gob::new(gob.id, gob.kind, gob.layer);
        let mut reader = WireReader::new(&bytes);
        copy.deserialize(&mut reader, mode, staleness).unwrap();
        reader.finish().unwrap();
        copy
    }

    #[test]
    fn test_ship_state_uses_reduced_precision() {
        let mut ship = Gob::ship(5, 2, Vec2::new(10.0, -4.0));
        ship.velocity = Vec2::new(1.234, -0.5);
        ship.rotation = 1.0;

        let copy = reread(&ship, SerializationModeFlags::ALL_FROM_SERVER, Staleness::FRESH);
        assert_eq!(copy.owner, Some(2));
        assert_eq!(copy.position, ship.position);
        assert_eq!(copy.velocity, Vec2::new(1.23, -0.5));
        assert!((copy.rotation - 1.0).abs() < std::f32::consts::TAU / 256.0);
    }

    #[test]
    fn test_wall_has_no_varying_state() {
        let wall = Gob::wall(9, Vec2::new(3.0, 3.0), Vec2::new(1.0, 2.0));
        let mut writer = WireWriter::new();
        wall.serialize(&mut writer, SerializationModeFlags::VARYING_FROM_SERVER)
            .unwrap();
        assert!(writer.is_empty());

        let copy = reread(&wall, SerializationModeFlags::CONSTANT_FROM_SERVER, Staleness::FRESH);
        assert_eq!(copy.size, Vec2::new(1.0, 2.0));
        assert_eq!(copy.owner, None);
    }

    #[test]
    fn test_stale_update_is_extrapolated() {
        let mut shot = Gob::new(3, GobKind::Shot, 1);
        shot.velocity = Vec2::new(60.0, 0.0);
        let copy = reread(&shot, SerializationModeFlags::VARYING_FROM_SERVER, Staleness::new(30.0, 60));
        assert!((copy.position.x - 30.0).abs() < 1e-3);
    }

    #[test]
    fn test_extrapolation_uses_sender_frame_rate() {
        let mut shot = Gob::new(3, GobKind::Shot, 1);
        shot.velocity = Vec2::new(60.0, 0.0);
        // 30 frames at 30 fps is a full second.
        let copy = reread(&shot, SerializationModeFlags::VARYING_FROM_SERVER, Staleness::new(30.0, 30));
        assert!((copy.position.x - 60.0).abs() < 1e-3);
    }

    #[test]
    fn test_steer_turns_and_thrusts() {
        let physics = ShipPhysics {
            turn_speed: 2.0,
            thrust_force: 100.0,
            mass: 10.0,
        };
        let controls = Controls::default()
            .with(Control::Thrust, ControlState::new(1.0, false))
            .with(Control::Left, ControlState::new(0.5, false));
        let mut ship = Gob::ship(1, 0, Vec2::ZERO);
        ship.steer(&controls, &physics, 0.5);
        assert!((ship.rotation - 0.5).abs() < 1e-6);
        assert!((ship.velocity.length() - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_kind_names_resolve_through_table() {
        let strings = CanonicalStrings::standard();
        let id = GobKind::Wall.canonical(&strings).unwrap();
        assert_eq!(GobKind::from_canonical(id, &strings).unwrap(), GobKind::Wall);
        assert!(GobKind::from_canonical(CanonicalString::from_id(500), &strings).is_err());
    }
}
