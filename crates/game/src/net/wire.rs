use std::f32::consts::TAU;

use bytes::{BufMut, Bytes, BytesMut};
use glam::Vec2;

use super::canonical::CanonicalString;
use super::protocol::ProtocolError;

pub const MAX_VELOCITY: f32 = 327.67;

/// Quantizes an angle in radians to 1/256 of a full turn.
pub fn encode_angle(angle: f32) -> u8 {
    let turns = angle.rem_euclid(TAU) / TAU;
    ((turns * 256.0).round() as u32 % 256) as u8
}

pub fn decode_angle(value: u8) -> f32 {
    value as f32 / 256.0 * TAU
}

pub fn encode_velocity(component: f32) -> i16 {
    (component.clamp(-MAX_VELOCITY, MAX_VELOCITY) * 100.0).round() as i16
}

pub fn decode_velocity(value: i16) -> f32 {
    value as f32 / 100.0
}

/// Encodes a force in `[0, 1]` as 16-bit fixed point. 0 and 1 are exact.
pub fn encode_force(force: f32) -> u16 {
    (force.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16
}

pub fn decode_force(value: u16) -> f32 {
    value as f32 / u16::MAX as f32
}

/// Message body writer. All integers are written in network byte order.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.put_i16(value);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn put_f32(&mut self, value: f32) {
        self.buf.put_f32(value);
    }

    pub fn put_vec2(&mut self, value: Vec2) {
        self.put_f32(value.x);
        self.put_f32(value.y);
    }

    pub fn put_angle(&mut self, angle: f32) {
        self.put_u8(encode_angle(angle));
    }

    pub fn put_velocity(&mut self, velocity: Vec2) {
        self.put_i16(encode_velocity(velocity.x));
        self.put_i16(encode_velocity(velocity.y));
    }

    pub fn put_force(&mut self, force: f32) {
        self.put_u16(encode_force(force));
    }

    pub fn put_count_u8(&mut self, count: usize) -> Result<(), ProtocolError> {
        let count = u8::try_from(count).map_err(|_| ProtocolError::CountOverflow { count, bits: 8 })?;
        self.put_u8(count);
        Ok(())
    }

    pub fn put_count_u16(&mut self, count: usize) -> Result<(), ProtocolError> {
        let count =
            u16::try_from(count).map_err(|_| ProtocolError::CountOverflow { count, bits: 16 })?;
        self.put_u16(count);
        Ok(())
    }

    /// Writes `data` prefixed with its 16-bit length.
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.put_count_u16(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    pub fn put_raw(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn put_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.put_bytes(value.as_bytes())
    }

    pub fn put_canonical(&mut self, value: CanonicalString) {
        self.put_u16(value.id());
    }
}

/// Message body reader. Every read checks the remaining length first.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Fails unless the whole body has been consumed.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < n {
            return Err(ProtocolError::TooShort);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(ProtocolError::InvalidTag { what: "bool", tag }),
        }
    }

    pub fn get_u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn get_i16(&mut self) -> Result<i16, ProtocolError> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_f32(&mut self) -> Result<f32, ProtocolError> {
        Ok(f32::from_be_bytes(self.take_array()?))
    }

    pub fn get_vec2(&mut self) -> Result<Vec2, ProtocolError> {
        let x = self.get_f32()?;
        let y = self.get_f32()?;
        Ok(Vec2::new(x, y))
    }

    pub fn get_angle(&mut self) -> Result<f32, ProtocolError> {
        Ok(decode_angle(self.get_u8()?))
    }

    pub fn get_velocity(&mut self) -> Result<Vec2, ProtocolError> {
        let x = decode_velocity(self.get_i16()?);
        let y = decode_velocity(self.get_i16()?);
        Ok(Vec2::new(x, y))
    }

    pub fn get_force(&mut self) -> Result<f32, ProtocolError> {
        Ok(decode_force(self.get_u16()?))
    }

    pub fn get_count_u8(&mut self) -> Result<usize, ProtocolError> {
        Ok(self.get_u8()? as usize)
    }

    pub fn get_count_u16(&mut self) -> Result<usize, ProtocolError> {
        Ok(self.get_u16()? as usize)
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.get_count_u16()?;
        self.take(len)
    }

    pub fn get_raw(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        self.take(len)
    }

    pub fn get_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    pub fn get_canonical(&mut self) -> Result<CanonicalString, ProtocolError> {
        Ok(CanonicalString::from_id(self.get_u16()?))
    }
}
