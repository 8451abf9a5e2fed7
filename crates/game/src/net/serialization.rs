//! Partial entity state carried in batches.
//!
//! A batch is a list of entity ids followed by the concatenated
//! self-serialized state of each entity. Entries carry no length prefix, so a
//! reader that cannot resolve an id cannot skip past its bytes: everything
//! from the first unresolved id onward is dropped.

use std::collections::HashMap;

use bitflags::bitflags;
use bytes::Bytes;

use super::protocol::{ProtocolError, DEFAULT_FRAME_RATE};
use super::wire::{WireReader, WireWriter};

bitflags! {
    /// Which parts of an entity's state a serialization pass covers.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SerializationModeFlags: u8 {
        /// Written once per entity lifetime by the server.
        const CONSTANT_FROM_SERVER = 1 << 0;
        /// Written by the server every synchronization tick.
        const VARYING_FROM_SERVER = 1 << 1;
        /// Written by the owning client every tick.
        const VARYING_FROM_CLIENT = 1 << 2;
        const ALL_FROM_SERVER = Self::CONSTANT_FROM_SERVER.bits()
            | Self::VARYING_FROM_SERVER.bits();
    }
}

/// How old received state is when it gets applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Staleness {
    pub frames: f32,
    /// Frames per second of the sender's simulation.
    pub frame_rate: u32,
}

impl Staleness {
    pub const FRESH: Self = Self {
        frames: 0.0,
        frame_rate: DEFAULT_FRAME_RATE,
    };

    pub fn new(frames: f32, frame_rate: u32) -> Self {
        Self { frames, frame_rate }
    }

    /// Age in seconds; zero for fresh or future-stamped state.
    pub fn seconds(self) -> f32 {
        if self.frames <= 0.0 || self.frame_rate == 0 {
            return 0.0;
        }
        self.frames / self.frame_rate as f32
    }
}

/// An entity that can write and read its own partial state.
///
/// `deserialize` must consume exactly the bytes `serialize` produced for the
/// same flags.
pub trait NetSerializable {
    fn net_id(&self) -> u16;

    fn serialize(
        &self,
        writer: &mut WireWriter,
        mode: SerializationModeFlags,
    ) -> Result<(), ProtocolError>;

    /// `staleness` is how old the data is, for extrapolation.
    fn deserialize(
        &mut self,
        reader: &mut WireReader<'_>,
        mode: SerializationModeFlags,
        staleness: Staleness,
    ) -> Result<(), ProtocolError>;
}

/// Maps batch ids to live entities on the receiving side.
pub trait EntityLookup {
    fn resolve(&mut self, id: u16) -> Option<&mut dyn NetSerializable>;
}

impl<T: NetSerializable> EntityLookup for HashMap<u16, T> {
    fn resolve(&mut self, id: u16) -> Option<&mut dyn NetSerializable> {
        self.get_mut(&id).map(|entity| entity as &mut dyn NetSerializable)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityBatch {
    pub ids: Vec<u16>,
    pub payload: Bytes,
}

impl EntityBatch {
    pub fn new(ids: Vec<u16>, payload: Bytes) -> Self {
        Self { ids, payload }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Layout: count (u16), ids (u16 each), payload length (u16), payload.
    pub fn encode(&self, writer: &mut WireWriter) -> Result<(), ProtocolError> {
        writer.put_count_u16(self.ids.len())?;
        self.encode_ids(writer);
        writer.put_bytes(&self.payload)
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self, ProtocolError> {
        let count = reader.get_count_u16()?;
        let ids = Self::decode_ids(reader, count)?;
        let payload = Bytes::copy_from_slice(reader.get_bytes()?);
        Ok(Self { ids, payload })
    }

    pub fn encode_ids(&self, writer: &mut WireWriter) {
        for &id in &self.ids {
            writer.put_u16(id);
        }
    }

    pub fn decode_ids(reader: &mut WireReader<'_>, count: usize) -> Result<Vec<u16>, ProtocolError> {
        (0..count).map(|_| reader.get_u16()).collect()
    }

    /// Applies the batch to the entities `lookup` resolves.
    ///
    /// Stops at the first id `lookup` does not know. Bytes left over after
    /// every id resolved are a protocol error.
    pub fn read(
        &self,
        lookup: &mut dyn EntityLookup,
        mode: SerializationModeFlags,
        staleness: Staleness,
    ) -> Result<BatchReadOutcome, ProtocolError> {
        let mut reader = WireReader::new(&self.payload);
        let mut applied = Vec::with_capacity(self.ids.len());

        for (index, &id) in self.ids.iter().enumerate() {
            let Some(entity) = lookup.resolve(id) else {
                let dropped = self.ids.len() - index - 1;
                log::debug!(
                    "Entity {id} unresolved, dropping it and {dropped} following entities"
                );
                return Ok(BatchReadOutcome {
                    applied,
                    unresolved: Some(id),
                    dropped,
                });
            };
            entity.deserialize(&mut reader, mode, staleness)?;
            applied.push(id);
        }

        reader.finish()?;
        Ok(BatchReadOutcome {
            applied,
            unresolved: None,
            dropped: 0,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReadOutcome {
    pub applied: Vec<u16>,
    /// First id that could not be resolved, if any.
    pub unresolved: Option<u16>,
    /// Entities after the unresolved one that were skipped.
    pub dropped: usize,
}

impl BatchReadOutcome {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_none()
    }
}

/// Accumulates entity states into one [`EntityBatch`].
#[derive(Debug)]
pub struct EntityBatchWriter {
    mode: SerializationModeFlags,
    ids: Vec<u16>,
    payload: WireWriter,
}

impl EntityBatchWriter {
    pub fn new(mode: SerializationModeFlags) -> Self {
        Self {
            mode,
            ids: Vec::new(),
            payload: WireWriter::with_capacity(256),
        }
    }

    pub fn mode(&self) -> SerializationModeFlags {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn write(&mut self, entity: &dyn NetSerializable) -> Result<(), ProtocolError> {
        if self.ids.len() >= u16::MAX as usize {
            return Err(ProtocolError::CountOverflow {
                count: self.ids.len() + 1,
                bits: 16,
            });
        }
        entity.serialize(&mut self.payload, self.mode)?;
        self.ids.push(entity.net_id());
        Ok(())
    }

    pub fn finish(self) -> EntityBatch {
        EntityBatch {
            ids: self.ids,
            payload: self.payload.into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Counter {
        id: u16,
        kind: u8,
        value: u16,
    }

    impl NetSerializable for Counter {
        fn net_id(&self) -> u16 {
            self.id
        }

        fn serialize(
            &self,
            writer: &mut WireWriter,
            mode: SerializationModeFlags,
        ) -> Result<(), ProtocolError> {
            if mode.contains(SerializationModeFlags::CONSTANT_FROM_SERVER) {
                writer.put_u8(self.kind);
            }
            if mode.contains(SerializationModeFlags::VARYING_FROM_SERVER) {
                writer.put_u16(self.value);
            }
            Ok(())
        }

        fn deserialize(
            &mut self,
            reader: &mut WireReader<'_>,
            mode: SerializationModeFlags,
            _staleness: Staleness,
        ) -> Result<(), ProtocolError> {
            if mode.contains(SerializationModeFlags::CONSTANT_FROM_SERVER) {
                self.kind = reader.get_u8()?;
            }
            if mode.contains(SerializationModeFlags::VARYING_FROM_SERVER) {
                self.value = reader.get_u16()?;
            }
            Ok(())
        }
    }

    fn counter(id: u16, value: u16) -> Counter {
        Counter { id, kind: 1, value }
    }

    #[test]
    fn test_batch_applies_all_resolved() {
        let mut writer = EntityBatchWriter::new(SerializationModeFlags::ALL_FROM_SERVER);
        writer.write(&counter(1, 10)).unwrap();
        writer.write(&counter(2, 20)).unwrap();
        let batch = writer.finish();
        assert_eq!(batch.payload.len(), 6);

        let mut local: HashMap<u16, Counter> = [(1, Counter::default()), (2, Counter::default())]
            .into_iter()
            .map(|(id, mut c)| {
                c.id = id;
                (id, c)
            })
            .collect();

        let outcome = batch
            .read(&mut local, SerializationModeFlags::ALL_FROM_SERVER, Staleness::FRESH)
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(local[&1].value, 10);
        assert_eq!(local[&2].kind, 1);
        assert_eq!(local[&2].value, 20);
    }

    #[test]
    fn test_unresolved_id_truncates_rest_of_batch() {
        let mode = SerializationModeFlags::VARYING_FROM_SERVER;
        let mut writer = EntityBatchWriter::new(mode);
        for (id, value) in [(5, 50), (7, 70), (9, 90)] {
            writer.write(&counter(id, value)).unwrap();
        }
        let batch = writer.finish();

        let mut local: HashMap<u16, Counter> = HashMap::new();
        local.insert(5, counter(5, 0));
        local.insert(9, counter(9, 0));

        let outcome = batch.read(&mut local, mode, Staleness::FRESH).unwrap();
        assert_eq!(outcome.applied, vec![5]);
        assert_eq!(outcome.unresolved, Some(7));
        assert_eq!(outcome.dropped, 1);
        assert_eq!(local[&5].value, 50);
        assert_eq!(local[&9].value, 0);
    }

    #[test]
    fn test_leftover_payload_is_an_error() {
        let batch = EntityBatch::new(vec![1], Bytes::from_static(&[0, 1, 0xFF]));
        let mut local: HashMap<u16, Counter> = HashMap::new();
        local.insert(1, counter(1, 0));

        assert!(matches!(
            batch.read(&mut local, SerializationModeFlags::VARYING_FROM_SERVER, Staleness::FRESH),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_short_payload_is_an_error() {
        let batch = EntityBatch::new(vec![1, 2], Bytes::from_static(&[0, 1]));
        let mut local: HashMap<u16, Counter> = HashMap::new();
        local.insert(1, counter(1, 0));
        local.insert(2, counter(2, 0));

        assert!(matches!(
            batch.read(&mut local, SerializationModeFlags::VARYING_FROM_SERVER, Staleness::FRESH),
            Err(ProtocolError::TooShort)
        ));
    }

    #[test]
    fn test_batch_wire_layout() {
        let batch = EntityBatch::new(vec![0x0102, 3], Bytes::from_static(&[9, 9]));
        let mut writer = WireWriter::new();
        batch.encode(&mut writer).unwrap();
        assert_eq!(writer.as_slice(), &[0, 2, 1, 2, 0, 3, 0, 2, 9, 9]);

        let bytes = writer.into_bytes();
        let mut reader = WireReader::new(&bytes);
        assert_eq!(EntityBatch::decode(&mut reader).unwrap(), batch);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_staleness_follows_sender_frame_rate() {
        assert_eq!(Staleness::new(30.0, 60).seconds(), 0.5);
        assert_eq!(Staleness::new(30.0, 30).seconds(), 1.0);
        assert_eq!(Staleness::new(-4.0, 60).seconds(), 0.0);
        assert_eq!(Staleness::FRESH.seconds(), 0.0);
    }
}
