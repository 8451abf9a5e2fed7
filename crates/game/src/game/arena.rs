use std::collections::BTreeMap;

use glam::Vec2;

use crate::net::{
    BatchReadOutcome, CanonicalString, CanonicalStrings, EntityBatchWriter, EntityLookup,
    GobCreation, GobDeletion, GobUpdate, NetSerializable, ProtocolError, SerializationModeFlags,
    Staleness,
};

use super::gob::{Gob, GobKind};

/// Gob table of one running arena. Acts as the id lookup for batches.
#[derive(Debug)]
pub struct Arena {
    /// Server-assigned; `None` on a client until the first creation arrives.
    pub id: Option<u8>,
    pub name: CanonicalString,
    gobs: BTreeMap<u16, Gob>,
    next_gob_id: u16,
}

impl Arena {
    pub fn new(id: Option<u8>, name: CanonicalString) -> Self {
        Self {
            id,
            name,
            gobs: BTreeMap::new(),
            next_gob_id: 1,
        }
    }

    fn allocate_id(&mut self) -> u16 {
        loop {
            let id = self.next_gob_id;
            self.next_gob_id = self.next_gob_id.wrapping_add(1).max(1);
            if !self.gobs.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn spawn_ship(&mut self, owner: u8, position: Vec2) -> u16 {
        let id = self.allocate_id();
        self.gobs.insert(id, Gob::ship(id, owner, position));
        id
    }

    pub fn spawn_wall(&mut self, position: Vec2, size: Vec2) -> u16 {
        let id = self.allocate_id();
        self.gobs.insert(id, Gob::wall(id, position, size));
        id
    }

    pub fn insert(&mut self, gob: Gob) {
        self.gobs.insert(gob.id, gob);
    }

    pub fn remove(&mut self, id: u16) -> Option<Gob> {
        self.gobs.remove(&id)
    }

    pub fn get(&self, id: u16) -> Option<&Gob> {
        self.gobs.get(&id)
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Gob> {
        self.gobs.get_mut(&id)
    }

    pub fn gobs(&self) -> impl Iterator<Item = &Gob> {
        self.gobs.values()
    }

    pub fn gobs_mut(&mut self) -> impl Iterator<Item = &mut Gob> {
        self.gobs.values_mut()
    }

    pub fn len(&self) -> usize {
        self.gobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gobs.is_empty()
    }

    pub fn wall_count(&self) -> usize {
        self.gobs.values().filter(|gob| gob.kind == GobKind::Wall).count()
    }

    pub fn ship_of(&self, player_id: u8) -> Option<&Gob> {
        self.gobs
            .values()
            .find(|gob| gob.kind == GobKind::Ship && gob.owner == Some(player_id))
    }

    /// Creation message for the given gobs, or every gob when `ids` is `None`.
    pub fn creation_message(
        &self,
        frame_number: u32,
        ids: Option<&[u16]>,
        strings: &CanonicalStrings,
    ) -> Result<GobCreation, ProtocolError> {
        let mut writer = EntityBatchWriter::new(SerializationModeFlags::ALL_FROM_SERVER);
        let mut layers = Vec::new();
        let mut type_names = Vec::new();

        let selected: Vec<&Gob> = match ids {
            Some(ids) => ids.iter().filter_map(|id| self.gobs.get(id)).collect(),
            None => self.gobs.values().collect(),
        };
        for gob in selected {
            writer.write(gob)?;
            layers.push(gob.layer);
            type_names.push(gob.kind.canonical(strings)?);
        }

        Ok(GobCreation {
            frame_number,
            arena_id: self.id.unwrap_or_default(),
            layers,
            type_names,
            batch: writer.finish(),
        })
    }

    /// Per-tick state of every moving gob.
    pub fn update_message(&self, frame_number: u32, mode: SerializationModeFlags) -> Result<GobUpdate, ProtocolError> {
        let mut writer = EntityBatchWriter::new(mode);
        for gob in self.gobs.values().filter(|gob| gob.kind.is_dynamic()) {
            writer.write(gob)?;
        }
        Ok(GobUpdate {
            frame_number,
            batch: writer.finish(),
        })
    }

    /// Creates the announced gobs, then reads their initial state.
    ///
    /// Creations for another arena are ignored. Returns how many gobs were
    /// created.
    pub fn apply_creation(
        &mut self,
        creation: &GobCreation,
        strings: &CanonicalStrings,
        staleness: Staleness,
    ) -> Result<usize, ProtocolError> {
        match self.id {
            Some(id) if id != creation.arena_id => {
                log::debug!(
                    "Ignoring gob creation for arena {} while in arena {id}",
                    creation.arena_id
                );
                return Ok(0);
            }
            Some(_) => {}
            None => self.id = Some(creation.arena_id),
        }

        let ids = &creation.batch.ids;
        if creation.layers.len() != ids.len() || creation.type_names.len() != ids.len() {
            return Err(ProtocolError::CountMismatch("GobCreation"));
        }
        for ((&id, &layer), &type_name) in ids.iter().zip(&creation.layers).zip(&creation.type_names) {
            let kind = GobKind::from_canonical(type_name, strings)?;
            self.gobs.insert(id, Gob::new(id, kind, layer));
        }

        let outcome = creation
            .batch
            .read(self, SerializationModeFlags::ALL_FROM_SERVER, staleness)?;
        Ok(outcome.applied.len())
    }

    pub fn apply_update(
        &mut self,
        update: &GobUpdate,
        mode: SerializationModeFlags,
        staleness: Staleness,
    ) -> Result<BatchReadOutcome, ProtocolError> {
        update.batch.read(self, mode, staleness)
    }

    pub fn apply_deletion(&mut self, deletion: &GobDeletion) -> usize {
        deletion
            .gob_ids
            .iter()
            .filter(|&&id| self.gobs.remove(&id).is_some())
            .count()
    }

    /// Lookup that only resolves ships owned by `players`.
    pub fn owned_by<'a>(&'a mut self, players: &'a [u8]) -> OwnedShips<'a> {
        OwnedShips { arena: self, players }
    }
}

impl EntityLookup for Arena {
    fn resolve(&mut self, id: u16) -> Option<&mut dyn NetSerializable> {
        self.gobs
            .get_mut(&id)
            .map(|gob| gob as &mut dyn NetSerializable)
    }
}

/// Restricts client-sent updates to the sender's own ships.
pub struct OwnedShips<'a> {
    arena: &'a mut Arena,
    players: &'a [u8],
}

impl EntityLookup for OwnedShips<'_> {
    fn resolve(&mut self, id: u16) -> Option<&mut dyn NetSerializable> {
        let players = self.players;
        self.arena
            .gobs
            .get_mut(&id)
            .filter(|gob| {
                gob.kind == GobKind::Ship && gob.owner.is_some_and(|owner| players.contains(&owner))
            })
            .map(|gob| gob as &mut dyn NetSerializable)
    }
}
