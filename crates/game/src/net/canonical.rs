use std::collections::HashMap;

use super::protocol::ProtocolError;

/// A string interned to a small integer id for compact wire representation.
///
/// Id 0 is reserved for "no string".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CanonicalString(u16);

impl CanonicalString {
    pub const NONE: Self = Self(0);

    pub fn from_id(id: u16) -> Self {
        Self(id)
    }

    pub fn id(self) -> u16 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

const STANDARD_NAMES: [&str; 12] = [
    "ship",
    "shot",
    "wall",
    "windlord",
    "bugger",
    "plissken",
    "bazooka",
    "rockets",
    "mines",
    "Blood Bowl",
    "Amazonas",
    "Eris",
];

/// Interning table shared by both ends of a session.
///
/// Both peers must build the table from the same names in the same order.
#[derive(Debug, Clone, Default)]
pub struct CanonicalStrings {
    names: Vec<String>,
    by_name: HashMap<String, u16>,
}

impl CanonicalStrings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_names<I, S>(names: I) -> Result<Self, ProtocolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new();
        for name in names {
            table.intern(name)?;
        }
        Ok(table)
    }

    /// Table with the gob type, weapon and arena names the game ships with.
    pub fn standard() -> Self {
        let mut table = Self::new();
        for (id, name) in (1..).zip(STANDARD_NAMES) {
            table.insert(id, name.to_owned());
        }
        table
    }

    /// Id of `name`, assigning the next free one if it is new.
    ///
    /// Fails once all 16-bit ids are taken; an id is never handed out twice.
    pub fn intern(&mut self, name: impl Into<String>) -> Result<CanonicalString, ProtocolError> {
        let name = name.into();
        if let Some(&id) = self.by_name.get(&name) {
            return Ok(CanonicalString(id));
        }
        let id = u16::try_from(self.names.len() + 1)
            .map_err(|_| ProtocolError::CanonicalTableFull(self.names.len()))?;
        self.insert(id, name);
        Ok(CanonicalString(id))
    }

    fn insert(&mut self, id: u16, name: String) {
        self.names.push(name.clone());
        self.by_name.insert(name, id);
    }

    pub fn get(&self, name: &str) -> Option<CanonicalString> {
        self.by_name.get(name).copied().map(CanonicalString)
    }

    pub fn resolve(&self, value: CanonicalString) -> Result<&str, ProtocolError> {
        if value.is_none() {
            return Err(ProtocolError::UnknownCanonical(0));
        }
        self.names
            .get(value.0 as usize - 1)
            .map(String::as_str)
            .ok_or(ProtocolError::UnknownCanonical(value.0))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
