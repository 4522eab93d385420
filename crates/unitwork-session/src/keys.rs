//! Identity keys for the persistence context.
//!
//! Keys are immutable value types. Entity keys always use the root entity
//! name so every class in a hierarchy shares one identifier space.

use std::fmt;
use std::io::{Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};

use unitwork_core::{EntityMetadata, EntityMode, Error, Result, Value};

use crate::serialization::{read_str, read_value, write_str, write_value};

/// Identity of one row within the unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    identifier: Value,
    entity_name: String,
    entity_mode: EntityMode,
}

impl EntityKey {
    #[must_use]
    pub fn new(identifier: Value, root_entity_name: impl Into<String>, entity_mode: EntityMode) -> Self {
        Self {
            identifier,
            entity_name: root_entity_name.into(),
            entity_mode,
        }
    }

    /// Key for `id` in the hierarchy described by `metadata`.
    #[must_use]
    pub fn for_entity(id: Value, metadata: &EntityMetadata, entity_mode: EntityMode) -> Self {
        Self::new(id, metadata.root_entity_name.clone(), entity_mode)
    }

    pub fn identifier(&self) -> &Value {
        &self.identifier
    }

    /// Root entity name.
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn entity_mode(&self) -> EntityMode {
        self.entity_mode
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_value(w, &self.identifier)?;
        write_str(w, &self.entity_name)?;
        w.write_u8(self.entity_mode.as_u8())?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let identifier = read_value(r)?;
        let entity_name = read_str(r)?;
        let entity_mode = read_mode(r)?;
        Ok(Self::new(identifier, entity_name, entity_mode))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey[{}#{}]", self.entity_name, self.identifier)
    }
}

/// Identity of a row by a unique (non-primary) key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityUniqueKey {
    entity_name: String,
    unique_key_name: String,
    key: Value,
    entity_mode: EntityMode,
}

impl EntityUniqueKey {
    #[must_use]
    pub fn new(
        entity_name: impl Into<String>,
        unique_key_name: impl Into<String>,
        key: Value,
        entity_mode: EntityMode,
    ) -> Self {
        Self {
            entity_name: entity_name.into(),
            unique_key_name: unique_key_name.into(),
            key,
            entity_mode,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn unique_key_name(&self) -> &str {
        &self.unique_key_name
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_str(w, &self.entity_name)?;
        write_str(w, &self.unique_key_name)?;
        write_value(w, &self.key)?;
        w.write_u8(self.entity_mode.as_u8())?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let entity_name = read_str(r)?;
        let unique_key_name = read_str(r)?;
        let key = read_value(r)?;
        let entity_mode = read_mode(r)?;
        Ok(Self::new(entity_name, unique_key_name, key, entity_mode))
    }
}

impl fmt::Display for EntityUniqueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EntityUniqueKey[{}.{}={}]",
            self.entity_name, self.unique_key_name, self.key
        )
    }
}

/// Identity of one collection: its role plus the owner's key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    role: String,
    key: Value,
    entity_mode: EntityMode,
}

impl CollectionKey {
    #[must_use]
    pub fn new(role: impl Into<String>, key: Value, entity_mode: EntityMode) -> Self {
        Self {
            role: role.into(),
            key,
            entity_mode,
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub(crate) fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        write_str(w, &self.role)?;
        write_value(w, &self.key)?;
        w.write_u8(self.entity_mode.as_u8())?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let role = read_str(r)?;
        let key = read_value(r)?;
        let entity_mode = read_mode(r)?;
        Ok(Self::new(role, key, entity_mode))
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionKey[{}#{}]", self.role, self.key)
    }
}

fn read_mode<R: Read>(r: &mut R) -> Result<EntityMode> {
    let tag = r.read_u8()?;
    EntityMode::from_u8(tag).ok_or_else(|| Error::Serde(format!("unknown entity mode tag {}", tag)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    #[test]
    fn test_subclasses_share_root_key() {
        let cat = EntityMetadata::new("Cat").root("Animal");
        let dog = EntityMetadata::new("Dog").root("Animal");
        let a = EntityKey::for_entity(Value::Int(1), &cat, EntityMode::Pojo);
        let b = EntityKey::for_entity(Value::Int(1), &dog, EntityMode::Pojo);
        assert_eq!(a, b);
        assert_eq!(a.entity_name(), "Animal");

        let mut map = HashMap::new();
        map.insert(a, "cat");
        assert_eq!(map.get(&b), Some(&"cat"));
    }

    #[test]
    fn test_entity_mode_is_part_of_identity() {
        let pojo = EntityKey::new(Value::Int(1), "Animal", EntityMode::Pojo);
        let map = EntityKey::new(Value::Int(1), "Animal", EntityMode::Map);
        assert_ne!(pojo, map);
    }

    #[test]
    fn test_fixed_field_encoding() {
        let key = CollectionKey::new("Order.lines", Value::BigInt(9), EntityMode::Pojo);
        let mut buf = Vec::new();
        key.write_to(&mut buf).unwrap();
        // role (4 + 11 bytes), then the value frame, then the mode byte
        assert_eq!(&buf[..4], &[0, 0, 0, 11]);
        assert_eq!(&buf[4..15], b"Order.lines");
        assert_eq!(buf.last(), Some(&0));
        assert_eq!(CollectionKey::read_from(&mut Cursor::new(buf)).unwrap(), key);
    }

    #[test]
    fn test_unique_key_display() {
        let key = EntityUniqueKey::new("User", "email", Value::from("a@x.io"), EntityMode::Pojo);
        assert_eq!(key.to_string(), "EntityUniqueKey[User.email=a@x.io]");
    }
}
