//! Lookup of persisters by entity name and collection role.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::{Error, Result};
use crate::metadata::{CollectionPersister, EntityPersister, PropertyType};

fn entity_name_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)*$").ok())
        .as_ref()
}

fn role_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?P<owner>[A-Za-z_][A-Za-z0-9_$.]*)\.(?P<property>[A-Za-z_][A-Za-z0-9_]*)$").ok())
        .as_ref()
}

/// Every persister known to a session factory.
///
/// Shared between sessions behind an `Arc`.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    entities: HashMap<String, Arc<dyn EntityPersister>>,
    collections: HashMap<String, Arc<dyn CollectionPersister>>,
}

impl MetadataRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity persister under its entity name.
    pub fn register_entity(&mut self, persister: Arc<dyn EntityPersister>) -> Result<()> {
        let name = persister.metadata().entity_name.clone();
        if !entity_name_pattern().is_some_and(|re| re.is_match(&name)) {
            return Err(Error::Mapping(format!("invalid entity name: {:?}", name)));
        }
        if self.entities.contains_key(&name) {
            return Err(Error::Mapping(format!("duplicate entity mapping: {}", name)));
        }
        tracing::debug!(entity = %name, "registered entity persister");
        self.entities.insert(name, persister);
        Ok(())
    }

    /// Register a collection persister under its role.
    ///
    /// Roles have the form `"<OwnerEntity>.<property>"` and the owner part
    /// must match the persister's owner entity.
    pub fn register_collection(&mut self, persister: Arc<dyn CollectionPersister>) -> Result<()> {
        let meta = persister.metadata();
        let role = meta.role.clone();
        let owner = role_pattern()
            .and_then(|re| re.captures(&role))
            .and_then(|caps| caps.name("owner").map(|m| m.as_str().to_string()))
            .ok_or_else(|| Error::Mapping(format!("invalid collection role: {:?}", role)))?;
        if owner != meta.owner_entity_name {
            return Err(Error::Mapping(format!(
                "collection role {} does not belong to {}",
                role, meta.owner_entity_name
            )));
        }
        if self.collections.contains_key(&role) {
            return Err(Error::Mapping(format!("duplicate collection mapping: {}", role)));
        }
        tracing::debug!(role = %role, "registered collection persister");
        self.collections.insert(role, persister);
        Ok(())
    }

    pub fn entity_persister(&self, entity_name: &str) -> Result<&Arc<dyn EntityPersister>> {
        self.entities
            .get(entity_name)
            .ok_or_else(|| Error::UnknownEntity(entity_name.to_string()))
    }

    pub fn collection_persister(&self, role: &str) -> Result<&Arc<dyn CollectionPersister>> {
        self.collections
            .get(role)
            .ok_or_else(|| Error::UnknownEntity(role.to_string()))
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Check that every association and collection points at a registered
    /// persister.
    pub fn validate(&self) -> Result<()> {
        for persister in self.entities.values() {
            let meta = persister.metadata();
            for property in &meta.properties {
                self.validate_type(&meta.entity_name, &property.name, &property.property_type)?;
            }
        }
        for persister in self.collections.values() {
            let meta = persister.metadata();
            self.validate_type(&meta.role, "<element>", &meta.element_type)?;
        }
        Ok(())
    }

    fn validate_type(&self, owner: &str, property: &str, property_type: &PropertyType) -> Result<()> {
        match property_type {
            PropertyType::Scalar => Ok(()),
            PropertyType::ManyToOne { entity_name } | PropertyType::OneToOne { entity_name, .. } => {
                if self.entities.contains_key(entity_name) {
                    Ok(())
                } else {
                    Err(Error::Mapping(format!(
                        "association {}.{} references an unknown entity: {}",
                        owner, property, entity_name
                    )))
                }
            }
            PropertyType::Collection { role } => {
                if self.collections.contains_key(role) {
                    Ok(())
                } else {
                    Err(Error::Mapping(format!(
                        "collection {}.{} references an unknown role: {}",
                        owner, property, role
                    )))
                }
            }
            PropertyType::Component { properties } => properties
                .iter()
                .try_for_each(|p| self.validate_type(owner, &p.name, &p.property_type)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCollectionPersister, MemoryEntityPersister};
    use crate::metadata::{CollectionMetadata, EntityMetadata, PropertyInfo};

    #[test]
    fn test_register_and_lookup() {
        let mut registry = MetadataRegistry::new();
        registry
            .register_entity(Arc::new(MemoryEntityPersister::new(EntityMetadata::new("Order"))))
            .unwrap();
        assert!(registry.entity_persister("Order").is_ok());
        assert!(matches!(
            registry.entity_persister("Nope"),
            Err(Error::UnknownEntity(_))
        ));
        let dup = registry
            .register_entity(Arc::new(MemoryEntityPersister::new(EntityMetadata::new("Order"))));
        assert!(matches!(dup, Err(Error::Mapping(_))));
    }

    #[test]
    fn test_role_must_match_owner() {
        let mut registry = MetadataRegistry::new();
        let bad = registry.register_collection(Arc::new(MemoryCollectionPersister::new(
            CollectionMetadata::new("Order.lines", "Customer"),
        )));
        assert!(matches!(bad, Err(Error::Mapping(_))));
        let malformed = registry.register_collection(Arc::new(MemoryCollectionPersister::new(
            CollectionMetadata::new("lines", "Order"),
        )));
        assert!(matches!(malformed, Err(Error::Mapping(_))));
        registry
            .register_collection(Arc::new(MemoryCollectionPersister::new(
                CollectionMetadata::new("Order.lines", "Order"),
            )))
            .unwrap();
    }

    #[test]
    fn test_validate_reports_dangling_association() {
        let mut registry = MetadataRegistry::new();
        registry
            .register_entity(Arc::new(MemoryEntityPersister::new(
                EntityMetadata::new("Order").property(PropertyInfo::many_to_one("customer", "Customer")),
            )))
            .unwrap();
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("Customer"));

        registry
            .register_entity(Arc::new(MemoryEntityPersister::new(EntityMetadata::new("Customer"))))
            .unwrap();
        registry.validate().unwrap();
    }
}
