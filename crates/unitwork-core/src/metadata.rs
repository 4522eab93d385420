//! Mapping metadata and the persister contracts.
//!
//! The engine consumes mapping information through [`EntityPersister`] and
//! [`CollectionPersister`]. A persister describes one entity type or
//! collection role ([`EntityMetadata`], [`CollectionMetadata`]) and knows
//! how to read state for it. Everything else (SQL, type marshaling) stays
//! behind these traits.
//!
//! # Example
//!
//! ```ignore
//! let order = EntityMetadata::new("Order")
//!     .property(PropertyInfo::scalar("number").not_null())
//!     .property(PropertyInfo::many_to_one("customer", "Customer").cascade(CascadeStyle::ALL))
//!     .property(PropertyInfo::collection("lines", "Order.lines").cascade(CascadeStyle::ALL_DELETE_ORPHAN))
//!     .versioned_by("version")
//!     .spaces(["orders"]);
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::EntityRegionAccess;
use crate::cascade_style::{CascadeStyle, ForeignKeyDirection};
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::property::{PropertyAccess, PropertyValue};
use crate::Value;

/// Representation used for entity instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EntityMode {
    /// Typed structs implementing [`PropertyAccess`].
    #[default]
    Pojo,
    /// Dynamic maps ([`crate::DynamicEntity`]).
    Map,
}

impl EntityMode {
    pub const fn as_u8(self) -> u8 {
        match self {
            EntityMode::Pojo => 0,
            EntityMode::Map => 1,
        }
    }

    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EntityMode::Pojo),
            1 => Some(EntityMode::Map),
            _ => None,
        }
    }
}

impl fmt::Display for EntityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityMode::Pojo => f.write_str("POJO"),
            EntityMode::Map => f.write_str("MAP"),
        }
    }
}

/// Type of one mapped property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyType {
    /// Plain column value.
    Scalar,
    /// Many-to-one association.
    ManyToOne { entity_name: String },
    /// One-to-one association.
    OneToOne {
        entity_name: String,
        direction: ForeignKeyDirection,
    },
    /// Collection, addressed by role.
    Collection { role: String },
    /// Embedded component.
    Component { properties: Vec<PropertyInfo> },
}

impl PropertyType {
    pub const fn is_entity_type(&self) -> bool {
        matches!(
            self,
            PropertyType::ManyToOne { .. } | PropertyType::OneToOne { .. }
        )
    }

    pub const fn is_collection_type(&self) -> bool {
        matches!(self, PropertyType::Collection { .. })
    }

    pub const fn is_component_type(&self) -> bool {
        matches!(self, PropertyType::Component { .. })
    }

    /// Entity named by an association, if this is one.
    pub fn associated_entity_name(&self) -> Option<&str> {
        match self {
            PropertyType::ManyToOne { entity_name } | PropertyType::OneToOne { entity_name, .. } => {
                Some(entity_name)
            }
            _ => None,
        }
    }

    pub fn foreign_key_direction(&self) -> ForeignKeyDirection {
        match self {
            PropertyType::ManyToOne { .. } | PropertyType::Scalar => ForeignKeyDirection::FromParent,
            PropertyType::OneToOne { direction, .. } => *direction,
            PropertyType::Collection { .. } | PropertyType::Component { .. } => {
                ForeignKeyDirection::ToParent
            }
        }
    }
}

/// One mapped property of an entity or component.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyInfo {
    pub name: String,
    pub property_type: PropertyType,
    pub cascade: CascadeStyle,
    pub nullable: bool,
    pub lazy: bool,
    /// Excluded from dirty checking when false.
    pub updatable: bool,
}

impl PropertyInfo {
    #[must_use]
    pub fn new(name: impl Into<String>, property_type: PropertyType) -> Self {
        Self {
            name: name.into(),
            property_type,
            cascade: CascadeStyle::NONE,
            nullable: true,
            lazy: false,
            updatable: true,
        }
    }

    #[must_use]
    pub fn scalar(name: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Scalar)
    }

    #[must_use]
    pub fn many_to_one(name: impl Into<String>, entity_name: impl Into<String>) -> Self {
        Self::new(
            name,
            PropertyType::ManyToOne {
                entity_name: entity_name.into(),
            },
        )
    }

    #[must_use]
    pub fn one_to_one(
        name: impl Into<String>,
        entity_name: impl Into<String>,
        direction: ForeignKeyDirection,
    ) -> Self {
        Self::new(
            name,
            PropertyType::OneToOne {
                entity_name: entity_name.into(),
                direction,
            },
        )
    }

    #[must_use]
    pub fn collection(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self::new(name, PropertyType::Collection { role: role.into() })
    }

    #[must_use]
    pub fn component(name: impl Into<String>, properties: Vec<PropertyInfo>) -> Self {
        Self::new(name, PropertyType::Component { properties })
    }

    #[must_use]
    pub const fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    #[must_use]
    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub const fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    #[must_use]
    pub const fn not_updatable(mut self) -> Self {
        self.updatable = false;
        self
    }

    /// Does this property, or any nested component property, cascade?
    pub fn has_cascades(&self) -> bool {
        if !self.cascade.is_none() {
            return true;
        }
        match &self.property_type {
            PropertyType::Component { properties } => properties.iter().any(Self::has_cascades),
            _ => false,
        }
    }
}

/// Static description of one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMetadata {
    pub entity_name: String,
    pub root_entity_name: String,
    /// Every entity name assignable to this one, itself included.
    pub subclass_entity_names: Vec<String>,
    pub properties: Vec<PropertyInfo>,
    pub mutable: bool,
    pub has_proxy: bool,
    pub version_property: Option<usize>,
    pub natural_id_properties: Vec<usize>,
    pub natural_id_mutable: bool,
    /// Tables touched by writes to this entity.
    pub property_spaces: Vec<String>,
    pub lazy_properties_cacheable: bool,
}

impl EntityMetadata {
    #[must_use]
    pub fn new(entity_name: impl Into<String>) -> Self {
        let entity_name = entity_name.into();
        Self {
            root_entity_name: entity_name.clone(),
            subclass_entity_names: vec![entity_name.clone()],
            property_spaces: vec![entity_name.to_lowercase()],
            entity_name,
            properties: Vec::new(),
            mutable: true,
            has_proxy: false,
            version_property: None,
            natural_id_properties: Vec::new(),
            natural_id_mutable: false,
            lazy_properties_cacheable: true,
        }
    }

    #[must_use]
    pub fn property(mut self, property: PropertyInfo) -> Self {
        self.properties.push(property);
        self
    }

    /// Declare this entity a subclass in the hierarchy rooted at `root`.
    #[must_use]
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root_entity_name = root.into();
        self
    }

    #[must_use]
    pub fn subclass(mut self, entity_name: impl Into<String>) -> Self {
        self.subclass_entity_names.push(entity_name.into());
        self
    }

    #[must_use]
    pub const fn immutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    #[must_use]
    pub const fn with_proxy(mut self) -> Self {
        self.has_proxy = true;
        self
    }

    /// Use the named (already added) property as the version.
    #[must_use]
    pub fn versioned_by(mut self, property: &str) -> Self {
        self.version_property = self.property_index(property);
        self
    }

    /// Use the named (already added) properties as the natural identifier.
    #[must_use]
    pub fn natural_id(mut self, properties: &[&str], mutable: bool) -> Self {
        self.natural_id_properties = properties
            .iter()
            .filter_map(|name| self.property_index(name))
            .collect();
        self.natural_id_mutable = mutable;
        self
    }

    #[must_use]
    pub fn spaces<I, S>(mut self, spaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.property_spaces = spaces.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub const fn lazy_properties_not_cacheable(mut self) -> Self {
        self.lazy_properties_cacheable = false;
        self
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn has_cascades(&self) -> bool {
        self.properties.iter().any(PropertyInfo::has_cascades)
    }

    pub fn has_collections(&self) -> bool {
        self.properties
            .iter()
            .any(|p| p.property_type.is_collection_type())
    }

    pub fn has_natural_identifier(&self) -> bool {
        !self.natural_id_properties.is_empty()
    }

    pub fn is_versioned(&self) -> bool {
        self.version_property.is_some()
    }

    /// Is `entity_name` this entity or one of its subclasses?
    pub fn is_subclass_entity_name(&self, entity_name: &str) -> bool {
        self.subclass_entity_names.iter().any(|n| n == entity_name)
    }

    /// Version value within a state array.
    pub fn version_of(&self, state: &[PropertyValue]) -> Option<Value> {
        let index = self.version_property?;
        match state.get(index) {
            Some(PropertyValue::Scalar(v)) => Some(v.clone()),
            _ => None,
        }
    }
}

/// Physical representation of a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    #[default]
    Bag,
    List,
    Set,
    /// Fixed array; the wrapper is tracked through a holder.
    Array,
}

impl CollectionKind {
    pub const fn as_u8(self) -> u8 {
        match self {
            CollectionKind::Bag => 0,
            CollectionKind::List => 1,
            CollectionKind::Set => 2,
            CollectionKind::Array => 3,
        }
    }

    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CollectionKind::Bag),
            1 => Some(CollectionKind::List),
            2 => Some(CollectionKind::Set),
            3 => Some(CollectionKind::Array),
            _ => None,
        }
    }

    /// Do elements have a stable position?
    pub const fn is_indexed(self) -> bool {
        matches!(self, CollectionKind::List | CollectionKind::Array)
    }
}

/// Static description of one collection role.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMetadata {
    /// `"<OwnerEntity>.<property>"`
    pub role: String,
    pub owner_entity_name: String,
    pub element_type: PropertyType,
    pub kind: CollectionKind,
    pub lazy: bool,
    pub inverse: bool,
    pub collection_spaces: Vec<String>,
}

impl CollectionMetadata {
    /// Lazy collection of scalar elements.
    #[must_use]
    pub fn new(role: impl Into<String>, owner_entity_name: impl Into<String>) -> Self {
        let role = role.into();
        Self {
            collection_spaces: vec![role.to_lowercase().replace('.', "_")],
            role,
            owner_entity_name: owner_entity_name.into(),
            element_type: PropertyType::Scalar,
            kind: CollectionKind::Bag,
            lazy: true,
            inverse: false,
        }
    }

    /// Elements are references to `entity_name`.
    #[must_use]
    pub fn of_entities(mut self, entity_name: impl Into<String>) -> Self {
        self.element_type = PropertyType::ManyToOne {
            entity_name: entity_name.into(),
        };
        self
    }

    #[must_use]
    pub fn of_components(mut self, properties: Vec<PropertyInfo>) -> Self {
        self.element_type = PropertyType::Component { properties };
        self
    }

    #[must_use]
    pub const fn kind(mut self, kind: CollectionKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub const fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }

    #[must_use]
    pub const fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }

    #[must_use]
    pub fn spaces<I, S>(mut self, spaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collection_spaces = spaces.into_iter().map(Into::into).collect();
        self
    }

    pub fn element_entity_name(&self) -> Option<&str> {
        self.element_type.associated_entity_name()
    }

    /// Property name part of the role.
    pub fn property_name(&self) -> &str {
        self.role
            .rsplit_once('.')
            .map_or(self.role.as_str(), |(_, property)| property)
    }
}

/// Persistence operations and metadata for one entity type.
pub trait EntityPersister: fmt::Debug + Send + Sync {
    fn metadata(&self) -> &EntityMetadata;

    /// Create an empty instance, optionally carrying its identifier.
    fn instantiate(&self, id: Option<&Value>) -> Box<dyn PropertyAccess>;

    /// Read the current row for `id` as hydrated property values.
    ///
    /// Associations come back as [`PropertyValue::Unresolved`] (or null),
    /// collections as null, unfetched lazy properties as
    /// [`PropertyValue::Unfetched`]. `Ok(None)` means no row exists.
    fn load_state(&self, id: &Value) -> Result<Option<Vec<PropertyValue>>>;

    /// Fetch one lazy property left [`PropertyValue::Unfetched`] by
    /// [`EntityPersister::load_state`].
    fn load_lazy_property(&self, id: &Value, index: usize) -> Result<PropertyValue> {
        let _ = (id, index);
        Ok(PropertyValue::Null)
    }

    /// Read only the natural-id properties of the row for `id`.
    fn natural_id_snapshot(&self, id: &Value) -> Result<Option<Vec<PropertyValue>>> {
        let indices = &self.metadata().natural_id_properties;
        Ok(self.load_state(id)?.map(|state| {
            indices
                .iter()
                .filter_map(|&i| state.get(i).cloned())
                .collect()
        }))
    }

    /// Produce an identifier for a new instance.
    fn generate_identifier(&self) -> Result<Value> {
        Err(Error::IdentifierGeneration(format!(
            "ids for this class must be manually assigned before calling save(): {}",
            self.metadata().entity_name
        )))
    }

    /// Acquire a database lock on the row.
    fn lock(&self, id: &Value, version: Option<&Value>, mode: LockMode) -> Result<()> {
        let _ = (id, version, mode);
        Ok(())
    }

    /// Second-level cache region, if this entity is cached.
    fn cache(&self) -> Option<&dyn EntityRegionAccess> {
        None
    }
}

/// Persistence operations and metadata for one collection role.
pub trait CollectionPersister: fmt::Debug + Send + Sync {
    fn metadata(&self) -> &CollectionMetadata;

    /// Read the elements stored under the owner key, hydrated.
    fn load_elements(&self, key: &Value) -> Result<Vec<PropertyValue>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade_style::CascadeKind;

    fn order_metadata() -> EntityMetadata {
        EntityMetadata::new("Order")
            .property(PropertyInfo::scalar("number").not_null())
            .property(PropertyInfo::scalar("version"))
            .property(
                PropertyInfo::many_to_one("customer", "Customer")
                    .cascade(CascadeStyle::of(CascadeKind::Persist)),
            )
            .property(PropertyInfo::collection("lines", "Order.lines"))
            .versioned_by("version")
            .natural_id(&["number"], false)
    }

    #[test]
    fn test_entity_metadata_builder() {
        let meta = order_metadata();
        assert_eq!(meta.property_index("customer"), Some(2));
        assert_eq!(meta.version_property, Some(1));
        assert_eq!(meta.natural_id_properties, vec![0]);
        assert!(meta.has_cascades());
        assert!(meta.has_collections());
        assert!(meta.is_subclass_entity_name("Order"));
        assert!(!meta.is_subclass_entity_name("Customer"));
        assert_eq!(meta.property_spaces, vec!["order".to_string()]);
    }

    #[test]
    fn test_version_of() {
        let meta = order_metadata();
        let state = vec![
            PropertyValue::Scalar(Value::from("A-1")),
            PropertyValue::Scalar(Value::Int(3)),
            PropertyValue::Null,
            PropertyValue::Null,
        ];
        assert_eq!(meta.version_of(&state), Some(Value::Int(3)));
    }

    #[test]
    fn test_component_cascades_are_seen() {
        let inner = PropertyInfo::many_to_one("country", "Country").cascade(CascadeStyle::ALL);
        let meta = EntityMetadata::new("Person")
            .property(PropertyInfo::component("address", vec![PropertyInfo::scalar("street"), inner]));
        assert!(meta.has_cascades());
    }

    #[test]
    fn test_collection_metadata() {
        let meta = CollectionMetadata::new("Order.lines", "Order")
            .of_entities("OrderLine")
            .kind(CollectionKind::List)
            .eager();
        assert_eq!(meta.element_entity_name(), Some("OrderLine"));
        assert_eq!(meta.property_name(), "lines");
        assert!(!meta.lazy);
        assert!(meta.kind.is_indexed());
        assert_eq!(meta.collection_spaces, vec!["order_lines".to_string()]);
    }

    #[test]
    fn test_foreign_key_direction_defaults() {
        assert_eq!(
            PropertyType::ManyToOne {
                entity_name: "A".into()
            }
            .foreign_key_direction(),
            ForeignKeyDirection::FromParent
        );
        assert_eq!(
            PropertyType::Collection { role: "A.b".into() }.foreign_key_direction(),
            ForeignKeyDirection::ToParent
        );
    }
}
