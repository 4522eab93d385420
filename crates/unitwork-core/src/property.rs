//! Property values and indexed property access.
//!
//! Entity state is an ordered array of [`PropertyValue`], one slot per
//! mapped property, in the order given by the entity's metadata. Instances
//! expose that array through [`PropertyAccess`] so the engine never needs
//! reflection over user types.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Value;
use crate::handle::{CollectionId, InstanceId, ProxyId};

/// One slot of entity state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    /// Absent value or null association.
    Null,
    /// Plain column value.
    Scalar(Value),
    /// Reference to a materialized entity instance.
    Entity(InstanceId),
    /// Reference to a lazy proxy.
    Proxy(ProxyId),
    /// Association held only by identifier, as hydrated from a row or cache.
    Unresolved { entity_name: String, id: Value },
    /// Persistent collection wrapper.
    Collection(CollectionId),
    /// Embedded component, one value per component property.
    Component(Vec<PropertyValue>),
    /// Lazy property that has not been fetched.
    Unfetched,
}

impl PropertyValue {
    pub const fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null | PropertyValue::Scalar(Value::Null))
    }

    pub const fn is_unfetched(&self) -> bool {
        matches!(self, PropertyValue::Unfetched)
    }

    /// Referenced instance, if this is a direct entity reference.
    pub const fn as_instance(&self) -> Option<InstanceId> {
        match self {
            PropertyValue::Entity(id) => Some(*id),
            _ => None,
        }
    }

    pub const fn as_collection(&self) -> Option<CollectionId> {
        match self {
            PropertyValue::Collection(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            PropertyValue::Scalar(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        PropertyValue::Scalar(v)
    }
}

impl From<InstanceId> for PropertyValue {
    fn from(id: InstanceId) -> Self {
        PropertyValue::Entity(id)
    }
}

impl From<CollectionId> for PropertyValue {
    fn from(id: CollectionId) -> Self {
        PropertyValue::Collection(id)
    }
}

/// Indexed access to the persistent state of an entity instance.
///
/// Indices follow [`crate::EntityMetadata::properties`]. Implementations
/// for hand-written entity structs map each index to a field.
pub trait PropertyAccess: fmt::Debug {
    /// Name of the concrete entity type of this instance.
    fn entity_name(&self) -> &str;

    fn identifier(&self) -> Option<Value>;

    fn set_identifier(&mut self, id: Value);

    fn property_count(&self) -> usize;

    fn property(&self, index: usize) -> PropertyValue;

    fn set_property(&mut self, index: usize, value: PropertyValue);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Read all properties in index order.
    fn property_values(&self) -> Vec<PropertyValue> {
        (0..self.property_count()).map(|i| self.property(i)).collect()
    }

    /// Overwrite all properties in index order.
    fn set_property_values(&mut self, values: &[PropertyValue]) {
        for (i, value) in values.iter().enumerate() {
            self.set_property(i, value.clone());
        }
    }
}

/// Vector-backed entity instance.
///
/// Used for dynamic-map entity mode and by the in-memory metadata provider.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicEntity {
    entity_name: String,
    id: Option<Value>,
    values: Vec<PropertyValue>,
}

impl DynamicEntity {
    /// Create an instance with every property null.
    #[must_use]
    pub fn new(entity_name: impl Into<String>, property_count: usize) -> Self {
        Self {
            entity_name: entity_name.into(),
            id: None,
            values: vec![PropertyValue::Null; property_count],
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_values(mut self, values: Vec<PropertyValue>) -> Self {
        self.values = values;
        self
    }

    pub fn values(&self) -> &[PropertyValue] {
        &self.values
    }
}

impl PropertyAccess for DynamicEntity {
    fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn identifier(&self) -> Option<Value> {
        self.id.clone()
    }

    fn set_identifier(&mut self, id: Value) {
        self.id = Some(id);
    }

    fn property_count(&self) -> usize {
        self.values.len()
    }

    fn property(&self, index: usize) -> PropertyValue {
        self.values
            .get(index)
            .cloned()
            .unwrap_or(PropertyValue::Null)
    }

    fn set_property(&mut self, index: usize, value: PropertyValue) {
        if index >= self.values.len() {
            self.values.resize(index + 1, PropertyValue::Null);
        }
        self.values[index] = value;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
