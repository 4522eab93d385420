//! Lazy entity proxies.

use serde::{Deserialize, Serialize};

use unitwork_core::{InstanceId, PropertyValue, ProxyId, Value};

/// A reference to an entity, either materialized or through a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Instance(InstanceId),
    Proxy(ProxyId),
}

impl EntityRef {
    /// The entity referenced by a property value, if any.
    pub fn from_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Entity(id) => Some(EntityRef::Instance(*id)),
            PropertyValue::Proxy(id) => Some(EntityRef::Proxy(*id)),
            _ => None,
        }
    }

    pub fn to_value(self) -> PropertyValue {
        match self {
            EntityRef::Instance(id) => PropertyValue::Entity(id),
            EntityRef::Proxy(id) => PropertyValue::Proxy(id),
        }
    }
}

impl From<InstanceId> for EntityRef {
    fn from(id: InstanceId) -> Self {
        EntityRef::Instance(id)
    }
}

impl From<ProxyId> for EntityRef {
    fn from(id: ProxyId) -> Self {
        EntityRef::Proxy(id)
    }
}

/// Stand-in for an entity that has not been loaded.
///
/// The proxy knows its entity name and identifier; once initialized it
/// points at the materialized instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProxy {
    entity_name: String,
    id: Value,
    implementation: Option<InstanceId>,
    read_only: bool,
    #[serde(skip)]
    attached: bool,
}

impl EntityProxy {
    #[must_use]
    pub fn new(entity_name: impl Into<String>, id: Value) -> Self {
        Self {
            entity_name: entity_name.into(),
            id,
            implementation: None,
            read_only: false,
            attached: true,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn implementation(&self) -> Option<InstanceId> {
        self.implementation
    }

    pub fn is_uninitialized(&self) -> bool {
        self.implementation.is_none()
    }

    pub(crate) fn set_implementation(&mut self, instance: InstanceId) {
        self.implementation = Some(instance);
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub(crate) fn set_attached(&mut self, attached: bool) {
        self.attached = attached;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::Arena;

    #[test]
    fn test_proxy_initialization() {
        let mut arena: Arena<InstanceId, ()> = Arena::new();
        let mut proxy = EntityProxy::new("Customer", Value::Int(4));
        assert!(proxy.is_uninitialized());
        assert!(proxy.is_attached());
        let instance = arena.insert(());
        proxy.set_implementation(instance);
        assert_eq!(proxy.implementation(), Some(instance));
    }

    #[test]
    fn test_serialized_proxy_is_detached() {
        let proxy = EntityProxy::new("Customer", Value::Int(4));
        let json = serde_json::to_string(&proxy).unwrap();
        let restored: EntityProxy = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_attached());
        assert_eq!(restored.id(), &Value::Int(4));
    }
}
