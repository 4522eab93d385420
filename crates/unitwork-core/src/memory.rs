//! In-memory persisters.
//!
//! A minimal metadata provider backed by hash maps instead of a database.
//! Useful for prototyping mappings and for exercising the engine in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::EntityRegionAccess;
use crate::error::Result;
use crate::lock::LockMode;
use crate::metadata::{CollectionMetadata, CollectionPersister, EntityMetadata, EntityPersister};
use crate::property::{DynamicEntity, PropertyAccess, PropertyValue};
use crate::Value;

/// Entity persister storing rows in a map keyed by identifier.
#[derive(Debug)]
pub struct MemoryEntityPersister {
    metadata: EntityMetadata,
    rows: Mutex<HashMap<Value, Vec<PropertyValue>>>,
    next_id: AtomicI64,
    load_calls: AtomicUsize,
    locks: Mutex<Vec<(Value, LockMode)>>,
    cache: Option<Arc<dyn EntityRegionAccess>>,
}

impl MemoryEntityPersister {
    #[must_use]
    pub fn new(metadata: EntityMetadata) -> Self {
        Self {
            metadata,
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            load_calls: AtomicUsize::new(0),
            locks: Mutex::new(Vec::new()),
            cache: None,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, region: Arc<dyn EntityRegionAccess>) -> Self {
        self.cache = Some(region);
        self
    }

    /// Store a hydrated row.
    pub fn insert_row(&self, id: impl Into<Value>, state: Vec<PropertyValue>) {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.into(), state);
    }

    pub fn remove_row(&self, id: &Value) -> Option<Vec<PropertyValue>> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Number of `load_state` calls so far.
    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    /// Locks acquired through [`EntityPersister::lock`], in order.
    pub fn locks(&self) -> Vec<(Value, LockMode)> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EntityPersister for MemoryEntityPersister {
    fn metadata(&self) -> &EntityMetadata {
        &self.metadata
    }

    fn instantiate(&self, id: Option<&Value>) -> Box<dyn PropertyAccess> {
        let mut entity = DynamicEntity::new(&self.metadata.entity_name, self.metadata.properties.len());
        if let Some(id) = id {
            entity.set_identifier(id.clone());
        }
        Box::new(entity)
    }

    fn load_state(&self, id: &Value) -> Result<Option<Vec<PropertyValue>>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows.get(id).map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, value)| match self.metadata.properties.get(i) {
                    Some(property) if property.lazy => PropertyValue::Unfetched,
                    _ => value.clone(),
                })
                .collect()
        }))
    }

    fn load_lazy_property(&self, id: &Value, index: usize) -> Result<PropertyValue> {
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .get(id)
            .and_then(|row| row.get(index))
            .cloned()
            .unwrap_or(PropertyValue::Null))
    }

    fn generate_identifier(&self) -> Result<Value> {
        Ok(Value::BigInt(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    fn lock(&self, id: &Value, _version: Option<&Value>, mode: LockMode) -> Result<()> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id.clone(), mode));
        Ok(())
    }

    fn cache(&self) -> Option<&dyn EntityRegionAccess> {
        self.cache.as_deref()
    }
}

/// Collection persister storing elements in a map keyed by owner key.
#[derive(Debug)]
pub struct MemoryCollectionPersister {
    metadata: CollectionMetadata,
    elements: Mutex<HashMap<Value, Vec<PropertyValue>>>,
    load_calls: AtomicUsize,
}

impl MemoryCollectionPersister {
    #[must_use]
    pub fn new(metadata: CollectionMetadata) -> Self {
        Self {
            metadata,
            elements: Mutex::new(HashMap::new()),
            load_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_elements(&self, key: impl Into<Value>, elements: Vec<PropertyValue>) {
        self.elements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), elements);
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }
}

impl CollectionPersister for MemoryCollectionPersister {
    fn metadata(&self) -> &CollectionMetadata {
        &self.metadata
    }

    fn load_elements(&self, key: &Value) -> Result<Vec<PropertyValue>> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .elements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PropertyInfo;

    #[test]
    fn test_rows_and_counters() {
        let persister = MemoryEntityPersister::new(
            EntityMetadata::new("Person").property(PropertyInfo::scalar("name")),
        );
        persister.insert_row(1_i64, vec![PropertyValue::Scalar(Value::from("Ada"))]);

        assert!(persister.load_state(&Value::BigInt(1)).unwrap().is_some());
        assert!(persister.load_state(&Value::BigInt(2)).unwrap().is_none());
        assert_eq!(persister.load_calls(), 2);

        let first = persister.generate_identifier().unwrap();
        let second = persister.generate_identifier().unwrap();
        assert_ne!(first, second);

        let instance = persister.instantiate(Some(&Value::BigInt(1)));
        assert_eq!(instance.entity_name(), "Person");
        assert_eq!(instance.property_count(), 1);
    }

    #[test]
    fn test_lazy_properties_are_masked() {
        let persister = MemoryEntityPersister::new(
            EntityMetadata::new("Document")
                .property(PropertyInfo::scalar("title"))
                .property(PropertyInfo::scalar("body").lazy()),
        );
        persister.insert_row(
            7_i64,
            vec![
                PropertyValue::Scalar(Value::from("Notes")),
                PropertyValue::Scalar(Value::from("long text")),
            ],
        );

        let state = persister.load_state(&Value::BigInt(7)).unwrap().unwrap();
        assert_eq!(state[0], PropertyValue::Scalar(Value::from("Notes")));
        assert!(state[1].is_unfetched());
        assert_eq!(
            persister.load_lazy_property(&Value::BigInt(7), 1).unwrap(),
            PropertyValue::Scalar(Value::from("long text"))
        );
    }

    #[test]
    fn test_natural_id_snapshot_default() {
        let persister = MemoryEntityPersister::new(
            EntityMetadata::new("User")
                .property(PropertyInfo::scalar("email"))
                .property(PropertyInfo::scalar("name"))
                .natural_id(&["email"], false),
        );
        persister.insert_row(
            1_i64,
            vec![
                PropertyValue::Scalar(Value::from("a@x.io")),
                PropertyValue::Scalar(Value::from("A")),
            ],
        );
        let snapshot = persister.natural_id_snapshot(&Value::BigInt(1)).unwrap();
        assert_eq!(snapshot, Some(vec![PropertyValue::Scalar(Value::from("a@x.io"))]));
    }

    #[test]
    fn test_collection_elements() {
        let persister = MemoryCollectionPersister::new(CollectionMetadata::new("Order.tags", "Order"));
        persister.set_elements(1_i64, vec![PropertyValue::Scalar(Value::from("x"))]);
        assert_eq!(persister.load_elements(&Value::BigInt(1)).unwrap().len(), 1);
        assert!(persister.load_elements(&Value::BigInt(2)).unwrap().is_empty());
    }
}
