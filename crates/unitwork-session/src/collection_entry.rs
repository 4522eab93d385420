//! Per-wrapper bookkeeping for managed collections.

use std::fmt;

use unitwork_core::{CollectionMetadata, Error, PropertyValue, Result, Value};

use crate::collection::{orphans_among, ElementIdentity, PersistentCollection};

/// What the persistence context knows about one collection wrapper.
///
/// The *loaded* role and key describe the row the collection was read from
/// (or last written to); the *current* role and key are recomputed on every
/// flush from the owner that references the wrapper. The flags are scratch
/// state for a single flush.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionEntry {
    pub(crate) snapshot: Option<Vec<PropertyValue>>,
    pub(crate) role: Option<String>,
    pub(crate) loaded_role: Option<String>,
    pub(crate) loaded_key: Option<Value>,
    pub(crate) current_role: Option<String>,
    pub(crate) current_key: Option<Value>,
    pub(crate) reached: bool,
    pub(crate) processed: bool,
    pub(crate) do_update: bool,
    pub(crate) do_remove: bool,
    pub(crate) do_recreate: bool,
    pub(crate) ignore: bool,
}

impl CollectionEntry {
    /// Entry for a wrapper created by the application during this unit of
    /// work. It has no loaded role or key and no snapshot.
    pub(crate) fn for_new(collection: &mut PersistentCollection) -> Self {
        collection.clear_dirty();
        Self::default()
    }

    /// Entry for a persistent collection whose elements are not loaded.
    pub(crate) fn for_uninitialized(metadata: &CollectionMetadata, key: Value) -> Self {
        Self {
            role: Some(metadata.role.clone()),
            loaded_role: Some(metadata.role.clone()),
            loaded_key: Some(key),
            ..Self::default()
        }
    }

    /// Entry for a collection reattached with its elements, snapshotted now.
    pub(crate) fn for_initialized(
        metadata: &CollectionMetadata,
        key: Value,
        collection: &PersistentCollection,
        ignore: bool,
    ) -> Self {
        Self {
            snapshot: Some(collection.elements().to_vec()),
            role: Some(metadata.role.clone()),
            loaded_role: Some(metadata.role.clone()),
            loaded_key: Some(key),
            ignore,
            ..Self::default()
        }
    }

    /// Entry for a detached wrapper, trusting the snapshot it carries.
    pub(crate) fn for_detached(
        collection: &PersistentCollection,
        metadata: &CollectionMetadata,
        key: Value,
    ) -> Self {
        Self {
            snapshot: collection.stored_snapshot().map(<[PropertyValue]>::to_vec),
            role: Some(metadata.role.clone()),
            loaded_role: Some(metadata.role.clone()),
            loaded_key: Some(key),
            ..Self::default()
        }
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn loaded_role(&self) -> Option<&str> {
        self.loaded_role.as_deref()
    }

    pub fn loaded_key(&self) -> Option<&Value> {
        self.loaded_key.as_ref()
    }

    pub fn current_role(&self) -> Option<&str> {
        self.current_role.as_deref()
    }

    pub fn current_key(&self) -> Option<&Value> {
        self.current_key.as_ref()
    }

    pub fn snapshot(&self) -> Option<&[PropertyValue]> {
        self.snapshot.as_deref()
    }

    pub fn is_reached(&self) -> bool {
        self.reached
    }

    pub fn is_processed(&self) -> bool {
        self.processed
    }

    pub fn is_do_update(&self) -> bool {
        self.do_update
    }

    pub fn is_do_remove(&self) -> bool {
        self.do_remove
    }

    pub fn is_do_recreate(&self) -> bool {
        self.do_recreate
    }

    pub fn is_ignore(&self) -> bool {
        self.ignore
    }

    pub(crate) fn set_current(&mut self, role: Option<String>, key: Option<Value>) {
        self.current_role = role;
        self.current_key = key;
    }

    /// Reset the per-flush flags and force the wrapper dirty if its
    /// elements no longer match the snapshot.
    pub(crate) fn pre_flush(&mut self, collection: &mut PersistentCollection) {
        let force_dirty = collection.was_initialized()
            && !collection.is_dirty()
            && self.loaded_role.is_some()
            && self
                .snapshot
                .as_deref()
                .is_some_and(|snapshot| !collection.equals_snapshot(snapshot));
        if force_dirty {
            collection.dirty();
        }
        self.reached = false;
        self.processed = false;
        self.do_update = false;
        self.do_remove = false;
        self.do_recreate = false;
    }

    /// Capture the snapshot of the elements as loaded, before any queued
    /// operation was replayed on them.
    pub(crate) fn post_initialize(&mut self, collection: &mut PersistentCollection, loaded: Vec<PropertyValue>) {
        self.snapshot = Some(loaded);
        collection.set_snapshot(
            self.loaded_key.clone(),
            self.role.clone(),
            self.snapshot.clone(),
        );
    }

    /// Record that the collection's write has executed.
    pub(crate) fn after_action(&mut self, collection: &mut PersistentCollection) {
        self.loaded_key = self.current_key.clone();
        self.loaded_role = self.current_role.clone();
        self.role = self.loaded_role.clone();
        let resnapshot =
            collection.was_initialized() && (self.do_remove || self.do_recreate || self.do_update);
        if resnapshot {
            self.snapshot = self
                .loaded_role
                .as_ref()
                .map(|_| collection.elements().to_vec());
        }
        collection.post_action();
    }

    /// Finish the flush for this entry.
    pub(crate) fn post_flush(&mut self, collection: &mut PersistentCollection) -> Result<()> {
        if self.ignore {
            self.ignore = false;
        } else if !self.processed {
            return Err(Error::assertion(format!(
                "collection [{}] was not processed by flush()",
                collection.role().unwrap_or("<unreferenced>")
            )));
        }
        collection.set_snapshot(
            self.loaded_key.clone(),
            self.role.clone(),
            self.snapshot.clone(),
        );
        Ok(())
    }

    /// Elements present in the snapshot whose row is no longer in the
    /// collection. `identity` resolves an element to its row.
    ///
    /// A collection with no snapshot (never persistent) has no orphans.
    pub fn orphans(
        &self,
        collection: &PersistentCollection,
        identity: impl Fn(&PropertyValue) -> ElementIdentity,
    ) -> Vec<PropertyValue> {
        let Some(snapshot) = &self.snapshot else {
            return Vec::new();
        };
        orphans_among(snapshot, collection.elements(), identity)
    }

    pub fn is_snapshot_empty(&self, collection: &PersistentCollection) -> bool {
        collection.was_initialized() && self.snapshot.as_ref().is_none_or(Vec::is_empty)
    }
}

impl fmt::Display for CollectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionEntry[{}", self.loaded_role.as_deref().unwrap_or("<none>"))?;
        if let Some(key) = &self.loaded_key {
            write!(f, "#{}", key)?;
        }
        write!(f, "->{}", self.current_role.as_deref().unwrap_or("<none>"))?;
        if let Some(key) = &self.current_key {
            write!(f, "#{}", key)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::{Arena, CollectionKind, InstanceId};

    fn handles(n: usize) -> Vec<PropertyValue> {
        let mut arena: Arena<InstanceId, ()> = Arena::new();
        (0..n).map(|_| PropertyValue::Entity(arena.insert(()))).collect()
    }

    fn metadata() -> CollectionMetadata {
        CollectionMetadata::new("Order.lines", "Order").of_entities("Line")
    }

    #[test]
    fn test_orphans_by_handle() {
        let e = handles(3);
        let mut collection = PersistentCollection::new(CollectionKind::Bag, e.clone());
        let entry = CollectionEntry::for_initialized(&metadata(), Value::Int(1), &collection, false);
        collection.remove(&e[1]);
        assert_eq!(entry.orphans(&collection, |_| ElementIdentity::Unknown), vec![e[1].clone()]);
    }

    #[test]
    fn test_new_collection_has_no_orphans() {
        let e = handles(2);
        let mut collection = PersistentCollection::new(CollectionKind::Bag, e.clone());
        let entry = CollectionEntry::for_new(&mut collection);
        collection.remove(&e[0]);
        assert!(entry.orphans(&collection, |_| ElementIdentity::Unknown).is_empty());
    }

    #[test]
    fn test_pre_flush_forces_dirty_on_direct_mutation() {
        let e = handles(2);
        let mut collection = PersistentCollection::new(CollectionKind::Bag, e.clone());
        let mut entry = CollectionEntry::for_initialized(&metadata(), Value::Int(1), &collection, false);
        collection.elements_mut().pop();
        collection.clear_dirty();
        entry.reached = true;
        entry.pre_flush(&mut collection);
        assert!(collection.is_dirty());
        assert!(!entry.is_reached());
    }

    #[test]
    fn test_after_action_moves_current_to_loaded() {
        let e = handles(1);
        let mut collection = PersistentCollection::new(CollectionKind::Bag, e.clone());
        let mut entry = CollectionEntry::for_new(&mut collection);
        entry.set_current(Some("Order.lines".into()), Some(Value::Int(5)));
        entry.do_recreate = true;
        collection.dirty();
        entry.after_action(&mut collection);
        assert_eq!(entry.loaded_key(), Some(&Value::Int(5)));
        assert_eq!(entry.snapshot(), Some(&e[..]));
        assert!(!collection.is_dirty());
    }

    #[test]
    fn test_post_flush_requires_processing() {
        let mut collection = PersistentCollection::new(CollectionKind::Bag, Vec::new());
        let mut entry = CollectionEntry::for_new(&mut collection);
        assert!(entry.post_flush(&mut collection).unwrap_err().is_fatal());
        entry.processed = true;
        entry.post_flush(&mut collection).unwrap();
    }
}
