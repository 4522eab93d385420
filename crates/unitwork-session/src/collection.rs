//! Managed collection wrapper.
//!
//! A [`PersistentCollection`] holds the elements of one collection-valued
//! property. It knows whether it has been initialized from the database,
//! whether it was modified since, and which session (if any) it is attached
//! to. Changes made to an uninitialized wrapper are queued and replayed
//! when it is initialized.

use serde::{Deserialize, Serialize};

use unitwork_core::{CollectionKind, InstanceId, PropertyValue, Value};

/// Change recorded against an uninitialized wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuedOperation {
    Add(PropertyValue),
    Remove(PropertyValue),
}

/// The row an entity-valued element stands for, as far as the session
/// knows.
#[derive(Debug, Clone, PartialEq)]
pub enum ElementIdentity {
    /// Identifier of the row.
    Row(Value),
    /// Being inserted; matched by handle only.
    Saving,
    /// Not associated with the session.
    Unknown,
}

/// Elements of `old` whose row is no longer among `current`.
///
/// A proxy and the instance behind it stand for the same row and match.
/// Elements with no known row fall back to handle comparison.
pub(crate) fn orphans_among(
    old: &[PropertyValue],
    current: &[PropertyValue],
    identity: impl Fn(&PropertyValue) -> ElementIdentity,
) -> Vec<PropertyValue> {
    let mut current_rows = Vec::new();
    let mut current_saving = Vec::new();
    for element in current.iter().filter(|e| !e.is_null()) {
        match identity(element) {
            ElementIdentity::Row(id) => current_rows.push(id),
            ElementIdentity::Saving => current_saving.push(element),
            ElementIdentity::Unknown => {}
        }
    }

    let mut orphans: Vec<PropertyValue> = Vec::new();
    for element in old {
        if element.is_null() || current_saving.contains(&element) || orphans.contains(element) {
            continue;
        }
        let kept = match identity(element) {
            ElementIdentity::Row(id) => current_rows.contains(&id),
            ElementIdentity::Saving | ElementIdentity::Unknown => current.contains(element),
        };
        if !kept {
            orphans.push(element.clone());
        }
    }
    orphans
}

/// Elements of one collection-valued property, plus tracking flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentCollection {
    role: Option<String>,
    kind: CollectionKind,
    owner: Option<InstanceId>,
    key: Option<Value>,
    elements: Vec<PropertyValue>,
    stored_snapshot: Option<Vec<PropertyValue>>,
    initialized: bool,
    dirty: bool,
    #[serde(skip)]
    attached: bool,
    queued_operations: Vec<QueuedOperation>,
}

impl PersistentCollection {
    /// A new collection created by the application.
    #[must_use]
    pub fn new(kind: CollectionKind, elements: Vec<PropertyValue>) -> Self {
        Self {
            role: None,
            kind,
            owner: None,
            key: None,
            elements,
            stored_snapshot: None,
            initialized: true,
            dirty: false,
            attached: false,
            queued_operations: Vec::new(),
        }
    }

    /// A wrapper for a persistent collection whose elements are not loaded.
    #[must_use]
    pub fn uninitialized(role: impl Into<String>, kind: CollectionKind, key: Value) -> Self {
        Self {
            role: Some(role.into()),
            kind,
            owner: None,
            key: Some(key),
            elements: Vec::new(),
            stored_snapshot: None,
            initialized: false,
            dirty: false,
            attached: false,
            queued_operations: Vec::new(),
        }
    }

    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    pub fn kind(&self) -> CollectionKind {
        self.kind
    }

    pub fn owner(&self) -> Option<InstanceId> {
        self.owner
    }

    pub fn set_owner(&mut self, owner: InstanceId) {
        self.owner = Some(owner);
    }

    pub fn key(&self) -> Option<&Value> {
        self.key.as_ref()
    }

    /// Has this wrapper never been associated with a role and key?
    pub fn is_unreferenced(&self) -> bool {
        self.role.is_none()
    }

    pub fn was_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn dirty(&mut self) {
        self.dirty = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Loaded elements. Empty until initialized.
    pub fn elements(&self) -> &[PropertyValue] {
        &self.elements
    }

    /// Mutable access to the loaded elements. Marks the wrapper dirty.
    pub fn elements_mut(&mut self) -> &mut Vec<PropertyValue> {
        self.dirty = true;
        &mut self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn contains(&self, element: &PropertyValue) -> bool {
        self.elements.contains(element)
    }

    pub fn index_of(&self, element: &PropertyValue) -> Option<usize> {
        self.elements.iter().position(|e| e == element)
    }

    /// Add an element, queueing the change if not yet initialized.
    pub fn add(&mut self, element: PropertyValue) {
        if self.initialized {
            if self.kind == CollectionKind::Set && self.elements.contains(&element) {
                return;
            }
            self.elements.push(element);
        } else {
            self.queued_operations.push(QueuedOperation::Add(element));
        }
        self.dirty = true;
    }

    /// Remove one occurrence of an element.
    ///
    /// For an uninitialized wrapper the removal is queued and `true` is
    /// returned.
    pub fn remove(&mut self, element: &PropertyValue) -> bool {
        if !self.initialized {
            self.queued_operations
                .push(QueuedOperation::Remove(element.clone()));
            self.dirty = true;
            return true;
        }
        match self.index_of(element) {
            Some(index) => {
                self.elements.remove(index);
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn has_queued_operations(&self) -> bool {
        !self.queued_operations.is_empty()
    }

    /// Elements removed while uninitialized whose row was not added back.
    pub fn queued_orphans(&self, identity: impl Fn(&PropertyValue) -> ElementIdentity) -> Vec<PropertyValue> {
        let mut removals = Vec::new();
        let mut additions = Vec::new();
        for op in &self.queued_operations {
            match op {
                QueuedOperation::Remove(e) => removals.push(e.clone()),
                QueuedOperation::Add(e) => additions.push(e.clone()),
            }
        }
        orphans_among(&removals, &additions, identity)
    }

    /// Install loaded elements and replay queued operations.
    pub(crate) fn initialize(&mut self, loaded: Vec<PropertyValue>) {
        self.elements = loaded;
        self.initialized = true;
        for op in std::mem::take(&mut self.queued_operations) {
            match op {
                QueuedOperation::Add(e) => {
                    if !(self.kind == CollectionKind::Set && self.elements.contains(&e)) {
                        self.elements.push(e);
                    }
                }
                QueuedOperation::Remove(e) => {
                    if let Some(index) = self.index_of(&e) {
                        self.elements.remove(index);
                    }
                }
            }
        }
    }

    /// Drop every element, snapshot element and queued change for which
    /// `keep` is false.
    pub(crate) fn retain_elements(&mut self, keep: impl Fn(&PropertyValue) -> bool) {
        self.elements.retain(&keep);
        if let Some(snapshot) = &mut self.stored_snapshot {
            snapshot.retain(&keep);
        }
        self.queued_operations.retain(|op| match op {
            QueuedOperation::Add(e) | QueuedOperation::Remove(e) => keep(e),
        });
    }

    pub(crate) fn stored_snapshot(&self) -> Option<&[PropertyValue]> {
        self.stored_snapshot.as_deref()
    }

    pub(crate) fn set_snapshot(
        &mut self,
        key: Option<Value>,
        role: Option<String>,
        snapshot: Option<Vec<PropertyValue>>,
    ) {
        self.key = key;
        self.role = role;
        self.stored_snapshot = snapshot;
    }

    /// Elements compare equal to `snapshot`, in order for indexed kinds.
    pub(crate) fn equals_snapshot(&self, snapshot: &[PropertyValue]) -> bool {
        if self.elements.len() != snapshot.len() {
            return false;
        }
        if self.kind.is_indexed() {
            self.elements.as_slice() == snapshot
        } else {
            let mut remaining = snapshot.to_vec();
            self.elements.iter().all(|e| match remaining.iter().position(|s| s == e) {
                Some(i) => {
                    remaining.swap_remove(i);
                    true
                }
                None => false,
            })
        }
    }

    /// Called once the collection's pending writes have executed.
    pub(crate) fn post_action(&mut self) {
        self.queued_operations.clear();
        self.dirty = false;
    }

    /// Attach to a session. Returns false if already attached.
    pub(crate) fn set_current_session(&mut self) -> bool {
        let was_attached = self.attached;
        self.attached = true;
        !was_attached
    }

    /// Detach from the session. Returns true if it was attached.
    pub(crate) fn unset_session(&mut self) -> bool {
        std::mem::replace(&mut self.attached, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::{Arena, InstanceId};

    fn handles(n: usize) -> Vec<PropertyValue> {
        let mut arena: Arena<InstanceId, ()> = Arena::new();
        (0..n).map(|_| PropertyValue::Entity(arena.insert(()))).collect()
    }

    #[test]
    fn test_add_and_remove_mark_dirty() {
        let e = handles(2);
        let mut c = PersistentCollection::new(CollectionKind::Bag, vec![e[0].clone()]);
        assert!(!c.is_dirty());
        c.add(e[1].clone());
        assert!(c.is_dirty());
        c.clear_dirty();
        assert!(c.remove(&e[0]));
        assert!(!c.remove(&e[0]));
        assert_eq!(c.elements(), &[e[1].clone()]);
    }

    #[test]
    fn test_set_ignores_duplicates() {
        let e = handles(1);
        let mut c = PersistentCollection::new(CollectionKind::Set, vec![e[0].clone()]);
        c.add(e[0].clone());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_queued_operations_replay_on_initialize() {
        let e = handles(3);
        let mut c = PersistentCollection::uninitialized("Order.lines", CollectionKind::Bag, Value::Int(1));
        c.remove(&e[0]);
        c.add(e[2].clone());
        c.remove(&e[1]);
        c.add(e[1].clone());
        assert_eq!(c.queued_orphans(|_| ElementIdentity::Unknown), vec![e[0].clone()]);

        c.initialize(vec![e[0].clone(), e[1].clone()]);
        assert!(c.was_initialized());
        assert!(!c.has_queued_operations());
        assert_eq!(c.elements(), &[e[2].clone(), e[1].clone()]);
    }

    #[test]
    fn test_orphans_match_elements_by_row() {
        let e = handles(3);
        // e[0] and e[1] stand for the same row, e[2] is still being saved
        let identity = |element: &PropertyValue| {
            if *element == e[2] {
                ElementIdentity::Saving
            } else if *element == e[0] || *element == e[1] {
                ElementIdentity::Row(Value::Int(7))
            } else {
                ElementIdentity::Unknown
            }
        };
        assert!(orphans_among(&[e[0].clone()], &[e[1].clone()], identity).is_empty());
        assert_eq!(
            orphans_among(&[e[0].clone(), e[2].clone()], &[e[2].clone()], identity),
            vec![e[0].clone()]
        );
        assert_eq!(orphans_among(&[e[0].clone()], &[], identity), vec![e[0].clone()]);
    }

    #[test]
    fn test_equals_snapshot_respects_kind() {
        let e = handles(2);
        let bag = PersistentCollection::new(CollectionKind::Bag, vec![e[1].clone(), e[0].clone()]);
        assert!(bag.equals_snapshot(&e));
        let list = PersistentCollection::new(CollectionKind::List, vec![e[1].clone(), e[0].clone()]);
        assert!(!list.equals_snapshot(&e));
    }

    #[test]
    fn test_session_attachment() {
        let mut c = PersistentCollection::new(CollectionKind::Bag, Vec::new());
        assert!(c.set_current_session());
        assert!(!c.set_current_session());
        assert!(c.unset_session());
        assert!(!c.is_attached());
    }
}
