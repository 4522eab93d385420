//! Per-instance bookkeeping for managed entities.
//!
//! An [`EntityEntry`] records what the persistence context knows about one
//! managed instance: its identity, the state it was loaded with (the
//! snapshot used for dirty checking), its version and lock, and where it
//! is in its lifecycle.

use std::collections::HashSet;
use std::fmt;

use unitwork_core::{EntityMetadata, EntityMode, Error, LockMode, PropertyType, PropertyValue, Result, Value};

use crate::keys::EntityKey;

/// Lifecycle status of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Status {
    /// Hydrated but associations not yet resolved.
    Loading,
    Managed,
    /// Managed without a loaded-state snapshot; never dirty.
    ReadOnly,
    Deleted,
    /// Delete executed.
    Gone,
    /// Insert being scheduled.
    Saving,
}

impl Status {
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Status::Loading => 0,
            Status::Managed => 1,
            Status::ReadOnly => 2,
            Status::Deleted => 3,
            Status::Gone => 4,
            Status::Saving => 5,
        }
    }

    pub(crate) const fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Status::Loading,
            1 => Status::Managed,
            2 => Status::ReadOnly,
            3 => Status::Deleted,
            4 => Status::Gone,
            5 => Status::Saving,
            _ => return None,
        })
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Loading => "LOADING",
            Status::Managed => "MANAGED",
            Status::ReadOnly => "READ_ONLY",
            Status::Deleted => "DELETED",
            Status::Gone => "GONE",
            Status::Saving => "SAVING",
        };
        f.write_str(name)
    }
}

/// Bookkeeping for one managed entity instance.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    pub(crate) status: Status,
    pub(crate) previous_status: Option<Status>,
    pub(crate) loaded_state: Option<Vec<PropertyValue>>,
    pub(crate) deleted_state: Option<Vec<PropertyValue>>,
    pub(crate) id: Value,
    pub(crate) version: Option<Value>,
    pub(crate) lock_mode: LockMode,
    pub(crate) exists_in_database: bool,
    pub(crate) entity_name: String,
    pub(crate) root_entity_name: String,
    pub(crate) entity_mode: EntityMode,
    pub(crate) mutable: bool,
    pub(crate) row_id: Option<Value>,
    pub(crate) being_replicated: bool,
    pub(crate) lazy_properties_unfetched: bool,
}

impl EntityEntry {
    pub(crate) fn new(
        status: Status,
        id: Value,
        metadata: &EntityMetadata,
        entity_mode: EntityMode,
    ) -> Self {
        Self {
            status,
            previous_status: None,
            loaded_state: None,
            deleted_state: None,
            id,
            version: None,
            lock_mode: LockMode::None,
            exists_in_database: false,
            entity_name: metadata.entity_name.clone(),
            root_entity_name: metadata.root_entity_name.clone(),
            entity_mode,
            mutable: metadata.mutable,
            row_id: None,
            being_replicated: false,
            lazy_properties_unfetched: false,
        }
    }

    #[must_use]
    pub(crate) fn with_loaded_state(mut self, state: Option<Vec<PropertyValue>>) -> Self {
        self.loaded_state = if self.status == Status::ReadOnly {
            None
        } else {
            state
        };
        self
    }

    #[must_use]
    pub(crate) fn with_version(mut self, version: Option<Value>) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub(crate) fn with_lock_mode(mut self, lock_mode: LockMode) -> Self {
        self.lock_mode = lock_mode;
        self
    }

    #[must_use]
    pub(crate) fn existing(mut self, exists_in_database: bool) -> Self {
        self.exists_in_database = exists_in_database;
        self
    }

    #[must_use]
    pub(crate) fn with_row_id(mut self, row_id: Option<Value>) -> Self {
        self.row_id = row_id;
        self
    }

    #[must_use]
    pub(crate) fn replicated(mut self, being_replicated: bool) -> Self {
        self.being_replicated = being_replicated;
        self
    }

    #[must_use]
    pub(crate) fn with_lazy_properties_unfetched(mut self, unfetched: bool) -> Self {
        self.lazy_properties_unfetched = unfetched;
        self
    }

    pub fn id(&self) -> &Value {
        &self.id
    }

    pub fn version(&self) -> Option<&Value> {
        self.version.as_ref()
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn root_entity_name(&self) -> &str {
        &self.root_entity_name
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(self.id.clone(), self.root_entity_name.clone(), self.entity_mode)
    }

    pub fn loaded_state(&self) -> Option<&[PropertyValue]> {
        self.loaded_state.as_deref()
    }

    pub fn loaded_value(&self, index: usize) -> Option<&PropertyValue> {
        self.loaded_state.as_ref().and_then(|state| state.get(index))
    }

    pub fn deleted_state(&self) -> Option<&[PropertyValue]> {
        self.deleted_state.as_deref()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn set_lock_mode(&mut self, lock_mode: LockMode) {
        self.lock_mode = lock_mode;
    }

    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    pub fn row_id(&self) -> Option<&Value> {
        self.row_id.as_ref()
    }

    pub fn is_being_replicated(&self) -> bool {
        self.being_replicated
    }

    pub fn has_lazy_properties_unfetched(&self) -> bool {
        self.lazy_properties_unfetched
    }

    pub fn is_loading(&self) -> bool {
        self.status == Status::Loading
    }

    pub fn is_managed(&self) -> bool {
        self.status == Status::Managed
    }

    pub fn is_read_only(&self) -> bool {
        self.status == Status::ReadOnly
    }

    pub fn is_deleted(&self) -> bool {
        self.status == Status::Deleted
    }

    pub fn is_gone(&self) -> bool {
        self.status == Status::Gone
    }

    /// Deleted, or delete already executed.
    pub fn is_removed(&self) -> bool {
        matches!(self.status, Status::Deleted | Status::Gone)
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        if status == Status::ReadOnly {
            self.loaded_state = None;
        }
        if self.status != status {
            self.previous_status = Some(self.status);
            self.status = status;
        }
    }

    /// Can this entity be written through dirty checking?
    pub fn is_modifiable(&self) -> bool {
        self.mutable
            && self.status != Status::ReadOnly
            && !(self.status == Status::Deleted && self.previous_status == Some(Status::ReadOnly))
    }

    /// Does flush need to compare this entity's state?
    pub fn requires_dirty_check(&self) -> bool {
        self.is_modifiable() && self.status == Status::Managed
    }

    /// Should references to this entity be nulled out before it is written?
    pub fn is_nullifiable(&self, early_insert: bool, nullifiable_keys: &HashSet<EntityKey>) -> bool {
        self.status == Status::Saving
            || if early_insert {
                !self.exists_in_database
            } else {
                nullifiable_keys.contains(&self.entity_key())
            }
    }

    /// Property indices whose current value differs from the loaded state.
    ///
    /// Collections are tracked by their own entries and are skipped, as are
    /// non-updatable and unfetched lazy properties.
    pub fn dirty_properties(&self, current: &[PropertyValue], metadata: &EntityMetadata) -> Vec<usize> {
        let Some(loaded) = &self.loaded_state else {
            return Vec::new();
        };
        metadata
            .properties
            .iter()
            .enumerate()
            .filter(|(i, property)| {
                if !property.updatable || matches!(property.property_type, PropertyType::Collection { .. }) {
                    return false;
                }
                match (loaded.get(*i), current.get(*i)) {
                    (_, Some(PropertyValue::Unfetched)) | (Some(PropertyValue::Unfetched), _) => false,
                    (Some(old), Some(new)) => old != new,
                    (None, Some(new)) => !new.is_null(),
                    (Some(old), None) => !old.is_null(),
                    (None, None) => false,
                }
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Record a completed insert.
    pub(crate) fn post_insert(&mut self, inserted_state: &[PropertyValue]) {
        self.exists_in_database = true;
        if self.status == Status::Saving {
            self.set_status(Status::Managed);
        }
        if self.status != Status::ReadOnly {
            self.loaded_state = Some(inserted_state.to_vec());
        }
    }

    /// Record a completed update.
    pub(crate) fn post_update(&mut self, updated_state: &[PropertyValue], next_version: Option<Value>) {
        if self.status != Status::ReadOnly {
            self.loaded_state = Some(updated_state.to_vec());
        }
        if next_version.is_some() {
            self.version = next_version;
        }
        self.lock_mode = LockMode::Write;
    }

    /// Record a completed delete.
    pub(crate) fn post_delete(&mut self) {
        self.set_status(Status::Gone);
        self.exists_in_database = false;
    }

    /// Toggle read-only.
    ///
    /// Going read-only discards the loaded state; going modifiable captures
    /// `current_state` as the new snapshot.
    pub(crate) fn set_read_only(
        &mut self,
        read_only: bool,
        current_state: impl FnOnce() -> Option<Vec<PropertyValue>>,
    ) -> Result<()> {
        if read_only == self.is_read_only() {
            return Ok(());
        }
        if !matches!(self.status, Status::Managed | Status::ReadOnly) {
            return Err(Error::IllegalState(format!(
                "instance was not in a valid state: {} is {}",
                self.entity_key(),
                self.status
            )));
        }
        if read_only {
            self.set_status(Status::ReadOnly);
        } else {
            if !self.mutable {
                return Err(Error::IllegalState(format!(
                    "cannot make an immutable entity modifiable: {}",
                    self.entity_name
                )));
            }
            self.set_status(Status::Managed);
            self.loaded_state = current_state();
        }
        Ok(())
    }
}

impl fmt::Display for EntityEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityEntry[{}#{}]({})", self.entity_name, self.id, self.status)
    }
}
