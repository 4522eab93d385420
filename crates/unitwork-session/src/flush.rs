//! Flushing: turning the state of the persistence context into actions.
//!
//! A flush runs in two halves. The first walks every managed entity and
//! collection and schedules the inserts, updates, deletes and collection
//! writes needed to make the database match; the second sorts and
//! executes the action queue and resets the collection bookkeeping.
//!
//! Order of work:
//!
//! 1. cascade `persist` on flush from every managed entity (this also
//!    deletes orphans)
//! 2. reset per-flush collection flags
//! 3. dirty-check entities, marking the collections they reach
//! 4. dereference collections nothing reached
//! 5. execute the queue
//! 6. re-key the surviving collections

use unitwork_core::{CascadePoint, CollectionId, EntityPersister, Error, InstanceId, PropertyValue, Result, Value};

use crate::action::{Action, CollectionAction, EntityUpdateAction};
use crate::cascade::{self, Cascade, CascadeArgs};
use crate::collection::PersistentCollection;
use crate::collection_entry::CollectionEntry;
use crate::entity_entry::Status;
use crate::session::{Session, collections_in};
use crate::SessionEvent;

impl Session {
    /// Write every pending change through the batcher.
    ///
    /// Fires `BeforeFlush` first (an error aborts the flush) and
    /// `AfterFlush` once the queue has executed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<()> {
        if self.context.is_flushing() {
            return Err(Error::IllegalState("flush during flush".to_owned()));
        }
        self.event_callbacks.fire(SessionEvent::BeforeFlush)?;

        self.flush_everything_to_executions()?;
        self.perform_executions()?;

        self.event_callbacks.fire(SessionEvent::AfterFlush)
    }

    /// Flush only if pending changes touch any of `spaces`.
    ///
    /// Returns whether a flush was executed. When it was not, the actions
    /// computed for the check are discarded again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn auto_flush_if_required(&mut self, spaces: &[String]) -> Result<bool> {
        if self.context.is_flushing() || (self.context.entry_count() == 0 && self.context.collection_entries.is_empty()) {
            return Ok(false);
        }
        let previous_removals = self.action_queue.number_of_collection_removals();
        self.flush_everything_to_executions()?;

        if self.action_queue.are_insertions_or_deletions_queued() || self.action_queue.are_tables_to_be_updated(spaces) {
            tracing::trace!("need to execute flush");
            self.perform_executions()?;
            self.event_callbacks.fire(SessionEvent::AfterFlush)?;
            return Ok(true);
        }
        tracing::trace!("don't need to execute flush");
        self.action_queue.clear_from_flush_needed_check(previous_removals);
        Ok(false)
    }

    fn flush_everything_to_executions(&mut self) -> Result<()> {
        tracing::trace!("flushing session");
        self.prepare_entity_flushes()?;
        self.prepare_collection_flushes()?;

        self.context.set_flushing(true);
        let result = self
            .flush_entities()
            .and_then(|entities| self.flush_collections().map(|collections| (entities, collections)));
        self.context.set_flushing(false);
        let (entities, collections) = result?;

        tracing::info!(
            insertions = self.action_queue.number_of_insertions(),
            updates = self.action_queue.number_of_updates(),
            deletions = self.action_queue.number_of_deletions(),
            entities,
            "flushed entities"
        );
        tracing::info!(
            creations = self.action_queue.number_of_collection_creations(),
            updates = self.action_queue.number_of_collection_updates(),
            removals = self.action_queue.number_of_collection_removals(),
            collections,
            "flushed collections"
        );
        Ok(())
    }

    fn perform_executions(&mut self) -> Result<()> {
        self.context.set_flushing(true);
        self.action_queue.sort_actions();
        let result = self
            .action_queue
            .execute_actions(&mut self.context, self.batcher.as_mut(), self.timestamps.as_deref());
        self.context.set_flushing(false);
        result?;
        self.post_flush()
    }

    // ========================================================================
    // Preparation
    // ========================================================================

    /// Cascade `persist` from every managed entity, so that anything newly
    /// reachable is scheduled for insert before dirty checking starts.
    fn prepare_entity_flushes(&mut self) -> Result<()> {
        tracing::trace!("processing flush-time cascades");
        let managed: Vec<(InstanceId, String)> = self
            .context
            .entries()
            .filter(|(_, entry)| matches!(entry.status, Status::Managed | Status::Saving | Status::ReadOnly))
            .map(|(instance, entry)| (instance, entry.entity_name().to_owned()))
            .collect();

        let mut args = CascadeArgs::new();
        for (instance, entity_name) in managed {
            // an earlier cascade may have deleted or evicted it
            if !self.is_in_managed_state(instance) {
                continue;
            }
            Cascade::new(&cascade::PersistOnFlush, CascadePoint::BeforeFlush).cascade(self, &entity_name, instance, &mut args)?;
        }
        Ok(())
    }

    fn prepare_collection_flushes(&mut self) -> Result<()> {
        tracing::trace!("dirty checking collections");
        let collections: Vec<CollectionId> = self.context.collection_entries.keys().collect();
        for collection in collections {
            let (wrapper, entry) = self.context.collection_and_entry_mut(collection)?;
            entry.pre_flush(wrapper);
        }
        Ok(())
    }

    // ========================================================================
    // Entities
    // ========================================================================

    fn flush_entities(&mut self) -> Result<usize> {
        tracing::trace!("flushing entities and processing referenced collections");
        let instances: Vec<InstanceId> = self.context.entries().map(|(instance, _)| instance).collect();
        let count = instances.len();
        for instance in instances {
            self.flush_entity(instance)?;
        }
        Ok(count)
    }

    fn flush_entity(&mut self, instance: InstanceId) -> Result<()> {
        let Some(entry) = self.context.get_entry(instance) else {
            return Ok(());
        };
        // collections of deleted entities stay unreached and get dereferenced
        if matches!(entry.status, Status::Loading | Status::Gone | Status::Deleted) {
            return Ok(());
        }
        let entity_name = entry.entity_name().to_owned();
        let id = entry.id().clone();
        let has_loaded_state = entry.loaded_state().is_some();
        let requires_dirty_check = entry.requires_dirty_check();

        let persister = self.persister(&entity_name)?;
        let metadata = persister.metadata();
        let mut values = self.context.require_instance(instance)?.property_values();

        if metadata.has_collections() {
            self.wrap_collections(instance, &metadata.properties, &values)?;
            let mut found = Vec::new();
            collections_in(&metadata.properties, &values, &mut found);
            for (role, collection) in found {
                self.process_reachable_collection(instance, &id, &role, collection)?;
            }
        }

        if !requires_dirty_check {
            return Ok(());
        }
        let dirty = if has_loaded_state {
            self.context.require_entry(instance)?.dirty_properties(&values, metadata)
        } else {
            self.dirty_against_database(persister.as_ref(), &id, &values)?
        };
        let collections_dirty = metadata.is_versioned() && self.has_dirty_collections(instance, &values)?;
        if dirty.is_empty() && !collections_dirty {
            return Ok(());
        }

        self.check_nullability(metadata, &values, true)?;

        let entry = self.context.require_entry(instance)?;
        let previous_version = entry.version().cloned();
        let being_replicated = entry.is_being_replicated();
        let next_version = match metadata.version_property {
            Some(_) if being_replicated => metadata.version_of(&values),
            Some(index) => {
                let next = previous_version
                    .as_ref()
                    .and_then(Value::next_version)
                    .unwrap_or_else(Value::initial_version);
                tracing::trace!(entity = %entity_name, version = %next, "incrementing version");
                values[index] = PropertyValue::Scalar(next.clone());
                self.context
                    .require_instance_mut(instance)?
                    .set_property(index, PropertyValue::Scalar(next.clone()));
                Some(next)
            }
            None => None,
        };

        tracing::trace!(entity = %entity_name, id = %id, dirty = ?dirty, "updating entity");
        let update = EntityUpdateAction {
            instance,
            entity_name,
            id,
            state: values,
            dirty_properties: dirty,
            previous_version,
            next_version,
            property_spaces: metadata.property_spaces.clone(),
            cached: self.config().second_level_cache_enabled && persister.cache().is_some(),
        };
        self.action_queue.add_action(Action::Update(update), self.timestamps.as_deref())
    }

    /// Dirty properties of an instance re-attached without a loaded state,
    /// compared against its row. A missing row makes every property dirty.
    fn dirty_against_database(&mut self, persister: &dyn EntityPersister, id: &Value, values: &[PropertyValue]) -> Result<Vec<usize>> {
        let snapshot = self.context.get_database_snapshot(id, persister)?;
        let dirty = persister
            .metadata()
            .properties
            .iter()
            .enumerate()
            .filter(|(_, property)| property.updatable && !property.property_type.is_collection_type())
            .filter(|(index, _)| {
                let current = values.get(*index);
                if current.is_some_and(PropertyValue::is_unfetched) {
                    return false;
                }
                match &snapshot {
                    Some(row) => row.get(*index) != current,
                    None => true,
                }
            })
            .map(|(index, _)| index)
            .collect();
        Ok(dirty)
    }

    /// Does a versioned owner hold a changed collection it owns the rows of?
    fn has_dirty_collections(&self, owner: InstanceId, values: &[PropertyValue]) -> Result<bool> {
        let entity_name = self.context.require_entry(owner)?.entity_name();
        let metadata = self.registry().entity_persister(entity_name)?.metadata();
        let mut found = Vec::new();
        collections_in(&metadata.properties, values, &mut found);
        for (role, collection) in found {
            let inverse = self.registry().collection_persister(&role)?.metadata().inverse;
            let dirty = self.context.collection(collection).is_some_and(PersistentCollection::is_dirty);
            if dirty && !inverse {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn process_reachable_collection(&mut self, owner: InstanceId, id: &Value, role: &str, collection: CollectionId) -> Result<()> {
        if self.context.get_collection_entry(collection).is_none() {
            return Err(Error::IllegalState(format!(
                "Found two representations of same collection: {}",
                role
            )));
        }
        let (wrapper, entry) = self.context.collection_and_entry_mut(collection)?;
        wrapper.set_owner(owner);
        if entry.reached {
            return Err(Error::IllegalState(format!(
                "Found shared references to a collection: {}",
                role
            )));
        }
        entry.reached = true;
        entry.set_current(Some(role.to_owned()), Some(id.clone()));
        tracing::trace!(collection = %collection, role = %role, key = %id, "collection found");
        prepare_collection_for_update(entry, wrapper)
    }

    // ========================================================================
    // Collections
    // ========================================================================

    fn flush_collections(&mut self) -> Result<usize> {
        tracing::trace!("processing unreferenced collections");
        let collections: Vec<CollectionId> = self.context.collection_entries.keys().collect();
        for &collection in &collections {
            let unreached = self
                .context
                .get_collection_entry(collection)
                .is_some_and(|entry| !entry.reached && !entry.ignore);
            if unreached {
                self.process_dereferenced_collection(collection)?;
            }
        }

        tracing::trace!("scheduling collection removes/(re)creates/updates");
        for &collection in &collections {
            let Some(entry) = self.context.get_collection_entry(collection) else {
                continue;
            };
            let mut scheduled = Vec::new();
            if entry.do_recreate {
                let action = self.collection_action(collection, entry.current_role(), entry.current_key())?;
                scheduled.push(Action::CollectionRecreate(action));
            }
            if entry.do_remove {
                let action = self.collection_action(collection, entry.loaded_role(), entry.loaded_key())?;
                scheduled.push(Action::CollectionRemove(action));
            }
            if entry.do_update {
                let action = self.collection_action(collection, entry.loaded_role(), entry.loaded_key())?;
                scheduled.push(Action::CollectionUpdate(action));
            }
            for action in scheduled {
                self.action_queue.add_action(action, self.timestamps.as_deref())?;
            }
        }
        Ok(collections.len())
    }

    fn collection_action(&self, collection: CollectionId, role: Option<&str>, key: Option<&Value>) -> Result<CollectionAction> {
        let (Some(role), Some(key)) = (role, key) else {
            return Err(Error::assertion(format!(
                "collection {} was scheduled without a role and key",
                collection
            )));
        };
        let spaces = self.registry().collection_persister(role)?.metadata().collection_spaces.clone();
        Ok(CollectionAction {
            collection,
            role: role.to_owned(),
            key: key.clone(),
            property_spaces: spaces,
        })
    }

    /// A collection no entity references any more: its rows are removed.
    fn process_dereferenced_collection(&mut self, collection: CollectionId) -> Result<()> {
        let entry = self
            .context
            .get_collection_entry(collection)
            .ok_or_else(|| Error::assertion("dereferenced collection lost its entry"))?;
        if let (Some(role), Some(key)) = (entry.loaded_role(), entry.loaded_key()) {
            tracing::trace!(role = %role, key = %key, "collection dereferenced");
            if self.has_orphan_delete(role)? {
                let metadata = self.registry().collection_persister(role)?.metadata();
                let owner = self.context.get_collection_owner(key, metadata, self.registry())?;
                let owner_managed = owner.is_some_and(|owner| {
                    self.context
                        .get_entry(owner)
                        .is_some_and(|entry| !entry.is_removed())
                });
                if owner_managed {
                    return Err(Error::IllegalState(format!(
                        "A collection with cascade=all-delete-orphan was no longer referenced by the owning entity instance: {}",
                        role
                    )));
                }
            }
        }
        let (wrapper, entry) = self.context.collection_and_entry_mut(collection)?;
        entry.set_current(None, None);
        prepare_collection_for_update(entry, wrapper)
    }

    fn has_orphan_delete(&self, role: &str) -> Result<bool> {
        let collection = self.registry().collection_persister(role)?.metadata();
        let owner = self.registry().entity_persister(&collection.owner_entity_name)?.metadata();
        Ok(owner
            .property_index(collection.property_name())
            .and_then(|index| owner.properties.get(index))
            .is_some_and(|property| property.cascade.has_orphan_delete()))
    }

    // ========================================================================
    // After execution
    // ========================================================================

    /// Re-key the collections that survived the flush and forget the ones
    /// whose rows are gone.
    fn post_flush(&mut self) -> Result<()> {
        tracing::trace!("post flush");
        self.context.collections_by_key.clear();
        let collections: Vec<CollectionId> = self.context.collection_entries.keys().collect();
        for collection in collections {
            let (wrapper, entry) = self.context.collection_and_entry_mut(collection)?;
            entry.post_flush(wrapper)?;
            match (entry.loaded_role.clone(), entry.loaded_key.clone()) {
                (Some(role), Some(key)) => {
                    let collection_key = self.context.collection_key(&role, key);
                    self.context.collections_by_key.insert(collection_key, collection);
                }
                _ => {
                    wrapper.unset_session();
                    self.context.remove_collection_entry(collection);
                }
            }
        }
        Ok(())
    }
}

/// Decide what a collection needs written: a remove and recreate when its
/// owner or role changed, an update when its elements did.
fn prepare_collection_for_update(entry: &mut CollectionEntry, wrapper: &PersistentCollection) -> Result<()> {
    if entry.processed {
        return Err(Error::assertion("collection was processed twice by flush()"));
    }
    entry.processed = true;

    let owner_changed = entry.loaded_role != entry.current_role || entry.loaded_key != entry.current_key;
    if owner_changed {
        if entry.loaded_role.is_some() {
            entry.do_remove = true;
        }
        if entry.current_role.is_some() {
            entry.do_recreate = true;
        }
    } else if wrapper.is_dirty() && entry.loaded_role.is_some() {
        entry.do_update = true;
    }
    Ok(())
}
