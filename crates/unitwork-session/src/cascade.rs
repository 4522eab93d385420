//! Propagation of session operations across associations.
//!
//! A [`Cascade`] walks the properties of one parent instance and applies a
//! [`CascadingAction`] to every associated entity whose [`CascadeStyle`]
//! asks for it. Collections are walked element by element, components are
//! recursed into, and orphans of delete-orphan associations are deleted
//! along the way.
//!
//! # Example
//!
//! ```ignore
//! let mut args = CascadeArgs::default();
//! Cascade::new(&Persist, CascadePoint::AfterInsertBeforeDelete)
//!     .cascade(&mut session, "Order", order, &mut args)?;
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use unitwork_core::{
    CascadeKind, CascadePoint, CascadeStyle, CollectionId, EntityMetadata, Error, InstanceId,
    LockMode, PropertyInfo, PropertyType, PropertyValue, Result,
};

use crate::entity_entry::Status;
use crate::proxy::EntityRef;
use crate::session::{ReplicationMode, Session};

// ============================================================================
// Arguments
// ============================================================================

/// State threaded through one cascading operation.
#[derive(Debug, Default)]
pub struct CascadeArgs {
    visited: HashSet<InstanceId>,
    /// Detached instance to managed copy, filled by merge.
    pub(crate) copy_cache: HashMap<InstanceId, InstanceId>,
    pub(crate) lock_mode: LockMode,
    pub(crate) replication_mode: ReplicationMode,
}

impl CascadeArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn lock(lock_mode: LockMode) -> Self {
        Self {
            lock_mode,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn replicate(replication_mode: ReplicationMode) -> Self {
        Self {
            replication_mode,
            ..Self::default()
        }
    }

    /// Record a visit; false if the instance was already seen.
    pub(crate) fn first_visit(&mut self, instance: InstanceId) -> bool {
        self.visited.insert(instance)
    }

    /// Managed copy produced for `detached` by merge, if any.
    pub fn merged_copy(&self, detached: InstanceId) -> Option<InstanceId> {
        self.copy_cache.get(&detached).copied()
    }
}

// ============================================================================
// Cascading actions
// ============================================================================

/// An operation that can be propagated to associated entities.
pub trait CascadingAction: fmt::Debug + Sync {
    fn kind(&self) -> CascadeKind;

    /// Apply the operation to one associated entity.
    fn cascade(
        &self,
        session: &mut Session,
        child: EntityRef,
        entity_name: &str,
        args: &mut CascadeArgs,
    ) -> Result<()>;

    /// Are entities removed from a delete-orphan association deleted?
    fn deletes_orphans(&self) -> bool {
        false
    }

    /// Are unfetched lazy properties fetched so they can be cascaded to?
    fn performs_on_lazy_property(&self) -> bool {
        false
    }

    /// Must non-cascaded properties be checked with [`Self::no_cascade`]?
    fn requires_no_cascade_checking(&self) -> bool {
        false
    }

    /// Called for each property the action does not cascade through, when
    /// [`Self::requires_no_cascade_checking`] holds.
    fn no_cascade(
        &self,
        session: &mut Session,
        child: &PropertyValue,
        parent: InstanceId,
        metadata: &EntityMetadata,
        property_index: usize,
    ) -> Result<()> {
        let _ = (session, child, parent, metadata, property_index);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Persist;

impl CascadingAction for Persist {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Persist
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to persist");
        session.persist_with(entity_name, child, args, self)
    }
}

/// Persist reached while flushing. Rejects references to transient
/// instances that are not cascaded to.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersistOnFlush;

impl CascadingAction for PersistOnFlush {
    fn kind(&self) -> CascadeKind {
        CascadeKind::PersistOnFlush
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to persist on flush");
        session.persist_with(entity_name, child, args, self)
    }

    fn deletes_orphans(&self) -> bool {
        true
    }

    fn requires_no_cascade_checking(&self) -> bool {
        true
    }

    fn no_cascade(
        &self,
        session: &mut Session,
        child: &PropertyValue,
        _parent: InstanceId,
        metadata: &EntityMetadata,
        property_index: usize,
    ) -> Result<()> {
        let Some(property) = metadata.properties.get(property_index) else {
            return Ok(());
        };
        let Some(child_entity_name) = property.property_type.associated_entity_name() else {
            return Ok(());
        };
        // proxies always stand for persistent rows
        let PropertyValue::Entity(child) = child else {
            return Ok(());
        };
        if session.is_in_managed_state(*child) || !session.is_transient(child_entity_name, *child)? {
            return Ok(());
        }
        Err(Error::TransientObject(format!(
            "object references an unsaved transient instance - save the transient instance before flushing: {}.{} -> {}",
            metadata.entity_name, property.name, child_entity_name
        )))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveUpdate;

impl CascadingAction for SaveUpdate {
    fn kind(&self) -> CascadeKind {
        CascadeKind::SaveUpdate
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to save or update");
        session.save_or_update_with(entity_name, child, args)
    }

    fn deletes_orphans(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Merge;

impl CascadingAction for Merge {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Merge
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to merge");
        session.merge_with(entity_name, child, args).map(|_| ())
    }

    fn performs_on_lazy_property(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Delete;

impl CascadingAction for Delete {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Delete
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to delete");
        session.delete_with(entity_name, child, false, args)
    }

    fn deletes_orphans(&self) -> bool {
        true
    }

    fn performs_on_lazy_property(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Lock;

impl CascadingAction for Lock {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Lock
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to lock");
        let lock_mode = args.lock_mode;
        session.lock_with(entity_name, child, lock_mode, args)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Refresh;

impl CascadingAction for Refresh {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Refresh
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to refresh");
        session.refresh_with(child, args)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Replicate;

impl CascadingAction for Replicate {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Replicate
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to replicate");
        let mode = args.replication_mode;
        session.replicate_with(entity_name, child, mode, args)
    }

    fn performs_on_lazy_property(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Evict;

impl CascadingAction for Evict {
    fn kind(&self) -> CascadeKind {
        CascadeKind::Evict
    }

    fn cascade(&self, session: &mut Session, child: EntityRef, entity_name: &str, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "cascading to evict");
        session.evict_with(child, args)
    }
}

// ============================================================================
// Walker
// ============================================================================

/// One cascade pass: an action applied at a point of the parent's
/// lifecycle.
#[derive(Debug, Clone, Copy)]
pub struct Cascade<'a> {
    action: &'a dyn CascadingAction,
    point: CascadePoint,
}

impl<'a> Cascade<'a> {
    #[must_use]
    pub fn new(action: &'a dyn CascadingAction, point: CascadePoint) -> Self {
        Self { action, point }
    }

    /// Cascade the action from `parent` to everything it reaches.
    ///
    /// The context's cascade level is raised for the duration of the walk
    /// and lowered again even if the walk fails.
    #[tracing::instrument(level = "trace", skip(self, session, args), fields(action = %self.action.kind()))]
    pub fn cascade(
        &self,
        session: &mut Session,
        entity_name: &str,
        parent: InstanceId,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        let persister = Arc::clone(session.registry().entity_persister(entity_name)?);
        let metadata = persister.metadata();
        if !metadata.has_cascades() && !self.action.requires_no_cascade_checking() {
            return Ok(());
        }
        tracing::trace!(entity = %entity_name, "processing cascade");

        session.context.increment_cascade_level();
        let result = self.cascade_properties(session, metadata, parent, args);
        session.context.decrement_cascade_level();

        if result.is_ok() {
            tracing::trace!(entity = %entity_name, "done processing cascade");
        }
        result
    }

    fn cascade_properties(
        &self,
        session: &mut Session,
        metadata: &EntityMetadata,
        parent: InstanceId,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        let values = session.context.require_instance(parent)?.property_values();
        let kind = self.action.kind();

        for (index, property) in metadata.properties.iter().enumerate() {
            let value = values.get(index).cloned().unwrap_or(PropertyValue::Null);
            if applies(property, kind) {
                let value = if value.is_unfetched() {
                    if !self.action.performs_on_lazy_property() {
                        tracing::trace!(property = %property.name, "skipping unfetched lazy property");
                        continue;
                    }
                    session.fetch_lazy_property(parent, index)?
                } else {
                    value
                };
                self.cascade_property(session, parent, Some(index), &value, property, args)?;
            } else if self.action.requires_no_cascade_checking() {
                self.action.no_cascade(session, &value, parent, metadata, index)?;
            }
        }
        Ok(())
    }

    /// `index` is the position among the entity's own properties; it is
    /// `None` inside components, where no loaded value is tracked.
    fn cascade_property(
        &self,
        session: &mut Session,
        parent: InstanceId,
        index: Option<usize>,
        child: &PropertyValue,
        property: &PropertyInfo,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        let property_type = &property.property_type;
        match property_type {
            PropertyType::Scalar => Ok(()),
            PropertyType::Component { properties } => {
                self.cascade_component(session, parent, child, properties, args)
            }
            PropertyType::Collection { role } => {
                let Some(collection) = child.as_collection() else {
                    return Ok(());
                };
                if !property_type.foreign_key_direction().cascade_now(self.point) {
                    return Ok(());
                }
                self.cascade_collection(session, parent, collection, role, property.cascade, args)
            }
            PropertyType::ManyToOne { entity_name } | PropertyType::OneToOne { entity_name, .. } => {
                if let Some(target) = EntityRef::from_value(child) {
                    if property_type.foreign_key_direction().cascade_now(self.point) {
                        self.cascade_to_one(session, parent, target, entity_name, property.cascade, args)?;
                    }
                    Ok(())
                } else if child.is_null() && matches!(property_type, PropertyType::OneToOne { .. }) {
                    self.delete_one_to_one_orphan(session, parent, index, property)
                } else {
                    Ok(())
                }
            }
        }
    }

    fn cascade_to_one(
        &self,
        session: &mut Session,
        parent: InstanceId,
        child: EntityRef,
        entity_name: &str,
        style: CascadeStyle,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        if !style.really_does_cascade(self.action.kind()) {
            return Ok(());
        }
        let child_instance = match child {
            EntityRef::Instance(instance) => Some(instance),
            EntityRef::Proxy(_) => None,
        };
        if let Some(instance) = child_instance {
            session.context.add_child_parent(instance, parent);
        }
        let result = self.action.cascade(session, child, entity_name, args);
        if let Some(instance) = child_instance {
            session.context.remove_child_parent(instance);
        }
        result
    }

    fn cascade_component(
        &self,
        session: &mut Session,
        parent: InstanceId,
        child: &PropertyValue,
        properties: &[PropertyInfo],
        args: &mut CascadeArgs,
    ) -> Result<()> {
        let PropertyValue::Component(values) = child else {
            return Ok(());
        };
        let kind = self.action.kind();
        for (index, property) in properties.iter().enumerate() {
            if applies(property, kind) {
                let value = values.get(index).cloned().unwrap_or(PropertyValue::Null);
                self.cascade_property(session, parent, None, &value, property, args)?;
            }
        }
        Ok(())
    }

    fn cascade_collection(
        &self,
        session: &mut Session,
        parent: InstanceId,
        collection: CollectionId,
        role: &str,
        style: CascadeStyle,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        let persister = Arc::clone(session.registry().collection_persister(role)?);
        let metadata = persister.metadata();
        let Some(wrapper) = session.context.collection(collection) else {
            return Ok(());
        };
        // unfetched elements are never cascaded to
        let elements = if wrapper.was_initialized() {
            wrapper.elements().to_vec()
        } else {
            Vec::new()
        };

        let element_point = if self.point == CascadePoint::AfterInsertBeforeDelete {
            CascadePoint::AfterInsertBeforeDeleteViaCollection
        } else {
            self.point
        };
        let elements_cascade = Cascade::new(self.action, element_point);

        if style.really_does_cascade(self.action.kind()) && !elements.is_empty() {
            tracing::trace!(role = %role, count = elements.len(), "cascading to collection elements");
            let element_type = &metadata.element_type;
            match element_type {
                PropertyType::ManyToOne { entity_name } | PropertyType::OneToOne { entity_name, .. } => {
                    if element_type.foreign_key_direction().cascade_now(element_point) {
                        for element in &elements {
                            if let Some(target) = EntityRef::from_value(element) {
                                elements_cascade.cascade_to_one(session, parent, target, entity_name, style, args)?;
                            }
                        }
                    }
                }
                PropertyType::Component { properties } => {
                    for element in &elements {
                        elements_cascade.cascade_component(session, parent, element, properties, args)?;
                    }
                }
                PropertyType::Scalar | PropertyType::Collection { .. } => {}
            }
        }

        let delete_orphans = style.has_orphan_delete()
            && self.action.deletes_orphans()
            && session.context.get_collection_entry(collection).is_some();
        if let (true, Some(entity_name)) = (delete_orphans, metadata.element_entity_name()) {
            self.delete_orphans(session, entity_name, collection)?;
        }
        Ok(())
    }

    /// Delete the elements that left a delete-orphan collection.
    fn delete_orphans(&self, session: &mut Session, entity_name: &str, collection: CollectionId) -> Result<()> {
        let orphans = {
            let Some(wrapper) = session.context.collection(collection) else {
                return Ok(());
            };
            let context = &session.context;
            let identity = |element: &PropertyValue| context.element_identity(element);
            if wrapper.was_initialized() {
                context
                    .get_collection_entry(collection)
                    .map(|entry| entry.orphans(wrapper, identity))
                    .unwrap_or_default()
            } else {
                wrapper.queued_orphans(identity)
            }
        };
        for orphan in orphans {
            if let Some(target) = EntityRef::from_value(&orphan) {
                tracing::trace!(entity = %entity_name, "deleting orphaned entity instance");
                session.delete_with(entity_name, target, true, &mut CascadeArgs::default())?;
            }
        }
        Ok(())
    }

    /// A delete-orphan one-to-one that is now null loses its previous
    /// target.
    fn delete_one_to_one_orphan(
        &self,
        session: &mut Session,
        parent: InstanceId,
        index: Option<usize>,
        property: &PropertyInfo,
    ) -> Result<()> {
        if !(property.cascade.has_orphan_delete() && self.action.deletes_orphans()) {
            return Ok(());
        }
        let Some(index) = index else {
            return Ok(());
        };
        let loaded = match session.context.get_entry(parent) {
            Some(entry) if entry.status != Status::Saving => {
                entry.loaded_value(index).cloned()
            }
            _ => None,
        };
        let Some(target) = loaded.as_ref().and_then(EntityRef::from_value) else {
            return Ok(());
        };
        let Ok(instance) = session.context.unproxy(target) else {
            return Ok(());
        };
        let Some(entity_name) = session.context.get_entry(instance).map(|e| e.entity_name().to_owned()) else {
            return Ok(());
        };
        tracing::trace!(entity = %entity_name, property = %property.name, "deleting orphaned one-to-one target");
        session.delete_with(&entity_name, EntityRef::Instance(instance), true, &mut CascadeArgs::default())
    }
}

/// Does `kind` cascade through this property, or through a property of a
/// component nested in it?
fn applies(property: &PropertyInfo, kind: CascadeKind) -> bool {
    if property.cascade.does_cascade(kind) {
        return true;
    }
    match &property.property_type {
        PropertyType::Component { properties } => properties.iter().any(|p| applies(p, kind)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::{CascadeStyle, ForeignKeyDirection};

    #[test]
    fn test_action_flags() {
        assert!(PersistOnFlush.requires_no_cascade_checking());
        assert!(PersistOnFlush.deletes_orphans());
        assert!(SaveUpdate.deletes_orphans());
        assert!(Delete.deletes_orphans());
        assert!(!Persist.deletes_orphans());
        assert!(!Merge.deletes_orphans());
        assert!(Delete.performs_on_lazy_property());
        assert!(!Evict.performs_on_lazy_property());
        assert!(!Lock.requires_no_cascade_checking());
    }

    #[test]
    fn test_component_cascades_apply_through_parent() {
        let inner = PropertyInfo::many_to_one("country", "Country").cascade(CascadeStyle::of(CascadeKind::Persist));
        let component = PropertyInfo::component("address", vec![PropertyInfo::scalar("street"), inner]);
        assert!(applies(&component, CascadeKind::Persist));
        assert!(!applies(&component, CascadeKind::Delete));

        let owned = PropertyInfo::one_to_one("profile", "Profile", ForeignKeyDirection::ToParent)
            .cascade(CascadeStyle::NONE.with_delete_orphan());
        assert!(applies(&owned, CascadeKind::Delete));
        assert!(!applies(&owned, CascadeKind::Merge));
    }

    #[test]
    fn test_args_track_visits() {
        let mut arena: unitwork_core::Arena<InstanceId, ()> = unitwork_core::Arena::new();
        let a = arena.insert(());
        let mut args = CascadeArgs::lock(LockMode::Read);
        assert_eq!(args.lock_mode, LockMode::Read);
        assert!(args.first_visit(a));
        assert!(!args.first_visit(a));
        assert_eq!(args.merged_copy(a), None);
    }
}
