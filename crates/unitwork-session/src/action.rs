//! Scheduled writes.
//!
//! An [`Action`] is one pending database operation produced by the session
//! or the flush pass. Actions are queued in the
//! [`ActionQueue`](crate::action_queue::ActionQueue), handed one at a time
//! to a [`Batcher`] when executed, and then update the persistence context
//! to reflect the write.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use unitwork_core::{
    CacheKey, CollectionId, Error, InstanceId, MetadataRegistry, PropertyValue, Result, Value,
};

use crate::persistence_context::PersistenceContext;

/// Insert of a new row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityInsertAction {
    pub instance: InstanceId,
    pub entity_name: String,
    pub id: Value,
    pub state: Vec<PropertyValue>,
    pub version: Option<Value>,
    pub property_spaces: Vec<String>,
    /// The entity has a second-level cache region.
    pub cached: bool,
}

/// Update of changed columns of an existing row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityUpdateAction {
    pub instance: InstanceId,
    pub entity_name: String,
    pub id: Value,
    pub state: Vec<PropertyValue>,
    pub dirty_properties: Vec<usize>,
    pub previous_version: Option<Value>,
    pub next_version: Option<Value>,
    pub property_spaces: Vec<String>,
    pub cached: bool,
}

/// Delete of an existing row.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDeleteAction {
    pub instance: InstanceId,
    pub entity_name: String,
    pub id: Value,
    pub version: Option<Value>,
    pub state: Vec<PropertyValue>,
    /// Scheduled because the entity was removed from a delete-orphan
    /// association.
    pub orphan: bool,
    pub property_spaces: Vec<String>,
    pub cached: bool,
}

/// Write of a collection's rows (recreate, remove or update).
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionAction {
    pub collection: CollectionId,
    pub role: String,
    pub key: Value,
    pub property_spaces: Vec<String>,
}

/// Cache invalidation after a bulk statement touched the given spaces.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkCleanupAction {
    pub spaces: Vec<String>,
    /// Entities whose cache regions are evicted on completion.
    pub affected_entities: Vec<String>,
}

/// A pending write.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Insert(EntityInsertAction),
    Update(EntityUpdateAction),
    Delete(EntityDeleteAction),
    CollectionRecreate(CollectionAction),
    CollectionRemove(CollectionAction),
    CollectionUpdate(CollectionAction),
    CleanupBatch(BulkCleanupAction),
}

impl Action {
    /// Tables affected by the action.
    pub fn property_spaces(&self) -> &[String] {
        match self {
            Action::Insert(a) => &a.property_spaces,
            Action::Update(a) => &a.property_spaces,
            Action::Delete(a) => &a.property_spaces,
            Action::CollectionRecreate(a) | Action::CollectionRemove(a) | Action::CollectionUpdate(a) => {
                &a.property_spaces
            }
            Action::CleanupBatch(a) => &a.spaces,
        }
    }

    /// Does the action hold cache locks that must be released once the
    /// transaction ends?
    pub fn needs_after_transaction_completion(&self) -> bool {
        match self {
            Action::Insert(a) => a.cached,
            Action::Update(a) => a.cached,
            Action::Delete(a) => a.cached,
            Action::CleanupBatch(_) => true,
            Action::CollectionRecreate(_) | Action::CollectionRemove(_) | Action::CollectionUpdate(_) => false,
        }
    }

    /// Short label of the category.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Insert(_) => "insert",
            Action::Update(_) => "update",
            Action::Delete(_) => "delete",
            Action::CollectionRecreate(_) => "collection-recreate",
            Action::CollectionRemove(_) => "collection-remove",
            Action::CollectionUpdate(_) => "collection-update",
            Action::CleanupBatch(_) => "cleanup",
        }
    }

    /// Hand the action to the batcher and record its effect on the context.
    pub(crate) fn execute(&self, context: &mut PersistenceContext, batcher: &mut dyn Batcher) -> Result<()> {
        tracing::trace!(action = %self, "executing action");
        batcher.add(self)?;
        match self {
            Action::Insert(a) => {
                let entry = context
                    .get_entry_mut(a.instance)
                    .ok_or_else(|| Error::assertion(format!("possible nonthreadsafe access to session: {}", self)))?;
                entry.post_insert(&a.state);
                if let Some(version) = &a.version {
                    entry.version = Some(version.clone());
                }
                if a.cached {
                    let root = entry.root_entity_name.clone();
                    context.register_inserted_root_key(root, a.id.clone());
                }
            }
            Action::Update(a) => {
                let entry = context
                    .get_entry_mut(a.instance)
                    .ok_or_else(|| Error::assertion(format!("possible nonthreadsafe access to session: {}", self)))?;
                entry.post_update(&a.state, a.next_version.clone());
            }
            Action::Delete(a) => {
                let mut entry = context
                    .remove_entry(a.instance)
                    .ok_or_else(|| Error::assertion(format!("possible nonthreadsafe access to session: {}", self)))?;
                entry.post_delete();
                let key = entry.entity_key();
                context.remove_proxy(&key);
                context.remove_entity(&key);
                context.nullifiable_entity_keys_mut().remove(&key);
            }
            Action::CollectionRecreate(a) | Action::CollectionRemove(a) | Action::CollectionUpdate(a) => {
                if let Ok((collection, entry)) = context.collection_and_entry_mut(a.collection) {
                    entry.after_action(collection);
                }
            }
            Action::CleanupBatch(_) => {}
        }
        Ok(())
    }

    /// Release cache locks held by the action.
    pub(crate) fn after_transaction_completion(&self, success: bool, registry: &MetadataRegistry) -> Result<()> {
        let release = |entity_name: &str, id: &Value| -> Result<()> {
            let persister = registry.entity_persister(entity_name)?;
            if let Some(region) = persister.cache() {
                region.release(&CacheKey::new(entity_name, id.clone()), success)?;
            }
            Ok(())
        };
        match self {
            Action::Insert(a) if a.cached => release(&a.entity_name, &a.id),
            Action::Update(a) if a.cached => release(&a.entity_name, &a.id),
            Action::Delete(a) if a.cached => release(&a.entity_name, &a.id),
            Action::CleanupBatch(a) => {
                for entity_name in &a.affected_entities {
                    if let Some(region) = registry.entity_persister(entity_name)?.cache() {
                        region.evict_all()?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Insert(a) => write!(f, "insert {}#{}", a.entity_name, a.id),
            Action::Update(a) => write!(f, "update {}#{}", a.entity_name, a.id),
            Action::Delete(a) => write!(f, "delete {}#{}", a.entity_name, a.id),
            Action::CollectionRecreate(a) => write!(f, "collection-recreate {}#{}", a.role, a.key),
            Action::CollectionRemove(a) => write!(f, "collection-remove {}#{}", a.role, a.key),
            Action::CollectionUpdate(a) => write!(f, "collection-update {}#{}", a.role, a.key),
            Action::CleanupBatch(a) => write!(f, "cleanup [{}]", a.spaces.join(", ")),
        }
    }
}

/// Executor of queued writes.
///
/// The queue calls [`Batcher::add`] once per action and
/// [`Batcher::execute_batch`] at every category boundary so accumulated
/// statements can be sent.
pub trait Batcher: fmt::Debug {
    fn add(&mut self, action: &Action) -> Result<()>;

    fn execute_batch(&mut self) -> Result<()>;
}

/// Batcher that only records what it was given.
///
/// Clones share the same log, so a test can keep one handle and give
/// another to the session.
#[derive(Debug, Clone, Default)]
pub struct RecordingBatcher {
    log: Arc<Mutex<BatchLog>>,
}

#[derive(Debug, Default)]
struct BatchLog {
    actions: Vec<Action>,
    /// Length of `actions` at each `execute_batch` call.
    boundaries: Vec<usize>,
}

impl RecordingBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every action added so far, in execution order.
    pub fn actions(&self) -> Vec<Action> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .actions
            .clone()
    }

    /// Display form of every action, in execution order.
    pub fn labels(&self) -> Vec<String> {
        self.actions().iter().map(ToString::to_string).collect()
    }

    /// Actions grouped by `execute_batch` calls; empty batches are skipped.
    pub fn batches(&self) -> Vec<Vec<Action>> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batches = Vec::new();
        let mut start = 0;
        for &end in &log.boundaries {
            if end > start {
                batches.push(log.actions[start..end].to_vec());
            }
            start = end;
        }
        if log.actions.len() > start {
            batches.push(log.actions[start..].to_vec());
        }
        batches
    }

    pub fn clear(&self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.actions.clear();
        log.boundaries.clear();
    }
}

impl Batcher for RecordingBatcher {
    fn add(&mut self, action: &Action) -> Result<()> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .actions
            .push(action.clone());
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<()> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let len = log.actions.len();
        log.boundaries.push(len);
        Ok(())
    }
}
