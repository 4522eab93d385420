//! The unit-of-work session.
//!
//! A [`Session`] owns one [`PersistenceContext`] and one [`ActionQueue`].
//! Its event operations (`persist`, `delete`, `merge`, `lock`, ...) change
//! the state of entries and schedule actions, cascading through
//! associations with the [`Cascade`] walker. Nothing is written until
//! [`Session::flush`] executes the queue through the session's
//! [`Batcher`].
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(Arc::new(registry), RecordingBatcher::new());
//!
//! let order = session.instantiate("Order", None)?;
//! session.persist("Order", order)?;
//!
//! let customer = session.get("Customer", 7_i64)?;
//!
//! session.flush()?;
//! session.after_transaction_completion(true)?;
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use unitwork_core::{
    CascadePoint, CollectionId, CollectionKind, CollectionPersister, EntityMetadata, EntityPersister,
    Error, ForeignKeyDirection, InstanceId, LockMode, MetadataRegistry, PropertyAccess, PropertyInfo,
    PropertyType, PropertyValue, ProxyId, Result, UpdateTimestampsCache, Value,
};

use crate::action::{Action, Batcher, BulkCleanupAction, CollectionAction, EntityDeleteAction, EntityInsertAction};
use crate::action_queue::ActionQueue;
use crate::cascade::{self, Cascade, CascadeArgs, CascadingAction};
use crate::collection::PersistentCollection;
use crate::entity_entry::{EntityEntry, Status};
use crate::keys::EntityKey;
use crate::listener::LoadEventListener;
use crate::persistence_context::PersistenceContext;
use crate::proxy::{EntityProxy, EntityRef};
use crate::two_phase_load::{initialize_entity, post_hydrate, resolve_value};
use crate::{SessionConfig, SessionEvent, SessionEventCallbacks};

// ============================================================================
// Modes and states
// ============================================================================

/// How `replicate` treats a row that already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Always insert; a duplicate row is left for the database to reject.
    #[default]
    Exception,
    /// Keep the existing row.
    Ignore,
    /// Overwrite the existing row.
    Overwrite,
    /// Overwrite unless the existing row has a newer version.
    LatestVersion,
}

impl ReplicationMode {
    /// Should a row at version `current` be overwritten by state at `new`?
    pub fn should_overwrite(self, current: Option<&Value>, new: Option<&Value>) -> bool {
        match self {
            ReplicationMode::Exception | ReplicationMode::Overwrite => true,
            ReplicationMode::Ignore => false,
            ReplicationMode::LatestVersion => match (current, new) {
                (Some(current), Some(new)) => current.sort_cmp(new) != Ordering::Greater,
                _ => true,
            },
        }
    }
}

/// Where an instance stands relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Has an entry that is not deleted.
    Persistent,
    /// No row and no entry.
    Transient,
    /// A row exists but the instance has no entry.
    Detached,
    /// Has an entry scheduled for deletion.
    Deleted,
}

/// How the collections of a re-associated instance are attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reattach {
    /// Collections must be unchanged detached wrappers.
    Lock,
    /// As for update, but the loaded state is the current state.
    Delete,
    /// Changed or new collections replace the rows of the old ones.
    Update,
    Replicate { overwrite: bool },
}

fn stale_proxy(proxy: ProxyId) -> Error {
    Error::TransientObject(format!("proxy handle {} is no longer valid", proxy))
}

fn stale_collection(collection: CollectionId) -> Error {
    Error::IllegalState(format!("collection handle {} is no longer valid", collection))
}

// ============================================================================
// Session
// ============================================================================

/// One unit of work.
pub struct Session {
    registry: Arc<MetadataRegistry>,
    config: SessionConfig,
    pub(crate) context: PersistenceContext,
    pub(crate) action_queue: ActionQueue,
    pub(crate) batcher: Box<dyn Batcher>,
    pub(crate) timestamps: Option<Arc<dyn UpdateTimestampsCache>>,
    listeners: Vec<Arc<dyn LoadEventListener>>,
    pub(crate) event_callbacks: SessionEventCallbacks,
    timestamp: i64,
}

impl Session {
    /// Create a session with the default configuration.
    pub fn new(registry: Arc<MetadataRegistry>, batcher: impl Batcher + 'static) -> Self {
        Self::with_config(registry, batcher, SessionConfig::default())
    }

    /// Create a session with custom configuration.
    pub fn with_config(registry: Arc<MetadataRegistry>, batcher: impl Batcher + 'static, config: SessionConfig) -> Self {
        let mut context = PersistenceContext::new(config.entity_mode);
        context.set_default_read_only(config.default_read_only);
        let action_queue = ActionQueue::new()
            .order_inserts(config.order_inserts)
            .order_updates(config.order_updates)
            .query_cache(config.query_cache_enabled);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as i64);
        Self {
            registry,
            config,
            context,
            action_queue,
            batcher: Box::new(batcher),
            timestamps: None,
            listeners: Vec::new(),
            event_callbacks: SessionEventCallbacks::default(),
            timestamp,
        }
    }

    /// Invalidate query spaces through `timestamps` when the query cache is
    /// enabled.
    #[must_use]
    pub fn with_timestamps_cache(mut self, timestamps: Arc<dyn UpdateTimestampsCache>) -> Self {
        self.timestamps = Some(timestamps);
        self
    }

    pub fn add_load_listener(&mut self, listener: Arc<dyn LoadEventListener>) {
        self.listeners.push(listener);
    }

    pub fn registry(&self) -> &MetadataRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session start, in milliseconds since the epoch. Used as the
    /// timestamp of cache puts.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub(crate) fn load_listeners(&self) -> Vec<Arc<dyn LoadEventListener>> {
        self.listeners.clone()
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn persistence_context_mut(&mut self) -> &mut PersistenceContext {
        &mut self.context
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.action_queue
    }

    // ========================================================================
    // Session Events
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_flush.push(Box::new(f));
    }

    /// Register a callback to run once the transaction has completed.
    pub fn on_after_completion(&mut self, f: impl FnMut() -> Result<()> + Send + 'static) {
        self.event_callbacks.after_completion.push(Box::new(f));
    }

    /// Run `process` with the outcome once the transaction completes.
    pub fn register_after_completion(&mut self, process: impl FnMut(bool) + Send + 'static) {
        self.action_queue.register_process(process);
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Create a new, transient instance of `entity_name`.
    pub fn instantiate(&mut self, entity_name: &str, id: Option<Value>) -> Result<InstanceId> {
        let persister = self.persister(entity_name)?;
        Ok(self.context.register_instance(persister.instantiate(id.as_ref())))
    }

    /// Hand an application-built instance to the session's arena. The
    /// instance stays transient.
    pub fn register_instance(&mut self, instance: Box<dyn PropertyAccess>) -> InstanceId {
        self.context.register_instance(instance)
    }

    /// Create a new collection wrapper, not yet associated with any owner.
    pub fn new_collection(&mut self, kind: CollectionKind, elements: Vec<PropertyValue>) -> CollectionId {
        self.context.register_collection(PersistentCollection::new(kind, elements))
    }

    pub(crate) fn persister(&self, entity_name: &str) -> Result<Arc<dyn EntityPersister>> {
        self.registry.entity_persister(entity_name).map(Arc::clone)
    }

    pub(crate) fn collection_persister(&self, role: &str) -> Result<Arc<dyn CollectionPersister>> {
        self.registry.collection_persister(role).map(Arc::clone)
    }

    /// Entity name of `instance`, which must be `declared` or a subclass.
    fn concrete_entity_name(&self, declared: &str, instance: InstanceId) -> Result<String> {
        let actual = match self.context.get_entry(instance) {
            Some(entry) => entry.entity_name(),
            None => self.context.require_instance(instance)?.entity_name(),
        };
        if actual != declared && !self.registry.entity_persister(declared)?.metadata().is_subclass_entity_name(actual) {
            return Err(Error::Mapping(format!("instance of {} is not a {}", actual, declared)));
        }
        Ok(actual.to_owned())
    }

    fn identifier_of(&self, instance: InstanceId) -> Result<Option<Value>> {
        Ok(self.context.require_instance(instance)?.identifier().filter(|id| !id.is_null()))
    }

    // ========================================================================
    // Entity state
    // ========================================================================

    /// Is the instance managed and not on its way out?
    pub(crate) fn is_in_managed_state(&self, instance: InstanceId) -> bool {
        self.context
            .get_entry(instance)
            .is_some_and(|entry| matches!(entry.status, Status::Managed | Status::ReadOnly | Status::Saving))
    }

    /// Does `instance` stand for no row?
    ///
    /// Decided by the entry, then the identifier and version, and as a last
    /// resort by the database snapshot.
    pub(crate) fn is_transient(&mut self, entity_name: &str, instance: InstanceId) -> Result<bool> {
        if self.context.is_entry_for(instance) {
            return Ok(false);
        }
        let persister = self.persister(entity_name)?;
        let Some(id) = self.identifier_of(instance)? else {
            return Ok(true);
        };
        if let Some(index) = persister.metadata().version_property {
            if self.context.require_instance(instance)?.property(index).is_null() {
                return Ok(true);
            }
        }
        Ok(self.context.get_database_snapshot(&id, persister.as_ref())?.is_none())
    }

    pub fn entity_state(&mut self, entity_name: &str, instance: InstanceId) -> Result<EntityState> {
        if let Some(entry) = self.context.get_entry(instance) {
            return Ok(if entry.is_removed() {
                EntityState::Deleted
            } else {
                EntityState::Persistent
            });
        }
        if self.is_transient(entity_name, instance)? {
            Ok(EntityState::Transient)
        } else {
            Ok(EntityState::Detached)
        }
    }

    /// Resolve `target` to an instance, re-attaching and initializing a
    /// proxy if needed.
    pub fn unproxy_and_reassociate(&mut self, target: EntityRef) -> Result<InstanceId> {
        match target {
            EntityRef::Instance(instance) => Ok(instance),
            EntityRef::Proxy(proxy) => {
                self.reassociate_proxy(proxy)?;
                self.initialize_proxy(proxy)
            }
        }
    }

    /// Re-attach `proxy` if it is uninitialized. True if it was.
    fn reassociate_proxy(&mut self, proxy: ProxyId) -> Result<bool> {
        let entity_name = self
            .context
            .proxy(proxy)
            .map(|record| record.entity_name().to_owned())
            .ok_or_else(|| stale_proxy(proxy))?;
        let persister = self.persister(&entity_name)?;
        self.context.reassociate_if_uninitialized_proxy(proxy, persister.metadata())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// The entity with `id`, loaded if not already in the context.
    ///
    /// Returns `None` if there is no such row, or if the instance was
    /// deleted in this session.
    pub fn get(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<Option<InstanceId>> {
        self.load_entity(entity_name, id.into())
    }

    /// A reference to the entity with `id`: a proxy when the entity is
    /// proxyable, otherwise the loaded instance.
    pub fn load(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<EntityRef> {
        let id = id.into();
        self.proxy_or_load(entity_name, id.clone())?
            .ok_or_else(|| Error::ObjectNotFound {
                entity_name: entity_name.to_owned(),
                id,
            })
    }

    /// Resolve an association while loading.
    ///
    /// `eager` and `nullable` (one-to-one) references are loaded straight
    /// away; other references may become proxies. A missing row is an
    /// error unless the reference is nullable.
    pub fn internal_load(&mut self, entity_name: &str, id: Value, eager: bool, nullable: bool) -> Result<Option<EntityRef>> {
        let result = if eager || nullable {
            match self.load_entity(entity_name, id.clone())? {
                Some(instance) => {
                    let persister = self.persister(entity_name)?;
                    let key = self.context.entity_key(id.clone(), persister.metadata());
                    Some(self.context.proxy_for(persister.metadata(), &key, instance)?)
                }
                None => None,
            }
        } else {
            self.proxy_or_load(entity_name, id.clone())?
        };
        if result.is_none() && !nullable {
            return Err(Error::ObjectNotFound {
                entity_name: entity_name.to_owned(),
                id,
            });
        }
        Ok(result)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn load_entity(&mut self, entity_name: &str, id: Value) -> Result<Option<InstanceId>> {
        let persister = self.persister(entity_name)?;
        let key = self.context.entity_key(id.clone(), persister.metadata());
        if let Some(existing) = self.context.get_entity(&key) {
            if self.context.get_entry(existing).is_some_and(EntityEntry::is_removed) {
                tracing::debug!(key = %key, "entity was deleted in this session");
                return Ok(None);
            }
            tracing::trace!(key = %key, "resolved object in session cache");
            return Ok(Some(existing));
        }

        let Some(values) = persister.load_state(&id)? else {
            tracing::debug!(key = %key, "no row for entity");
            return Ok(None);
        };
        let instance = self.context.register_instance(persister.instantiate(Some(&id)));
        let read_only = self.context.is_default_read_only();
        self.materialize(persister.as_ref(), id, values, instance, read_only)?;
        self.initialize_non_lazy_collections()?;
        Ok(Some(instance))
    }

    /// Both load phases for one row, inside a load.
    fn materialize(
        &mut self,
        persister: &dyn EntityPersister,
        id: Value,
        values: Vec<PropertyValue>,
        instance: InstanceId,
        read_only: bool,
    ) -> Result<()> {
        let lazy_properties_unfetched = values.iter().any(PropertyValue::is_unfetched);
        self.context.before_load();
        let result = post_hydrate(self, persister, id, values, None, instance, LockMode::Read, lazy_properties_unfetched)
            .and_then(|()| initialize_entity(self, instance, read_only));
        self.context.after_load();
        result
    }

    fn proxy_or_load(&mut self, entity_name: &str, id: Value) -> Result<Option<EntityRef>> {
        let persister = self.persister(entity_name)?;
        let metadata = persister.metadata();
        if !metadata.has_proxy {
            return Ok(self.load_entity(entity_name, id)?.map(EntityRef::Instance));
        }
        let key = self.context.entity_key(id.clone(), metadata);
        if let Some(proxy) = self.context.get_proxy(&key) {
            tracing::trace!(key = %key, "entity proxy found in session cache");
            return self.context.narrow_proxy(proxy, metadata, &key, None).map(Some);
        }
        if let Some(existing) = self.context.get_entity(&key) {
            if self.context.get_entry(existing).is_some_and(EntityEntry::is_removed) {
                return Ok(None);
            }
            return Ok(Some(EntityRef::Instance(existing)));
        }
        tracing::trace!(key = %key, "creating new proxy for entity");
        let mut proxy = EntityProxy::new(entity_name, id);
        proxy.set_read_only(self.context.is_default_read_only() || !metadata.mutable);
        Ok(Some(EntityRef::Proxy(self.context.add_proxy(key, proxy))))
    }

    /// Load the entity behind `proxy`. An initialized proxy returns its
    /// implementation.
    pub fn initialize_proxy(&mut self, proxy: ProxyId) -> Result<InstanceId> {
        let record = self.context.proxy(proxy).ok_or_else(|| stale_proxy(proxy))?;
        if let Some(instance) = record.implementation() {
            return Ok(instance);
        }
        if !record.is_attached() {
            return Err(Error::IllegalState(format!(
                "could not initialize proxy for {}#{} - no session",
                record.entity_name(),
                record.id()
            )));
        }
        let entity_name = record.entity_name().to_owned();
        let id = record.id().clone();
        tracing::debug!(entity = %entity_name, id = %id, "initializing proxy");
        let instance = self
            .load_entity(&entity_name, id.clone())?
            .ok_or_else(|| Error::ObjectNotFound {
                entity_name: entity_name.clone(),
                id,
            })?;
        if let Some(record) = self.context.proxies.get_mut(proxy) {
            record.set_implementation(instance);
        }
        Ok(instance)
    }

    /// Load the elements of an uninitialized collection.
    ///
    /// The snapshot is taken from the rows as loaded; changes queued while
    /// the wrapper was uninitialized are replayed on top of it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn initialize_collection(&mut self, collection: CollectionId) -> Result<()> {
        let wrapper = self
            .context
            .collection(collection)
            .ok_or_else(|| stale_collection(collection))?;
        if wrapper.was_initialized() {
            return Ok(());
        }
        if !wrapper.is_attached() {
            return Err(Error::IllegalState(
                "failed to lazily initialize a collection - no session".to_owned(),
            ));
        }
        let (role, key) = match self.context.get_collection_entry(collection) {
            Some(entry) => match (entry.loaded_role(), entry.loaded_key()) {
                (Some(role), Some(key)) => (role.to_owned(), key.clone()),
                _ => {
                    return Err(Error::IllegalState(format!(
                        "collection {} is not associated with any row",
                        collection
                    )));
                }
            },
            None => {
                return Err(Error::IllegalState(format!(
                    "collection {} was evicted",
                    collection
                )));
            }
        };

        let persister = self.collection_persister(&role)?;
        tracing::debug!(role = %role, key = %key, "initializing collection");
        let rows = persister.load_elements(&key)?;
        let element_type = &persister.metadata().element_type;

        self.context.before_load();
        let resolved: Result<Vec<PropertyValue>> = rows
            .into_iter()
            .map(|row| resolve_value(self, row, element_type, None, None, &key))
            .collect();
        self.context.after_load();
        let elements = resolved?;

        let (wrapper, entry) = self.context.collection_and_entry_mut(collection)?;
        wrapper.initialize(elements.clone());
        entry.post_initialize(wrapper, elements);
        tracing::trace!(role = %role, count = wrapper.len(), "collection initialized");
        self.initialize_non_lazy_collections()
    }

    /// Initialize every queued non-lazy collection.
    ///
    /// Only the outermost load does anything; nested loads leave the queue
    /// to it.
    pub fn initialize_non_lazy_collections(&mut self) -> Result<()> {
        if !self.context.is_load_finished() {
            return Ok(());
        }
        self.context.before_load();
        let result = self.drain_non_lazy_collections();
        self.context.after_load();
        self.context.clear_null_properties();
        result
    }

    fn drain_non_lazy_collections(&mut self) -> Result<()> {
        while let Some(collection) = self.context.take_next_non_lazy_collection() {
            if self.context.get_collection_entry(collection).is_none() {
                continue;
            }
            self.initialize_collection(collection)?;
        }
        Ok(())
    }

    /// Fetch one unfetched lazy property of a managed instance.
    pub fn fetch_lazy_property(&mut self, instance: InstanceId, index: usize) -> Result<PropertyValue> {
        let entry = self.context.require_entry(instance)?;
        let entity_name = entry.entity_name().to_owned();
        let id = entry.id().clone();
        let persister = self.persister(&entity_name)?;
        let property = persister
            .metadata()
            .properties
            .get(index)
            .ok_or_else(|| Error::assertion(format!("{} has no property at {}", entity_name, index)))?;
        tracing::debug!(entity = %entity_name, property = %property.name, "fetching lazy property");

        let raw = persister.load_lazy_property(&id, index)?;
        self.context.before_load();
        let resolved = resolve_value(self, raw, &property.property_type, Some(instance), Some(index), &id);
        self.context.after_load();
        let value = resolved?;

        let object = self.context.require_instance_mut(instance)?;
        object.set_property(index, value.clone());
        let still_unfetched = object.property_values().iter().any(PropertyValue::is_unfetched);
        if let Some(entry) = self.context.get_entry_mut(instance) {
            if let Some(slot) = entry.loaded_state.as_mut().and_then(|loaded| loaded.get_mut(index)) {
                *slot = value.clone();
            }
            entry.lazy_properties_unfetched = still_unfetched;
        }
        self.initialize_non_lazy_collections()?;
        Ok(value)
    }

    /// Materialize the rows of one query result.
    ///
    /// Every row is hydrated before any is resolved, so rows referencing
    /// each other find their targets already bound. A row whose key is
    /// already bound reuses the existing instance.
    #[tracing::instrument(level = "debug", skip(self, rows), fields(rows = rows.len()))]
    pub fn load_result_set(&mut self, entity_name: &str, rows: Vec<(Value, Vec<PropertyValue>)>) -> Result<Vec<InstanceId>> {
        let persister = self.persister(entity_name)?;
        let read_only = self.context.is_default_read_only();

        self.context.before_load();
        let result = self.hydrate_rows(persister.as_ref(), rows).and_then(|(instances, hydrated)| {
            for instance in hydrated {
                initialize_entity(self, instance, read_only)?;
            }
            Ok(instances)
        });
        self.context.after_load();

        let instances = result?;
        self.initialize_non_lazy_collections()?;
        Ok(instances)
    }

    fn hydrate_rows(
        &mut self,
        persister: &dyn EntityPersister,
        rows: Vec<(Value, Vec<PropertyValue>)>,
    ) -> Result<(Vec<InstanceId>, Vec<InstanceId>)> {
        let mut instances = Vec::with_capacity(rows.len());
        let mut hydrated = Vec::new();
        for (id, values) in rows {
            let key = self.context.entity_key(id.clone(), persister.metadata());
            if let Some(existing) = self.context.get_entity(&key) {
                tracing::trace!(key = %key, "row already bound; reusing instance");
                instances.push(existing);
                continue;
            }
            let instance = self.context.register_instance(persister.instantiate(Some(&id)));
            let lazy_properties_unfetched = values.iter().any(PropertyValue::is_unfetched);
            post_hydrate(self, persister, id, values, None, instance, LockMode::Read, lazy_properties_unfetched)?;
            instances.push(instance);
            hydrated.push(instance);
        }
        Ok((instances, hydrated))
    }

    // ========================================================================
    // Persist and save
    // ========================================================================

    /// Make a transient instance persistent, cascading `persist`.
    pub fn persist(&mut self, entity_name: &str, target: impl Into<EntityRef>) -> Result<()> {
        self.persist_with(entity_name, target.into(), &mut CascadeArgs::new(), &cascade::Persist)
    }

    pub(crate) fn persist_with(
        &mut self,
        entity_name: &str,
        target: EntityRef,
        args: &mut CascadeArgs,
        action: &dyn CascadingAction,
    ) -> Result<()> {
        let instance = match target {
            EntityRef::Instance(instance) => instance,
            EntityRef::Proxy(proxy) => {
                let record = self.context.proxy(proxy).ok_or_else(|| stale_proxy(proxy))?;
                match record.implementation() {
                    Some(instance) => instance,
                    None if record.is_attached() => return Ok(()),
                    None => {
                        return Err(Error::PersistentObject(
                            "uninitialized proxy passed to persist()".to_owned(),
                        ));
                    }
                }
            }
        };
        if !args.first_visit(instance) {
            return Ok(());
        }
        let entity_name = self.concrete_entity_name(entity_name, instance)?;

        match self.entity_state(&entity_name, instance)? {
            EntityState::Persistent => {
                tracing::trace!(entity = %entity_name, "ignoring persistent instance");
                self.cascade_before_save(&entity_name, instance, action, args)?;
                self.cascade_after_save(&entity_name, instance, action, args)
            }
            EntityState::Deleted => {
                let entry = self
                    .context
                    .get_entry_mut(instance)
                    .ok_or_else(|| Error::assertion("deleted instance lost its entry"))?;
                tracing::trace!(key = %entry.entity_key(), "un-scheduling entity deletion");
                entry.deleted_state = None;
                let key = entry.entity_key();
                self.context.set_entry_status(instance, Status::Managed)?;
                self.context.nullifiable_entity_keys_mut().remove(&key);
                self.action_queue.un_schedule_deletion(instance)?;
                self.cascade_before_save(&entity_name, instance, action, args)?;
                self.cascade_after_save(&entity_name, instance, action, args)
            }
            EntityState::Detached => Err(Error::PersistentObject(format!(
                "detached entity passed to persist: {}",
                entity_name
            ))),
            EntityState::Transient => self
                .save_transient(&entity_name, instance, action, args, None, false)
                .map(|_| ()),
        }
    }

    /// Save a transient instance, or re-attach a detached one for update.
    pub fn save_or_update(&mut self, entity_name: &str, target: impl Into<EntityRef>) -> Result<()> {
        self.save_or_update_with(entity_name, target.into(), &mut CascadeArgs::new())
    }

    pub(crate) fn save_or_update_with(&mut self, entity_name: &str, target: EntityRef, args: &mut CascadeArgs) -> Result<()> {
        if let EntityRef::Proxy(proxy) = target {
            if self.reassociate_proxy(proxy)? {
                tracing::trace!("reassociated uninitialized proxy");
                return Ok(());
            }
        }
        let instance = self.unproxy_and_reassociate(target)?;
        let entity_name = self.concrete_entity_name(entity_name, instance)?;

        match self.entity_state(&entity_name, instance)? {
            EntityState::Persistent => {
                tracing::trace!(entity = %entity_name, "ignoring persistent instance");
                Ok(())
            }
            EntityState::Deleted => {
                let key = self.context.require_entry(instance)?.entity_key();
                self.force_flush(&key)?;
                self.save_transient(&entity_name, instance, &cascade::SaveUpdate, args, None, false)
                    .map(|_| ())
            }
            EntityState::Transient => self
                .save_transient(&entity_name, instance, &cascade::SaveUpdate, args, None, false)
                .map(|_| ()),
            EntityState::Detached => {
                tracing::trace!(entity = %entity_name, "updating detached instance");
                self.reassociate(&entity_name, instance, Reattach::Update)?;
                Cascade::new(&cascade::SaveUpdate, CascadePoint::AfterUpdate).cascade(self, &entity_name, instance, args)
            }
        }
    }

    /// Flush so a scheduled deletion executes before its key is reused.
    fn force_flush(&mut self, key: &EntityKey) -> Result<()> {
        if self.context.cascade_level() > 0 {
            return Err(Error::IllegalState(format!(
                "deleted object would be re-saved by cascade (remove deleted object from associations): {}",
                key
            )));
        }
        tracing::debug!(key = %key, "flushing session to complete a scheduled deletion");
        self.flush()
    }

    fn cascade_before_save(
        &mut self,
        entity_name: &str,
        instance: InstanceId,
        action: &dyn CascadingAction,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        Cascade::new(action, CascadePoint::BeforeInsertAfterDelete).cascade(self, entity_name, instance, args)
    }

    fn cascade_after_save(
        &mut self,
        entity_name: &str,
        instance: InstanceId,
        action: &dyn CascadingAction,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        Cascade::new(action, CascadePoint::AfterInsertBeforeDelete).cascade(self, entity_name, instance, args)
    }

    /// Schedule the insert of a transient instance.
    ///
    /// The instance is registered as `Saving` before anything is cascaded,
    /// so cascades that reach it again stop there. The insert state has
    /// references to unsaved instances nulled out; the entry's loaded state
    /// is that insert state, so flush later writes the references.
    fn save_transient(
        &mut self,
        entity_name: &str,
        instance: InstanceId,
        action: &dyn CascadingAction,
        args: &mut CascadeArgs,
        requested_id: Option<Value>,
        replicated: bool,
    ) -> Result<Value> {
        let persister = self.persister(entity_name)?;
        let metadata = persister.metadata();
        let id = match requested_id {
            Some(id) => id,
            None => match self.identifier_of(instance)? {
                Some(id) => id,
                None => persister.generate_identifier()?,
            },
        };
        tracing::debug!(entity = %entity_name, id = %id, "saving transient instance");
        self.context.require_instance_mut(instance)?.set_identifier(id.clone());

        let key = self.context.entity_key(id.clone(), metadata);
        if let Some(old) = self.context.get_entity(&key) {
            let old_deleted = self.context.get_entry(old).is_some_and(EntityEntry::is_deleted);
            if old_deleted && old != instance && !self.context.is_flushing() {
                self.force_flush(&key)?;
            }
        }
        self.context.check_uniqueness(&key, instance)?;

        let entry = EntityEntry::new(Status::Saving, id.clone(), metadata, self.context.entity_mode())
            .with_lock_mode(LockMode::Write)
            .replicated(replicated);
        self.context.add_entity_with_entry(instance, entry)?;

        self.cascade_before_save(entity_name, instance, action, args)?;

        let mut state = self.context.require_instance(instance)?.property_values();
        if let Some(index) = metadata.version_property {
            if seed_version(&mut state, index) {
                tracing::trace!(entity = %entity_name, "seeding version");
                self.context
                    .require_instance_mut(instance)?
                    .set_property(index, state[index].clone());
            }
        }
        if metadata.has_collections() {
            self.wrap_collections(instance, &metadata.properties, &state)?;
        }
        self.nullify_transient_references(&metadata.properties, &mut state)?;
        self.check_nullability(metadata, &state, false)?;

        let version = metadata.version_of(&state);
        let insert = EntityInsertAction {
            instance,
            entity_name: entity_name.to_owned(),
            id: id.clone(),
            state: state.clone(),
            version: version.clone(),
            property_spaces: metadata.property_spaces.clone(),
            cached: self.config.second_level_cache_enabled && persister.cache().is_some(),
        };
        self.action_queue.add_action(Action::Insert(insert), self.timestamps.as_deref())?;

        if let Some(entry) = self.context.get_entry_mut(instance) {
            entry.loaded_state = Some(state);
            entry.version = version;
        }
        let status = if metadata.mutable { Status::Managed } else { Status::ReadOnly };
        self.context.set_entry_status(instance, status)?;

        self.cascade_after_save(entity_name, instance, action, args)?;
        Ok(id)
    }

    /// Register the collections of `owner` that the context does not know
    /// yet: new wrappers as new, detached ones with their snapshot.
    pub(crate) fn wrap_collections(&mut self, owner: InstanceId, properties: &[PropertyInfo], values: &[PropertyValue]) -> Result<()> {
        let mut found = Vec::new();
        collections_in(properties, values, &mut found);
        for (role, collection) in found {
            if self.context.get_collection_entry(collection).is_some() {
                continue;
            }
            let persister = self.collection_persister(&role)?;
            let metadata = persister.metadata();
            let (unreferenced, initialized) = {
                let wrapper = self
                    .context
                    .collection(collection)
                    .ok_or_else(|| stale_collection(collection))?;
                (wrapper.is_unreferenced(), wrapper.was_initialized())
            };
            if unreferenced {
                tracing::trace!(role = %role, "wrapping new collection");
                self.context.add_new_collection(metadata, collection)?;
            } else if initialized {
                self.context.add_initialized_detached_collection(metadata, collection)?;
            } else {
                self.context.add_uninitialized_detached_collection(metadata, collection)?;
            }
            self.context.require_collection_mut(collection)?.set_owner(owner);
        }
        Ok(())
    }

    /// Null out many-to-one references to instances that are not yet
    /// inserted (or are being deleted).
    fn nullify_transient_references(&mut self, properties: &[PropertyInfo], values: &mut [PropertyValue]) -> Result<()> {
        for (property, value) in properties.iter().zip(values.iter_mut()) {
            match &property.property_type {
                PropertyType::ManyToOne { entity_name } => {
                    if self.is_nullifiable(entity_name, value)? {
                        tracing::trace!(property = %property.name, "nullifying reference to an unsaved instance");
                        *value = PropertyValue::Null;
                    }
                }
                PropertyType::Component { properties } => {
                    if let PropertyValue::Component(inner) = value {
                        self.nullify_transient_references(properties, inner)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn is_nullifiable(&mut self, entity_name: &str, value: &PropertyValue) -> Result<bool> {
        let instance = match value {
            PropertyValue::Entity(instance) => *instance,
            PropertyValue::Proxy(proxy) => match self.context.proxy(*proxy).and_then(EntityProxy::implementation) {
                Some(instance) => instance,
                None => return Ok(false),
            },
            _ => return Ok(false),
        };
        match self.context.get_entry(instance) {
            Some(entry) => Ok(entry.is_nullifiable(false, self.context.nullifiable_entity_keys())),
            None => self.is_transient(entity_name, instance),
        }
    }

    /// Reject nulls in non-nullable properties.
    pub(crate) fn check_nullability(&self, metadata: &EntityMetadata, values: &[PropertyValue], is_update: bool) -> Result<()> {
        if !self.config.check_nullability {
            return Ok(());
        }
        check_properties(&metadata.entity_name, &metadata.properties, values, is_update, None)
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Schedule the deletion of an entity, cascading `delete`.
    pub fn delete(&mut self, entity_name: &str, target: impl Into<EntityRef>) -> Result<()> {
        self.delete_with(entity_name, target.into(), false, &mut CascadeArgs::new())
    }

    pub(crate) fn delete_with(&mut self, entity_name: &str, target: EntityRef, orphan: bool, args: &mut CascadeArgs) -> Result<()> {
        let instance = self.unproxy_and_reassociate(target)?;
        let entity_name = self.concrete_entity_name(entity_name, instance)?;

        match self.context.get_entry(instance) {
            None => {
                tracing::trace!(entity = %entity_name, "entity was not persistent in delete processing");
                if self.is_transient(&entity_name, instance)? {
                    return self.delete_transient(&entity_name, instance, args);
                }
                self.reassociate(&entity_name, instance, Reattach::Delete)?;
            }
            Some(entry) if entry.is_removed() => {
                tracing::trace!(key = %entry.entity_key(), "object was already deleted");
                return Ok(());
            }
            Some(_) => tracing::trace!(entity = %entity_name, "deleting a persistent instance"),
        }
        self.delete_entity(&entity_name, instance, orphan, args)
    }

    fn delete_transient(&mut self, entity_name: &str, instance: InstanceId, args: &mut CascadeArgs) -> Result<()> {
        tracing::trace!(entity = %entity_name, "handling transient entity in delete processing");
        if !args.first_visit(instance) {
            tracing::trace!("already handled transient entity; skipping");
            return Ok(());
        }
        Cascade::new(&cascade::Delete, CascadePoint::AfterInsertBeforeDelete).cascade(self, entity_name, instance, args)?;
        Cascade::new(&cascade::Delete, CascadePoint::BeforeInsertAfterDelete).cascade(self, entity_name, instance, args)
    }

    fn delete_entity(&mut self, entity_name: &str, instance: InstanceId, orphan: bool, args: &mut CascadeArgs) -> Result<()> {
        let persister = self.persister(entity_name)?;
        let metadata = persister.metadata();
        let current = self.context.require_instance(instance)?.property_values();
        let entry = self
            .context
            .get_entry_mut(instance)
            .ok_or_else(|| Error::assertion("entity lost its entry during delete"))?;
        let deleted_state = entry.loaded_state.clone().unwrap_or(current);
        entry.deleted_state = Some(deleted_state.clone());
        let id = entry.id.clone();
        let version = entry.version.clone();
        let key = entry.entity_key();
        self.context.set_entry_status(instance, Status::Deleted)?;
        tracing::debug!(key = %key, orphan, "deleting entity");

        // children go first, so they see this deletion
        Cascade::new(&cascade::Delete, CascadePoint::AfterInsertBeforeDelete).cascade(self, entity_name, instance, args)?;

        self.context.nullifiable_entity_keys_mut().insert(key);
        let delete = EntityDeleteAction {
            instance,
            entity_name: entity_name.to_owned(),
            id,
            version,
            state: deleted_state,
            orphan,
            property_spaces: metadata.property_spaces.clone(),
            cached: self.config.second_level_cache_enabled && persister.cache().is_some(),
        };
        self.action_queue.add_action(Action::Delete(delete), self.timestamps.as_deref())?;

        Cascade::new(&cascade::Delete, CascadePoint::BeforeInsertAfterDelete).cascade(self, entity_name, instance, args)
    }

    // ========================================================================
    // Re-association
    // ========================================================================

    /// Give a detached instance an entry again.
    fn reassociate(&mut self, entity_name: &str, instance: InstanceId, mode: Reattach) -> Result<Value> {
        let persister = self.persister(entity_name)?;
        let metadata = persister.metadata();
        let id = self.identifier_of(instance)?.ok_or_else(|| {
            Error::TransientObject(format!(
                "the detached instance passed to the session had a null identifier: {}",
                entity_name
            ))
        })?;
        tracing::trace!(entity = %entity_name, id = %id, "reassociating detached instance");
        let key = self.context.entity_key(id.clone(), metadata);
        self.context.check_uniqueness(&key, instance)?;

        let values = self.context.require_instance(instance)?.property_values();
        let status = if metadata.mutable { Status::Managed } else { Status::ReadOnly };
        let loaded_state = (mode != Reattach::Update).then(|| values.clone());
        let entry = EntityEntry::new(status, id.clone(), metadata, self.context.entity_mode())
            .with_loaded_state(loaded_state)
            .with_version(metadata.version_of(&values))
            .existing(true);
        self.context.add_entity_with_entry(instance, entry)?;
        self.reattach_collections(mode, instance, &id, &metadata.properties, &values)?;
        self.reattach_proxies(&metadata.properties, &values)?;
        Ok(id)
    }

    /// Re-attach the detached, uninitialized proxies held in to-one
    /// properties of a re-attached instance.
    fn reattach_proxies(&mut self, properties: &[PropertyInfo], values: &[PropertyValue]) -> Result<()> {
        for (property, value) in properties.iter().zip(values) {
            match (&property.property_type, value) {
                (PropertyType::ManyToOne { .. } | PropertyType::OneToOne { .. }, PropertyValue::Proxy(proxy)) => {
                    if self.context.proxy(*proxy).is_some_and(|record| !record.is_attached()) {
                        self.reassociate_proxy(*proxy)?;
                    }
                }
                (PropertyType::Component { properties }, PropertyValue::Component(inner)) => {
                    self.reattach_proxies(properties, inner)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn reattach_collections(
        &mut self,
        mode: Reattach,
        owner: InstanceId,
        id: &Value,
        properties: &[PropertyInfo],
        values: &[PropertyValue],
    ) -> Result<()> {
        let mut found = Vec::new();
        collections_in(properties, values, &mut found);
        for (role, collection) in found {
            self.reattach_collection(mode, owner, id, &role, collection)?;
        }
        Ok(())
    }

    fn reattach_collection(
        &mut self,
        mode: Reattach,
        owner: InstanceId,
        id: &Value,
        role: &str,
        collection: CollectionId,
    ) -> Result<()> {
        let persister = self.collection_persister(role)?;
        let metadata = persister.metadata();
        let (unreferenced, initialized, owner_unchanged) = {
            let wrapper = self
                .context
                .collection(collection)
                .ok_or_else(|| stale_collection(collection))?;
            (
                wrapper.is_unreferenced(),
                wrapper.was_initialized(),
                wrapper.role() == Some(role) && wrapper.key() == Some(id),
            )
        };
        let changed = unreferenced || !owner_unchanged;
        if self.context.get_collection_entry(collection).is_some() || (mode == Reattach::Lock && changed) {
            if mode == Reattach::Lock {
                return Err(Error::IllegalState(format!(
                    "reassociated object has dirty collection reference: {}",
                    role
                )));
            }
            return Ok(());
        }

        let remove_rows = match mode {
            Reattach::Lock => false,
            Reattach::Delete | Reattach::Update => changed,
            Reattach::Replicate { overwrite } => overwrite && initialized,
        };
        match mode {
            Reattach::Replicate { .. } if initialized => self.context.add_new_collection(metadata, collection)?,
            _ if changed => self.context.add_new_collection(metadata, collection)?,
            _ if initialized => self.context.add_initialized_detached_collection(metadata, collection)?,
            _ => self.context.add_uninitialized_detached_collection(metadata, collection)?,
        }
        self.context.require_collection_mut(collection)?.set_owner(owner);

        if remove_rows {
            tracing::debug!(role = %role, key = %id, "scheduling removal of the previous collection rows");
            let remove = CollectionAction {
                collection,
                role: role.to_owned(),
                key: id.clone(),
                property_spaces: metadata.collection_spaces.clone(),
            };
            self.action_queue
                .add_action(Action::CollectionRemove(remove), self.timestamps.as_deref())?;
        }
        Ok(())
    }

    // ========================================================================
    // Evict
    // ========================================================================

    /// Detach an instance (or proxy) from the session, cascading `evict`.
    pub fn evict(&mut self, target: impl Into<EntityRef>) -> Result<()> {
        self.evict_with(target.into(), &mut CascadeArgs::new())
    }

    pub(crate) fn evict_with(&mut self, target: EntityRef, args: &mut CascadeArgs) -> Result<()> {
        let instance = match target {
            EntityRef::Instance(instance) => instance,
            EntityRef::Proxy(proxy) => {
                let record = self.context.proxy(proxy).ok_or_else(|| stale_proxy(proxy))?;
                let implementation = record.implementation();
                let entity_name = record.entity_name().to_owned();
                let id = record.id().clone();
                let persister = self.persister(&entity_name)?;
                let key = self.context.entity_key(id, persister.metadata());
                self.context.remove_proxy(&key);
                match implementation {
                    Some(instance) if self.context.is_entry_for(instance) => instance,
                    _ => return Ok(()),
                }
            }
        };
        let Some(entry) = self.context.get_entry(instance) else {
            tracing::trace!(instance = %instance, "instance not associated; nothing to evict");
            return Ok(());
        };
        let entity_name = entry.entity_name().to_owned();
        let key = entry.entity_key();
        tracing::debug!(key = %key, "evicting entity");

        let persister = self.persister(&entity_name)?;
        let metadata = persister.metadata();
        if metadata.has_collections() {
            let values = self.context.require_instance(instance)?.property_values();
            let mut found = Vec::new();
            collections_in(&metadata.properties, &values, &mut found);
            for (_, collection) in found {
                self.evict_collection(collection);
            }
            for index in 0..metadata.properties.len() {
                self.context.remove_collection_holder(instance, index);
            }
        }
        self.context.remove_proxy(&key);
        self.context.remove_entity(&key);
        self.context.remove_entry(instance);

        if !args.first_visit(instance) {
            return Ok(());
        }
        Cascade::new(&cascade::Evict, CascadePoint::AfterEvict).cascade(self, &entity_name, instance, args)
    }

    fn evict_collection(&mut self, collection: CollectionId) {
        let Some(entry) = self.context.remove_collection_entry(collection) else {
            return;
        };
        if let (Some(role), Some(key)) = (entry.loaded_role(), entry.loaded_key()) {
            let key = self.context.collection_key(role, key.clone());
            self.context.collections_by_key.remove(&key);
        }
        if let Some(wrapper) = self.context.collection_mut(collection) {
            wrapper.unset_session();
        }
        tracing::trace!(collection = %collection, "evicted collection");
    }

    // ========================================================================
    // Lock
    // ========================================================================

    /// Re-attach a detached instance and obtain `lock_mode` on it.
    pub fn lock(&mut self, entity_name: &str, target: impl Into<EntityRef>, lock_mode: LockMode) -> Result<()> {
        self.lock_with(entity_name, target.into(), lock_mode, &mut CascadeArgs::lock(lock_mode))
    }

    pub(crate) fn lock_with(&mut self, entity_name: &str, target: EntityRef, lock_mode: LockMode, args: &mut CascadeArgs) -> Result<()> {
        if lock_mode == LockMode::Write {
            return Err(Error::IllegalState("invalid lock mode for lock()".to_owned()));
        }
        if let EntityRef::Proxy(proxy) = target {
            if self.reassociate_proxy(proxy)? {
                return Ok(());
            }
        }
        let instance = self.unproxy_and_reassociate(target)?;
        let entity_name = self.concrete_entity_name(entity_name, instance)?;
        if !self.context.is_entry_for(instance) {
            if self.is_transient(&entity_name, instance)? {
                return Err(Error::TransientObject(format!(
                    "cannot lock an unsaved transient instance: {}",
                    entity_name
                )));
            }
            self.reassociate(&entity_name, instance, Reattach::Lock)?;
            Cascade::new(&cascade::Lock, CascadePoint::AfterLock).cascade(self, &entity_name, instance, args)?;
        }
        self.upgrade_lock(instance, lock_mode)
    }

    fn upgrade_lock(&mut self, instance: InstanceId, requested: LockMode) -> Result<()> {
        let entry = self.context.require_entry(instance)?;
        if !requested.greater_than(entry.lock_mode()) {
            return Ok(());
        }
        if entry.status != Status::Managed {
            return Err(Error::IllegalState(format!(
                "attempted to lock a deleted instance: {}",
                entry.entity_key()
            )));
        }
        let entity_name = entry.entity_name().to_owned();
        let id = entry.id().clone();
        let version = entry.version().cloned();
        let persister = self.persister(&entity_name)?;
        let metadata = persister.metadata();
        tracing::debug!(entity = %entity_name, id = %id, lock_mode = %requested, "locking entity");

        match metadata.version_property {
            Some(index) if requested == LockMode::Force => {
                let next = version
                    .as_ref()
                    .and_then(Value::next_version)
                    .unwrap_or_else(Value::initial_version);
                persister.lock(&id, Some(&next), requested)?;
                self.context
                    .require_instance_mut(instance)?
                    .set_property(index, PropertyValue::Scalar(next.clone()));
                if let Some(entry) = self.context.get_entry_mut(instance) {
                    if let Some(slot) = entry.loaded_state.as_mut().and_then(|loaded| loaded.get_mut(index)) {
                        *slot = PropertyValue::Scalar(next.clone());
                    }
                    entry.version = Some(next);
                }
            }
            _ => persister.lock(&id, version.as_ref(), requested)?,
        }
        if let Some(entry) = self.context.get_entry_mut(instance) {
            entry.set_lock_mode(requested);
        }
        Ok(())
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Re-read an instance's state from the database, cascading `refresh`.
    pub fn refresh(&mut self, target: impl Into<EntityRef>) -> Result<()> {
        self.refresh_with(target.into(), &mut CascadeArgs::new())
    }

    pub(crate) fn refresh_with(&mut self, target: EntityRef, args: &mut CascadeArgs) -> Result<()> {
        if let EntityRef::Proxy(proxy) = target {
            if self.reassociate_proxy(proxy)? {
                return Ok(());
            }
        }
        let instance = self.unproxy_and_reassociate(target)?;
        if !args.first_visit(instance) {
            tracing::trace!(instance = %instance, "already refreshed");
            return Ok(());
        }

        let (entity_name, id, previous_read_only) = match self.context.get_entry(instance) {
            Some(entry) => {
                if !entry.exists_in_database() {
                    return Err(Error::IllegalState(format!(
                        "this instance does not yet exist as a row in the database: {}",
                        entry.entity_key()
                    )));
                }
                (entry.entity_name().to_owned(), entry.id().clone(), Some(entry.is_read_only()))
            }
            None => {
                let entity_name = self.context.require_instance(instance)?.entity_name().to_owned();
                let id = self
                    .identifier_of(instance)?
                    .ok_or_else(|| Error::TransientObject("transient instance passed to refresh".to_owned()))?;
                let persister = self.persister(&entity_name)?;
                let key = self.context.entity_key(id.clone(), persister.metadata());
                if self.context.get_entity(&key).is_some() {
                    return Err(Error::PersistentObject(format!(
                        "attempted to refresh transient instance when persistent instance was already associated with the session: {}",
                        key
                    )));
                }
                (entity_name, id, None)
            }
        };

        Cascade::new(&cascade::Refresh, CascadePoint::BeforeRefresh).cascade(self, &entity_name, instance, args)?;

        let persister = self.persister(&entity_name)?;
        let metadata = persister.metadata();
        if previous_read_only.is_some() {
            let key = self.context.entity_key(id.clone(), metadata);
            if metadata.has_collections() {
                let values = self.context.require_instance(instance)?.property_values();
                let mut found = Vec::new();
                collections_in(&metadata.properties, &values, &mut found);
                for (_, collection) in found {
                    self.evict_collection(collection);
                }
            }
            self.context.remove_entity(&key);
            self.context.remove_entry(instance);
        }

        tracing::debug!(entity = %entity_name, id = %id, "refreshing entity");
        let values = persister.load_state(&id)?.ok_or_else(|| Error::ObjectNotFound {
            entity_name: entity_name.clone(),
            id: id.clone(),
        })?;
        let read_only = previous_read_only.unwrap_or_else(|| self.context.is_default_read_only());
        self.materialize(persister.as_ref(), id, values, instance, read_only)?;
        self.initialize_non_lazy_collections()
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Copy the state of `target` onto the managed instance with the same
    /// identifier, cascading `merge`. Returns the managed instance.
    pub fn merge(&mut self, entity_name: &str, target: impl Into<EntityRef>) -> Result<EntityRef> {
        self.merge_with(entity_name, target.into(), &mut CascadeArgs::new())
    }

    pub(crate) fn merge_with(&mut self, entity_name: &str, target: EntityRef, args: &mut CascadeArgs) -> Result<EntityRef> {
        let entity = match target {
            EntityRef::Instance(instance) => instance,
            EntityRef::Proxy(proxy) => {
                let record = self.context.proxy(proxy).ok_or_else(|| stale_proxy(proxy))?;
                match record.implementation() {
                    Some(instance) => instance,
                    None => {
                        tracing::trace!("ignoring uninitialized proxy");
                        let entity_name = record.entity_name().to_owned();
                        let id = record.id().clone();
                        return self.load(&entity_name, id);
                    }
                }
            }
        };
        if let Some(copy) = args.merged_copy(entity) {
            tracing::trace!("already in merge process");
            return Ok(EntityRef::Instance(copy));
        }
        let entity_name = self.concrete_entity_name(entity_name, entity)?;

        // sharing the key of a managed instance makes it detached
        let mut state = None;
        if !self.context.is_entry_for(entity) {
            if let Some(id) = self.identifier_of(entity)? {
                let persister = self.persister(&entity_name)?;
                let key = self.context.entity_key(id, persister.metadata());
                if self.context.get_entity(&key).is_some_and(|managed| self.context.is_entry_for(managed)) {
                    state = Some(EntityState::Detached);
                }
            }
        }
        let state = match state {
            Some(state) => state,
            None => self.entity_state(&entity_name, entity)?,
        };

        match state {
            EntityState::Persistent => {
                tracing::trace!(entity = %entity_name, "ignoring persistent instance");
                args.copy_cache.insert(entity, entity);
                Cascade::new(&cascade::Merge, CascadePoint::BeforeMerge).cascade(self, &entity_name, entity, args)?;
                self.copy_values(&entity_name, entity, entity, None, args)?;
                Ok(EntityRef::Instance(entity))
            }
            EntityState::Transient => self.merge_transient(&entity_name, entity, args),
            EntityState::Detached => self.merge_detached(&entity_name, entity, args),
            EntityState::Deleted => Err(Error::IllegalState(format!(
                "deleted instance passed to merge: {}",
                entity_name
            ))),
        }
    }

    fn merge_transient(&mut self, entity_name: &str, entity: InstanceId, args: &mut CascadeArgs) -> Result<EntityRef> {
        tracing::trace!(entity = %entity_name, "merging transient instance");
        let id = self.identifier_of(entity)?;
        let copy = self.instantiate(entity_name, id.clone())?;
        args.copy_cache.insert(entity, copy);

        // unsaved children get their copies before anything is copied
        Cascade::new(&cascade::Merge, CascadePoint::BeforeInsertAfterDelete).cascade(self, entity_name, entity, args)?;
        self.copy_values(entity_name, entity, copy, Some(ForeignKeyDirection::FromParent), args)?;
        self.save_transient(entity_name, copy, &cascade::Merge, args, id, false)?;

        Cascade::new(&cascade::Merge, CascadePoint::AfterInsertBeforeDelete).cascade(self, entity_name, entity, args)?;
        self.copy_values(entity_name, entity, copy, Some(ForeignKeyDirection::ToParent), args)?;
        Ok(EntityRef::Instance(copy))
    }

    fn merge_detached(&mut self, entity_name: &str, entity: InstanceId, args: &mut CascadeArgs) -> Result<EntityRef> {
        tracing::trace!(entity = %entity_name, "merging detached instance");
        let id = self
            .identifier_of(entity)?
            .ok_or_else(|| Error::TransientObject(format!("detached instance of {} has no identifier", entity_name)))?;
        let Some(managed) = self.load_entity(entity_name, id.clone())? else {
            tracing::debug!(entity = %entity_name, id = %id, "detached instance not found in the database; merging as transient");
            return self.merge_transient(entity_name, entity, args);
        };
        if managed == entity {
            return Err(Error::assertion("entity was not detached"));
        }
        args.copy_cache.insert(entity, managed);

        let managed_name = self.context.require_entry(managed)?.entity_name().to_owned();
        if managed_name != entity_name {
            return Err(Error::IllegalState(format!(
                "object with id {} was not of the specified subclass {} (loaded object was of class {})",
                id, entity_name, managed_name
            )));
        }
        let persister = self.persister(entity_name)?;
        let metadata = persister.metadata();
        if metadata.is_versioned() {
            let detached_version = metadata.version_of(&self.context.require_instance(entity)?.property_values());
            let managed_version = self.context.require_entry(managed)?.version().cloned();
            if detached_version != managed_version {
                return Err(Error::IllegalState(format!(
                    "row was updated or deleted by another transaction: {}#{}",
                    entity_name, id
                )));
            }
        }

        Cascade::new(&cascade::Merge, CascadePoint::BeforeMerge).cascade(self, entity_name, entity, args)?;
        self.copy_values(entity_name, entity, managed, None, args)?;
        Ok(EntityRef::Instance(managed))
    }

    /// Copy property values from `source` onto `target`, replacing
    /// references with their merged copies. With a direction, only the
    /// associations on that side (and, from the parent side, the plain
    /// values) are copied.
    fn copy_values(
        &mut self,
        entity_name: &str,
        source: InstanceId,
        target: InstanceId,
        direction: Option<ForeignKeyDirection>,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        let persister = self.persister(entity_name)?;
        let original = self.context.require_instance(source)?.property_values();
        let current = self.context.require_instance(target)?.property_values();
        let copied = self.replace_values(&persister.metadata().properties, original, &current, direction, args)?;
        self.context.require_instance_mut(target)?.set_property_values(&copied);
        Ok(())
    }

    fn replace_values(
        &mut self,
        properties: &[PropertyInfo],
        original: Vec<PropertyValue>,
        target: &[PropertyValue],
        direction: Option<ForeignKeyDirection>,
        args: &mut CascadeArgs,
    ) -> Result<Vec<PropertyValue>> {
        let mut original = original.into_iter();
        let mut copied = Vec::with_capacity(properties.len());
        for (index, property) in properties.iter().enumerate() {
            let value = original.next().unwrap_or(PropertyValue::Null);
            let existing = target.get(index).cloned().unwrap_or(PropertyValue::Null);
            copied.push(self.replace_value(&property.property_type, value, existing, direction, args)?);
        }
        Ok(copied)
    }

    fn replace_value(
        &mut self,
        property_type: &PropertyType,
        original: PropertyValue,
        target: PropertyValue,
        direction: Option<ForeignKeyDirection>,
        args: &mut CascadeArgs,
    ) -> Result<PropertyValue> {
        if original.is_unfetched() {
            return Ok(target);
        }
        let included = direction.is_none_or(|d| d == property_type.foreign_key_direction());
        match property_type {
            PropertyType::Scalar => Ok(if included { original } else { target }),
            PropertyType::Component { properties } => match original {
                PropertyValue::Component(values) => {
                    let existing = match &target {
                        PropertyValue::Component(existing) => existing.clone(),
                        _ => Vec::new(),
                    };
                    let replaced = self.replace_values(properties, values, &existing, direction, args)?;
                    Ok(PropertyValue::Component(replaced))
                }
                other => Ok(if included { other } else { target }),
            },
            _ if !included => Ok(target),
            PropertyType::ManyToOne { entity_name } | PropertyType::OneToOne { entity_name, .. } => {
                match EntityRef::from_value(&original) {
                    Some(reference) => self.replace_entity(entity_name, reference, args),
                    None => Ok(original),
                }
            }
            PropertyType::Collection { role } => {
                self.replace_collection(role, original.as_collection(), target.as_collection(), args)
            }
        }
    }

    /// The managed counterpart of a referenced instance.
    fn replace_entity(&mut self, entity_name: &str, original: EntityRef, args: &mut CascadeArgs) -> Result<PropertyValue> {
        let EntityRef::Instance(instance) = original else {
            return Ok(original.to_value());
        };
        if let Some(copy) = args.merged_copy(instance) {
            return Ok(PropertyValue::Entity(copy));
        }
        if self.context.is_entry_for(instance) || self.is_transient(entity_name, instance)? {
            return Ok(PropertyValue::Entity(instance));
        }
        // a detached reference that was not merged resolves to its row
        let Some(id) = self.identifier_of(instance)? else {
            return Ok(PropertyValue::Entity(instance));
        };
        Ok(self
            .internal_load(entity_name, id, false, false)?
            .map_or(PropertyValue::Null, EntityRef::to_value))
    }

    fn replace_collection(
        &mut self,
        role: &str,
        original: Option<CollectionId>,
        target: Option<CollectionId>,
        args: &mut CascadeArgs,
    ) -> Result<PropertyValue> {
        let Some(original) = original else {
            return Ok(PropertyValue::Null);
        };
        let (kind, elements, was_dirty) = {
            let wrapper = self.context.collection(original).ok_or_else(|| stale_collection(original))?;
            if !wrapper.was_initialized() {
                return Ok(target.map_or(PropertyValue::Null, PropertyValue::Collection));
            }
            (wrapper.kind(), wrapper.elements().to_vec(), wrapper.is_dirty())
        };
        let persister = self.collection_persister(role)?;
        let element_type = &persister.metadata().element_type;
        let mut mapped = Vec::with_capacity(elements.len());
        for element in elements {
            mapped.push(self.replace_element(element_type, element, args)?);
        }

        match target {
            Some(target) if target == original => {
                let wrapper = self.context.require_collection_mut(target)?;
                if wrapper.elements() != mapped.as_slice() {
                    *wrapper.elements_mut() = mapped;
                }
                if !was_dirty {
                    wrapper.clear_dirty();
                }
                Ok(PropertyValue::Collection(target))
            }
            Some(target) if self.context.get_collection_entry(target).is_some() => {
                self.initialize_collection(target)?;
                let wrapper = self.context.require_collection_mut(target)?;
                if wrapper.elements() != mapped.as_slice() {
                    *wrapper.elements_mut() = mapped;
                }
                Ok(PropertyValue::Collection(target))
            }
            _ => Ok(PropertyValue::Collection(self.new_collection(kind, mapped))),
        }
    }

    fn replace_element(&mut self, element_type: &PropertyType, element: PropertyValue, args: &mut CascadeArgs) -> Result<PropertyValue> {
        match element_type {
            PropertyType::ManyToOne { entity_name } | PropertyType::OneToOne { entity_name, .. } => {
                match EntityRef::from_value(&element) {
                    Some(reference) => self.replace_entity(entity_name, reference, args),
                    None => Ok(element),
                }
            }
            PropertyType::Component { properties } => match element {
                PropertyValue::Component(values) => {
                    Ok(PropertyValue::Component(self.replace_values(properties, values, &[], None, args)?))
                }
                other => Ok(other),
            },
            PropertyType::Scalar | PropertyType::Collection { .. } => Ok(element),
        }
    }

    // ========================================================================
    // Replicate
    // ========================================================================

    /// Copy a detached instance into this session's database, keeping its
    /// identifier.
    pub fn replicate(&mut self, entity_name: &str, target: impl Into<EntityRef>, mode: ReplicationMode) -> Result<()> {
        self.replicate_with(entity_name, target.into(), mode, &mut CascadeArgs::replicate(mode))
    }

    pub(crate) fn replicate_with(
        &mut self,
        entity_name: &str,
        target: EntityRef,
        mode: ReplicationMode,
        args: &mut CascadeArgs,
    ) -> Result<()> {
        if let EntityRef::Proxy(proxy) = target {
            if self.reassociate_proxy(proxy)? {
                tracing::trace!("uninitialized proxy passed to replicate()");
                return Ok(());
            }
        }
        let instance = self.unproxy_and_reassociate(target)?;
        if self.context.is_entry_for(instance) {
            tracing::trace!("ignoring persistent instance passed to replicate()");
            return Ok(());
        }
        let entity_name = self.concrete_entity_name(entity_name, instance)?;
        let persister = self.persister(&entity_name)?;
        let metadata = persister.metadata();
        let id = self
            .identifier_of(instance)?
            .ok_or_else(|| Error::TransientObject("instance with null id passed to replicate()".to_owned()))?;

        let existing = if mode == ReplicationMode::Exception {
            None
        } else {
            persister.load_state(&id)?
        };
        let Some(row) = existing else {
            tracing::debug!(entity = %entity_name, id = %id, "no existing row, replicating new instance");
            return self
                .save_transient(&entity_name, instance, &cascade::Replicate, args, Some(id), true)
                .map(|_| ());
        };

        let values = self.context.require_instance(instance)?.property_values();
        let current_version = metadata.version_of(&row);
        if !mode.should_overwrite(current_version.as_ref(), metadata.version_of(&values).as_ref()) {
            tracing::trace!(entity = %entity_name, id = %id, "no need to replicate");
            return Ok(());
        }
        tracing::debug!(entity = %entity_name, id = %id, mode = ?mode, "replicating changes");

        let key = self.context.entity_key(id.clone(), metadata);
        self.context.check_uniqueness(&key, instance)?;
        let status = if metadata.mutable { Status::Managed } else { Status::ReadOnly };
        let entry = EntityEntry::new(status, id.clone(), metadata, self.context.entity_mode())
            .with_version(current_version)
            .existing(true)
            .replicated(true);
        self.context.add_entity_with_entry(instance, entry)?;
        let overwrite = mode == ReplicationMode::Overwrite;
        self.reattach_collections(Reattach::Replicate { overwrite }, instance, &id, &metadata.properties, &values)?;
        self.reattach_proxies(&metadata.properties, &values)?;

        Cascade::new(&cascade::Replicate, CascadePoint::AfterUpdate).cascade(self, &entity_name, instance, args)
    }

    // ========================================================================
    // Read-only, dirty checking and membership
    // ========================================================================

    pub fn is_default_read_only(&self) -> bool {
        self.context.is_default_read_only()
    }

    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.context.set_default_read_only(read_only);
    }

    pub fn is_read_only(&self, target: impl Into<EntityRef>) -> Result<bool> {
        self.context.is_read_only(target.into())
    }

    /// Make an entity or proxy read-only, or modifiable again.
    pub fn set_read_only(&mut self, target: impl Into<EntityRef>, read_only: bool) -> Result<()> {
        self.context.set_read_only(target.into(), read_only, &self.registry)
    }

    /// Has a managed instance changed since it was loaded?
    pub fn is_dirty(&self, instance: InstanceId) -> Result<bool> {
        self.context.is_dirty(instance, &self.registry)
    }

    /// Is `target` managed by this session and not deleted?
    pub fn contains(&self, target: impl Into<EntityRef>) -> bool {
        match target.into() {
            EntityRef::Proxy(proxy) => self.context.contains_proxy(proxy),
            EntityRef::Instance(instance) => self
                .context
                .get_entry(instance)
                .is_some_and(|entry| !entry.is_removed()),
        }
    }

    /// Detach everything and drop every pending action.
    pub fn clear(&mut self) {
        self.action_queue.clear();
        self.context.clear();
        tracing::debug!("session cleared");
    }

    // ========================================================================
    // Transaction completion
    // ========================================================================

    /// Record a bulk statement over `spaces` so that caches of the
    /// affected entities are invalidated at completion.
    pub fn add_bulk_cleanup(&mut self, spaces: Vec<String>, affected_entities: Vec<String>) -> Result<()> {
        let action = BulkCleanupAction {
            spaces,
            affected_entities,
        };
        self.action_queue.add_cleanup_action(action, self.timestamps.as_deref())
    }

    /// Release cache locks, run completion callbacks and forget
    /// per-transaction state.
    ///
    /// The persistence context is reset even if releasing locks fails.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn after_transaction_completion(&mut self, success: bool) -> Result<()> {
        let released = self
            .action_queue
            .after_transaction_completion(success, &self.registry, self.timestamps.as_deref());
        self.context.after_transaction_completion();
        released?;
        self.event_callbacks.fire(SessionEvent::AfterCompletion)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("context", &self.context)
            .field("action_queue", &self.action_queue)
            .field("batcher", &self.batcher)
            .field("listeners", &self.listeners.len())
            .field("event_callbacks", &self.event_callbacks)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Every collection held by `values`, with its role, components included.
pub(crate) fn collections_in(properties: &[PropertyInfo], values: &[PropertyValue], out: &mut Vec<(String, CollectionId)>) {
    for (property, value) in properties.iter().zip(values) {
        match (&property.property_type, value) {
            (PropertyType::Collection { role }, PropertyValue::Collection(collection)) => {
                out.push((role.clone(), *collection));
            }
            (PropertyType::Component { properties }, PropertyValue::Component(inner)) => {
                collections_in(properties, inner, out);
            }
            _ => {}
        }
    }
}

/// Give a null or negative version its initial value. True if it changed.
fn seed_version(state: &mut [PropertyValue], index: usize) -> bool {
    let Some(slot) = state.get_mut(index) else {
        return false;
    };
    let unsaved = match slot.as_scalar() {
        None => true,
        Some(version) => version.is_null() || version.as_i64().is_some_and(|v| v < 0),
    };
    if unsaved {
        *slot = PropertyValue::Scalar(Value::initial_version());
    }
    unsaved
}

fn check_properties(
    entity_name: &str,
    properties: &[PropertyInfo],
    values: &[PropertyValue],
    is_update: bool,
    path: Option<&str>,
) -> Result<()> {
    for (index, property) in properties.iter().enumerate() {
        if is_update && !property.updatable {
            continue;
        }
        let qualified = match path {
            Some(path) => format!("{}.{}", path, property.name),
            None => property.name.clone(),
        };
        let value = values.get(index).unwrap_or(&PropertyValue::Null);
        if !property.nullable && value.is_null() {
            return Err(Error::PropertyValue {
                entity_name: entity_name.to_owned(),
                property: qualified,
                message: "not-null property references a null or transient value".to_owned(),
            });
        }
        if let (PropertyType::Component { properties }, PropertyValue::Component(inner)) = (&property.property_type, value) {
            check_properties(entity_name, properties, inner, is_update, Some(&qualified))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_version_overwrites_older_rows_only() {
        let mode = ReplicationMode::LatestVersion;
        assert!(mode.should_overwrite(Some(&Value::Int(1)), Some(&Value::Int(2))));
        assert!(mode.should_overwrite(Some(&Value::Int(2)), Some(&Value::Int(2))));
        assert!(!mode.should_overwrite(Some(&Value::Int(3)), Some(&Value::Int(2))));
        assert!(mode.should_overwrite(None, None));
        assert!(!ReplicationMode::Ignore.should_overwrite(None, None));
        assert!(ReplicationMode::Overwrite.should_overwrite(Some(&Value::Int(9)), Some(&Value::Int(1))));
    }

    #[test]
    fn test_seed_version() {
        let mut state = vec![PropertyValue::Null, PropertyValue::Scalar(Value::Int(-1)), PropertyValue::Scalar(Value::Int(4))];
        assert!(seed_version(&mut state, 0));
        assert!(seed_version(&mut state, 1));
        assert!(!seed_version(&mut state, 2));
        assert!(!seed_version(&mut state, 7));
        assert_eq!(state[0], PropertyValue::Scalar(Value::initial_version()));
        assert_eq!(state[1], PropertyValue::Scalar(Value::initial_version()));
        assert_eq!(state[2], PropertyValue::Scalar(Value::Int(4)));
    }

    #[test]
    fn test_nullability_names_the_nested_property() {
        let properties = vec![
            PropertyInfo::scalar("name"),
            PropertyInfo::component("address", vec![PropertyInfo::scalar("city").not_null()]),
        ];
        let values = vec![
            PropertyValue::Null,
            PropertyValue::Component(vec![PropertyValue::Null]),
        ];
        let err = check_properties("Customer", &properties, &values, false, None).unwrap_err();
        match err {
            Error::PropertyValue { entity_name, property, .. } => {
                assert_eq!(entity_name, "Customer");
                assert_eq!(property, "address.city");
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_nullability_skips_non_updatable_on_update() {
        let properties = vec![PropertyInfo::scalar("code").not_null().not_updatable()];
        let values = vec![PropertyValue::Null];
        assert!(check_properties("Item", &properties, &values, true, None).is_ok());
        assert!(check_properties("Item", &properties, &values, false, None).is_err());
    }
}
