//! The persistence context: identity map and entry registry.
//!
//! A [`PersistenceContext`] is the per-unit-of-work container of managed
//! state. It guarantees that a database row is represented by at most one
//! instance ([`EntityKey`] → [`InstanceId`]), keeps an [`EntityEntry`] per
//! managed instance and a [`CollectionEntry`] per managed collection
//! wrapper, and owns the arenas behind every handle.
//!
//! # Example
//!
//! ```ignore
//! let mut context = PersistenceContext::new(EntityMode::Pojo);
//! let instance = context.register_instance(persister.instantiate(Some(&id)));
//! let key = EntityKey::for_entity(id, persister.metadata(), EntityMode::Pojo);
//! context.check_uniqueness(&key, instance)?;
//! context.add_entity(key.clone(), instance);
//! assert_eq!(context.get_entity(&key), Some(instance));
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use unitwork_core::{
    Arena, CollectionId, CollectionMetadata, EntityMetadata, EntityMode, EntityPersister, Error,
    InstanceId, LockMode, MetadataRegistry, PropertyAccess, PropertyValue, ProxyId, Result, Value,
};

use crate::collection::{ElementIdentity, PersistentCollection};
use crate::collection_entry::CollectionEntry;
use crate::entity_entry::{EntityEntry, Status};
use crate::keys::{CollectionKey, EntityKey, EntityUniqueKey};
use crate::linked_map::LinkedMap;
use crate::proxy::{EntityProxy, EntityRef};

/// Memoized result of a database snapshot read.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CachedSnapshot {
    Row(Vec<PropertyValue>),
    /// The row was looked for and does not exist.
    NoRow,
}

/// Position of an array-valued property: owning instance and property index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HolderKey {
    pub owner: InstanceId,
    pub property: usize,
}

/// Identity map and entry registry for one unit of work.
pub struct PersistenceContext {
    entity_mode: EntityMode,

    pub(crate) instances: Arena<InstanceId, Box<dyn PropertyAccess>>,
    pub(crate) collections: Arena<CollectionId, PersistentCollection>,
    pub(crate) proxies: Arena<ProxyId, EntityProxy>,

    pub(crate) entities_by_key: HashMap<EntityKey, InstanceId>,
    pub(crate) entities_by_unique_key: HashMap<EntityUniqueKey, InstanceId>,
    pub(crate) entity_entries: LinkedMap<InstanceId, EntityEntry>,
    pub(crate) proxies_by_key: HashMap<EntityKey, ProxyId>,
    pub(crate) entity_snapshots_by_key: HashMap<EntityKey, CachedSnapshot>,
    natural_id_snapshots: HashMap<EntityKey, Vec<PropertyValue>>,
    pub(crate) collections_by_key: HashMap<CollectionKey, CollectionId>,
    pub(crate) collection_entries: LinkedMap<CollectionId, CollectionEntry>,
    pub(crate) array_holders: HashMap<HolderKey, CollectionId>,
    pub(crate) nullifiable_entity_keys: HashSet<EntityKey>,
    parents_by_child: HashMap<InstanceId, InstanceId>,
    null_associations: HashSet<(EntityKey, String)>,
    non_lazy_collections: VecDeque<CollectionId>,
    unowned_collections: HashMap<CollectionKey, CollectionId>,
    inserted_keys: HashMap<String, HashSet<Value>>,

    cascading: usize,
    load_counter: usize,
    flushing: bool,
    pub(crate) default_read_only: bool,
    pub(crate) has_non_read_only_entities: bool,
}

impl Default for PersistenceContext {
    fn default() -> Self {
        Self::new(EntityMode::Pojo)
    }
}

impl PersistenceContext {
    /// Create an empty context.
    #[must_use]
    pub fn new(entity_mode: EntityMode) -> Self {
        Self {
            entity_mode,
            instances: Arena::new(),
            collections: Arena::new(),
            proxies: Arena::new(),
            entities_by_key: HashMap::new(),
            entities_by_unique_key: HashMap::new(),
            entity_entries: LinkedMap::new(),
            proxies_by_key: HashMap::new(),
            entity_snapshots_by_key: HashMap::new(),
            natural_id_snapshots: HashMap::new(),
            collections_by_key: HashMap::new(),
            collection_entries: LinkedMap::new(),
            array_holders: HashMap::new(),
            nullifiable_entity_keys: HashSet::new(),
            parents_by_child: HashMap::new(),
            null_associations: HashSet::new(),
            non_lazy_collections: VecDeque::new(),
            unowned_collections: HashMap::new(),
            inserted_keys: HashMap::new(),
            cascading: 0,
            load_counter: 0,
            flushing: false,
            default_read_only: false,
            has_non_read_only_entities: false,
        }
    }

    pub fn entity_mode(&self) -> EntityMode {
        self.entity_mode
    }

    /// Key for `id` in the hierarchy described by `metadata`.
    pub fn entity_key(&self, id: Value, metadata: &EntityMetadata) -> EntityKey {
        EntityKey::for_entity(id, metadata, self.entity_mode)
    }

    pub fn collection_key(&self, role: &str, key: Value) -> CollectionKey {
        CollectionKey::new(role, key, self.entity_mode)
    }

    // ========================================================================
    // Arenas
    // ========================================================================

    /// Take ownership of an instance. It stays transient until an entry is
    /// added for it.
    pub fn register_instance(&mut self, instance: Box<dyn PropertyAccess>) -> InstanceId {
        self.instances.insert(instance)
    }

    pub fn instance(&self, id: InstanceId) -> Option<&dyn PropertyAccess> {
        self.instances.get(id).map(|b| &**b)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut (dyn PropertyAccess + 'static)> {
        self.instances.get_mut(id).map(|b| &mut **b)
    }

    pub(crate) fn require_instance(&self, id: InstanceId) -> Result<&dyn PropertyAccess> {
        self.instance(id)
            .ok_or_else(|| Error::TransientObject(format!("instance handle {} is no longer valid", id)))
    }

    pub(crate) fn require_instance_mut(&mut self, id: InstanceId) -> Result<&mut (dyn PropertyAccess + 'static)> {
        self.instance_mut(id)
            .ok_or_else(|| Error::TransientObject(format!("instance handle {} is no longer valid", id)))
    }

    /// Release a detached instance, returning it to the caller.
    pub fn discard_instance(&mut self, id: InstanceId) -> Result<Box<dyn PropertyAccess>> {
        if self.entity_entries.contains_key(&id) {
            return Err(Error::IllegalState(format!(
                "cannot discard managed instance {}",
                id
            )));
        }
        self.instances
            .remove(id)
            .ok_or_else(|| Error::TransientObject(format!("instance handle {} is no longer valid", id)))
    }

    /// Take ownership of a collection wrapper.
    pub fn register_collection(&mut self, collection: PersistentCollection) -> CollectionId {
        self.collections.insert(collection)
    }

    pub fn collection(&self, id: CollectionId) -> Option<&PersistentCollection> {
        self.collections.get(id)
    }

    pub fn collection_mut(&mut self, id: CollectionId) -> Option<&mut PersistentCollection> {
        self.collections.get_mut(id)
    }

    pub(crate) fn require_collection_mut(&mut self, id: CollectionId) -> Result<&mut PersistentCollection> {
        self.collections
            .get_mut(id)
            .ok_or_else(|| Error::assertion(format!("collection handle {} is no longer valid", id)))
    }

    pub fn proxy(&self, id: ProxyId) -> Option<&EntityProxy> {
        self.proxies.get(id)
    }

    // ========================================================================
    // Entities by key
    // ========================================================================

    pub fn add_entity(&mut self, key: EntityKey, instance: InstanceId) {
        self.entities_by_key.insert(key, instance);
    }

    pub fn get_entity(&self, key: &EntityKey) -> Option<InstanceId> {
        self.entities_by_key.get(key).copied()
    }

    pub fn contains_entity(&self, key: &EntityKey) -> bool {
        self.entities_by_key.contains_key(key)
    }

    /// Unbind `key`, purging everything that was tracked for it.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<InstanceId> {
        let instance = self.entities_by_key.remove(key);
        if let Some(instance) = instance {
            self.entities_by_unique_key.retain(|_, v| *v != instance);
        }
        self.parents_by_child.clear();
        self.entity_snapshots_by_key.remove(key);
        self.natural_id_snapshots.remove(key);
        self.nullifiable_entity_keys.remove(key);
        instance
    }

    pub fn add_entity_by_unique_key(&mut self, key: EntityUniqueKey, instance: InstanceId) {
        self.entities_by_unique_key.insert(key, instance);
    }

    pub fn get_entity_by_unique_key(&self, key: &EntityUniqueKey) -> Option<InstanceId> {
        self.entities_by_unique_key.get(key).copied()
    }

    /// Fail if `key` is already bound.
    ///
    /// A different instance under the key is a caller error
    /// ([`Error::NonUniqueObject`]); the same instance bound without an
    /// entry is an internal inconsistency.
    pub fn check_uniqueness(&self, key: &EntityKey, instance: InstanceId) -> Result<()> {
        match self.entities_by_key.get(key) {
            Some(existing) if *existing == instance => Err(Error::assertion(format!(
                "object already associated, but no entry was found: {}",
                key
            ))),
            Some(_) => Err(Error::NonUniqueObject {
                entity_name: key.entity_name().to_string(),
                id: key.identifier().clone(),
            }),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// Register the entry for a managed instance.
    pub(crate) fn add_entry(&mut self, instance: InstanceId, entry: EntityEntry) -> Result<&EntityEntry> {
        if self.entity_entries.contains_key(&instance) {
            return Err(Error::assertion(format!(
                "entity entry already exists for {}",
                entry.entity_key()
            )));
        }
        if entry.status != Status::ReadOnly {
            self.has_non_read_only_entities = true;
        }
        tracing::trace!(entry = %entry, instance = %instance, "adding entity entry");
        self.entity_entries.insert(instance, entry);
        self.entity_entries
            .get(&instance)
            .ok_or_else(|| Error::assertion("entity entry vanished during insert"))
    }

    /// Bind the instance under its key and register its entry.
    pub(crate) fn add_entity_with_entry(&mut self, instance: InstanceId, entry: EntityEntry) -> Result<&EntityEntry> {
        self.add_entity(entry.entity_key(), instance);
        self.add_entry(instance, entry)
    }

    pub fn get_entry(&self, instance: InstanceId) -> Option<&EntityEntry> {
        self.entity_entries.get(&instance)
    }

    pub fn get_entry_mut(&mut self, instance: InstanceId) -> Option<&mut EntityEntry> {
        self.entity_entries.get_mut(&instance)
    }

    pub(crate) fn require_entry(&self, instance: InstanceId) -> Result<&EntityEntry> {
        self.get_entry(instance).ok_or_else(|| {
            Error::TransientObject(format!(
                "instance {} was not associated with this persistence context",
                instance
            ))
        })
    }

    pub fn remove_entry(&mut self, instance: InstanceId) -> Option<EntityEntry> {
        self.entity_entries.remove(&instance)
    }

    pub fn is_entry_for(&self, instance: InstanceId) -> bool {
        self.entity_entries.contains_key(&instance)
    }

    pub(crate) fn set_entry_status(&mut self, instance: InstanceId, status: Status) -> Result<()> {
        let entry = self
            .entity_entries
            .get_mut(&instance)
            .ok_or_else(|| Error::assertion(format!("no entry for {}", instance)))?;
        entry.set_status(status);
        if status != Status::ReadOnly {
            self.has_non_read_only_entities = true;
        }
        Ok(())
    }

    /// Managed instances and their entries, in the order they were added.
    pub fn entries(&self) -> impl Iterator<Item = (InstanceId, &EntityEntry)> {
        self.entity_entries.iter()
    }

    pub fn entry_count(&self) -> usize {
        self.entity_entries.len()
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    pub fn add_proxy(&mut self, key: EntityKey, proxy: EntityProxy) -> ProxyId {
        let id = self.proxies.insert(proxy);
        self.proxies_by_key.insert(key, id);
        id
    }

    pub fn get_proxy(&self, key: &EntityKey) -> Option<ProxyId> {
        self.proxies_by_key
            .get(key)
            .copied()
            .filter(|id| self.proxies.contains(*id))
    }

    /// Unregister the proxy for `key`.
    ///
    /// The proxy stays valid as a detached object so that references held
    /// by detached instances can be re-attached later.
    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<ProxyId> {
        let id = self.proxies_by_key.remove(key)?;
        if let Some(record) = self.proxies.get_mut(id) {
            record.set_attached(false);
        }
        Some(id)
    }

    /// Is this proxy registered with the context?
    pub fn contains_proxy(&self, proxy: ProxyId) -> bool {
        self.proxies.contains(proxy) && self.proxies_by_key.values().any(|id| *id == proxy)
    }

    /// Re-attach a detached, uninitialized proxy.
    ///
    /// Returns false when the proxy is initialized (nothing to do). A proxy
    /// already registered under the same key takes precedence.
    pub fn reassociate_if_uninitialized_proxy(&mut self, proxy: ProxyId, metadata: &EntityMetadata) -> Result<bool> {
        let record = self
            .proxies
            .get_mut(proxy)
            .ok_or_else(|| Error::TransientObject(format!("proxy handle {} is no longer valid", proxy)))?;
        if !record.is_uninitialized() {
            return Ok(false);
        }
        if !record.is_attached() {
            record.set_attached(true);
            let key = EntityKey::for_entity(record.id().clone(), metadata, self.entity_mode);
            self.proxies_by_key.entry(key).or_insert(proxy);
        }
        Ok(true)
    }

    /// The row a collection element stands for. A proxy answers with its
    /// identifier, an instance with the identifier of its entry.
    pub fn element_identity(&self, element: &PropertyValue) -> ElementIdentity {
        let instance = match element {
            PropertyValue::Entity(instance) => Some(*instance),
            PropertyValue::Proxy(proxy) => match self.proxies.get(*proxy) {
                Some(record) => match record.implementation() {
                    Some(instance) if self.is_entry_for(instance) => Some(instance),
                    _ => return ElementIdentity::Row(record.id().clone()),
                },
                None => None,
            },
            _ => None,
        };
        match instance.and_then(|instance| self.get_entry(instance)) {
            Some(entry) if entry.status == Status::Saving => ElementIdentity::Saving,
            Some(entry) => ElementIdentity::Row(entry.id().clone()),
            None => ElementIdentity::Unknown,
        }
    }

    /// Resolve an entity reference to its materialized instance.
    pub fn unproxy(&self, target: EntityRef) -> Result<InstanceId> {
        match target {
            EntityRef::Instance(id) => Ok(id),
            EntityRef::Proxy(id) => {
                let proxy = self
                    .proxies
                    .get(id)
                    .ok_or_else(|| Error::TransientObject(format!("proxy handle {} is no longer valid", id)))?;
                proxy.implementation().ok_or_else(|| {
                    Error::PersistentObject(format!(
                        "object was an uninitialized proxy for {}",
                        proxy.entity_name()
                    ))
                })
            }
        }
    }

    /// [`Self::unproxy`], re-attaching a detached proxy first.
    pub fn unproxy_and_reassociate(&mut self, target: EntityRef, registry: &MetadataRegistry) -> Result<InstanceId> {
        if let EntityRef::Proxy(proxy) = target {
            let entity_name = self
                .proxies
                .get(proxy)
                .map(|p| p.entity_name().to_owned())
                .ok_or_else(|| Error::TransientObject(format!("proxy handle {} is no longer valid", proxy)))?;
            let metadata = registry.entity_persister(&entity_name)?.metadata();
            self.reassociate_if_uninitialized_proxy(proxy, metadata)?;
        }
        self.unproxy(target)
    }

    /// Make sure `proxy` is assignable to the persister's entity.
    ///
    /// A proxy created for a superclass cannot stand in for the concrete
    /// subclass. In that case the proxy is replaced: by `object` if given
    /// (the proxy is unregistered), otherwise by a fresh proxy for the
    /// narrower entity. Replacement breaks reference equality with the old
    /// proxy handle.
    pub fn narrow_proxy(
        &mut self,
        proxy: ProxyId,
        metadata: &EntityMetadata,
        key: &EntityKey,
        object: Option<InstanceId>,
    ) -> Result<EntityRef> {
        let record = self
            .proxies
            .get(proxy)
            .ok_or_else(|| Error::assertion(format!("proxy handle {} is no longer valid", proxy)))?;
        let already_narrow = metadata.is_subclass_entity_name(record.entity_name());

        if !already_narrow {
            tracing::warn!(
                entity = %metadata.entity_name,
                key = %key,
                "Narrowing proxy to {} - this operation breaks ==",
                metadata.entity_name
            );
            if let Some(object) = object {
                self.proxies_by_key.remove(key);
                return Ok(EntityRef::Instance(object));
            }
            let read_only = record.is_read_only();
            let mut narrowed = EntityProxy::new(metadata.entity_name.clone(), key.identifier().clone());
            narrowed.set_read_only(read_only);
            return Ok(EntityRef::Proxy(self.add_proxy(key.clone(), narrowed)));
        }

        if let Some(object) = object {
            if let Some(record) = self.proxies.get_mut(proxy) {
                record.set_implementation(object);
            }
        }
        Ok(EntityRef::Proxy(proxy))
    }

    /// The reference callers should see for `instance`: its proxy if one
    /// is registered, else the instance itself.
    pub fn proxy_for(&mut self, metadata: &EntityMetadata, key: &EntityKey, instance: InstanceId) -> Result<EntityRef> {
        if !metadata.has_proxy {
            return Ok(EntityRef::Instance(instance));
        }
        match self.get_proxy(key) {
            Some(proxy) => self.narrow_proxy(proxy, metadata, key, Some(instance)),
            None => Ok(EntityRef::Instance(instance)),
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Current database state of the row for `id`, read at most once per
    /// key. `Ok(None)` means there is no such row.
    pub fn get_database_snapshot(
        &mut self,
        id: &Value,
        persister: &dyn EntityPersister,
    ) -> Result<Option<Vec<PropertyValue>>> {
        let key = self.entity_key(id.clone(), persister.metadata());
        if let Some(cached) = self.entity_snapshots_by_key.get(&key) {
            return Ok(match cached {
                CachedSnapshot::Row(state) => Some(state.clone()),
                CachedSnapshot::NoRow => None,
            });
        }
        let snapshot = persister.load_state(id)?;
        tracing::trace!(key = %key, found = snapshot.is_some(), "fetched database snapshot");
        let cached = match &snapshot {
            Some(state) => CachedSnapshot::Row(state.clone()),
            None => CachedSnapshot::NoRow,
        };
        self.entity_snapshots_by_key.insert(key, cached);
        Ok(snapshot)
    }

    /// Snapshot previously fetched for `key`, without going to the
    /// database. Asking for a row known to be missing is an error.
    pub fn get_cached_database_snapshot(&self, key: &EntityKey) -> Result<Option<&[PropertyValue]>> {
        match self.entity_snapshots_by_key.get(key) {
            Some(CachedSnapshot::Row(state)) => Ok(Some(state)),
            Some(CachedSnapshot::NoRow) => Err(Error::IllegalState(format!(
                "persistence context reported no row snapshot for {}",
                key
            ))),
            None => Ok(None),
        }
    }

    /// Natural-id values of the row for `id`.
    ///
    /// Immutable natural ids are read once and cross-referenced; mutable
    /// ones are taken from the (memoized) database snapshot.
    pub fn get_natural_id_snapshot(
        &mut self,
        id: &Value,
        persister: &dyn EntityPersister,
    ) -> Result<Option<Vec<PropertyValue>>> {
        let metadata = persister.metadata();
        if !metadata.has_natural_identifier() {
            return Ok(None);
        }
        if !metadata.natural_id_mutable {
            let key = self.entity_key(id.clone(), metadata);
            if let Some(cached) = self.natural_id_snapshots.get(&key) {
                return Ok(Some(cached.clone()));
            }
            let snapshot = persister.natural_id_snapshot(id)?;
            if let Some(values) = &snapshot {
                self.natural_id_snapshots.insert(key, values.clone());
            }
            return Ok(snapshot);
        }
        let entity_snapshot = self.get_database_snapshot(id, persister)?;
        Ok(entity_snapshot.map(|state| {
            metadata
                .natural_id_properties
                .iter()
                .filter_map(|&i| state.get(i).cloned())
                .collect()
        }))
    }

    // ========================================================================
    // Ownership lookup
    // ========================================================================

    pub fn add_child_parent(&mut self, child: InstanceId, parent: InstanceId) {
        self.parents_by_child.insert(child, parent);
    }

    pub fn remove_child_parent(&mut self, child: InstanceId) {
        self.parents_by_child.remove(&child);
    }

    /// Identifier of the entity whose collection property contains `child`.
    ///
    /// `merge_map` maps managed instances to the detached ones they were
    /// merged from, for lookups made during a merge.
    pub fn get_owner_id(
        &mut self,
        entity_name: &str,
        property_name: &str,
        child: InstanceId,
        merge_map: Option<&HashMap<InstanceId, InstanceId>>,
        registry: &MetadataRegistry,
    ) -> Result<Option<Value>> {
        let found = self.find_in_owner(entity_name, property_name, child, merge_map, registry, |ctx, p, c, o| {
            ctx.index_in_parent(p, c, o).map(|_| ())
        })?;
        Ok(found.and_then(|(owner, ())| self.get_entry(owner).map(|e| e.id().clone())))
    }

    /// Position of `child` within the owning entity's collection property.
    pub fn get_index_in_owner(
        &mut self,
        entity_name: &str,
        property_name: &str,
        child: InstanceId,
        merge_map: Option<&HashMap<InstanceId, InstanceId>>,
        registry: &MetadataRegistry,
    ) -> Result<Option<usize>> {
        let found = self.find_in_owner(entity_name, property_name, child, merge_map, registry, |ctx, p, c, o| {
            ctx.index_in_parent(p, c, o)
        })?;
        Ok(found.map(|(_, index)| index))
    }

    fn find_in_owner<T>(
        &mut self,
        entity_name: &str,
        property_name: &str,
        child: InstanceId,
        merge_map: Option<&HashMap<InstanceId, InstanceId>>,
        registry: &MetadataRegistry,
        lookup: impl Fn(&Self, usize, InstanceId, InstanceId) -> Option<T>,
    ) -> Result<Option<(InstanceId, T)>> {
        let metadata = registry.entity_persister(entity_name)?.metadata();
        let property = metadata.property_index(property_name).ok_or_else(|| {
            Error::Mapping(format!("no such property: {}.{}", entity_name, property_name))
        })?;

        let lookup_with_merge = |ctx: &Self, parent: InstanceId| -> Option<T> {
            lookup(ctx, property, child, parent).or_else(|| {
                let map = merge_map?;
                let unmerged_parent = map.get(&parent)?;
                let unmerged_child = map.get(&child)?;
                lookup(ctx, property, *unmerged_child, *unmerged_parent)
            })
        };

        if let Some(parent) = self.parents_by_child.get(&child).copied() {
            let cached = self
                .get_entry(parent)
                .filter(|entry| metadata.is_subclass_entity_name(entry.entity_name()))
                .and_then(|_| lookup_with_merge(self, parent));
            if let Some(found) = cached {
                return Ok(Some((parent, found)));
            }
            self.parents_by_child.remove(&child);
        }

        for (parent, entry) in self.entity_entries.iter() {
            if !metadata.is_subclass_entity_name(entry.entity_name()) {
                continue;
            }
            if let Some(found) = lookup_with_merge(self, parent) {
                return Ok(Some((parent, found)));
            }
        }
        Ok(None)
    }

    fn index_in_parent(&self, property: usize, child: InstanceId, parent: InstanceId) -> Option<usize> {
        let value = self.instance(parent)?.property(property);
        let collection = self.collections.get(value.as_collection()?)?;
        if !collection.was_initialized() {
            return None;
        }
        collection.index_of(&PropertyValue::Entity(child))
    }

    // ========================================================================
    // Read-only
    // ========================================================================

    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    pub fn has_non_read_only_entities(&self) -> bool {
        self.has_non_read_only_entities
    }

    pub fn is_read_only(&self, target: EntityRef) -> Result<bool> {
        match target {
            EntityRef::Proxy(id) => self
                .proxies
                .get(id)
                .map(EntityProxy::is_read_only)
                .ok_or_else(|| Error::TransientObject(format!("proxy handle {} is no longer valid", id))),
            EntityRef::Instance(id) => Ok(self.require_entry(id)?.is_read_only()),
        }
    }

    /// Toggle read-only for an entity or proxy.
    ///
    /// Toggling an entity also toggles its registered proxy; toggling an
    /// initialized proxy also toggles its implementation.
    pub fn set_read_only(&mut self, target: EntityRef, read_only: bool, registry: &MetadataRegistry) -> Result<()> {
        if self.is_read_only(target)? == read_only {
            return Ok(());
        }
        match target {
            EntityRef::Proxy(id) => {
                self.set_proxy_read_only(id, read_only, registry)?;
                if let Some(instance) = self.proxies.get(id).and_then(EntityProxy::implementation) {
                    if self.is_entry_for(instance) {
                        self.set_entity_read_only(instance, read_only)?;
                    }
                }
            }
            EntityRef::Instance(instance) => {
                self.set_entity_read_only(instance, read_only)?;
                let key = self.require_entry(instance)?.entity_key();
                if let Some(proxy) = self.get_proxy(&key) {
                    self.set_proxy_read_only(proxy, read_only, registry)?;
                }
            }
        }
        Ok(())
    }

    fn set_proxy_read_only(&mut self, proxy: ProxyId, read_only: bool, registry: &MetadataRegistry) -> Result<()> {
        let record = self
            .proxies
            .get_mut(proxy)
            .ok_or_else(|| Error::TransientObject(format!("proxy handle {} is no longer valid", proxy)))?;
        if !read_only && !registry.entity_persister(record.entity_name())?.metadata().mutable {
            return Err(Error::IllegalState(format!(
                "cannot make proxies for immutable entities modifiable: {}",
                record.entity_name()
            )));
        }
        record.set_read_only(read_only);
        Ok(())
    }

    fn set_entity_read_only(&mut self, instance: InstanceId, read_only: bool) -> Result<()> {
        let instances = &self.instances;
        let entry = self.entity_entries.get_mut(&instance).ok_or_else(|| {
            Error::TransientObject(format!(
                "instance {} was not associated with this persistence context",
                instance
            ))
        })?;
        entry.set_read_only(read_only, || instances.get(instance).map(|i| i.property_values()))?;
        self.has_non_read_only_entities = self.has_non_read_only_entities || !read_only;
        Ok(())
    }

    /// Has the instance changed since it was loaded?
    ///
    /// Read-only and immutable entities are never dirty and their property
    /// values are not read.
    pub fn is_dirty(&self, instance: InstanceId, registry: &MetadataRegistry) -> Result<bool> {
        let entry = self.require_entry(instance)?;
        if !entry.requires_dirty_check() {
            return Ok(false);
        }
        let metadata = registry.entity_persister(entry.entity_name())?.metadata();
        let current = self.require_instance(instance)?.property_values();
        Ok(!entry.dirty_properties(&current, metadata).is_empty())
    }

    // ========================================================================
    // Counters and flags
    // ========================================================================

    pub fn increment_cascade_level(&mut self) -> usize {
        self.cascading += 1;
        self.cascading
    }

    pub fn decrement_cascade_level(&mut self) -> usize {
        self.cascading = self.cascading.saturating_sub(1);
        self.cascading
    }

    pub fn cascade_level(&self) -> usize {
        self.cascading
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    pub fn set_flushing(&mut self, flushing: bool) {
        self.flushing = flushing;
    }

    /// Enter a load.
    pub fn before_load(&mut self) {
        self.load_counter += 1;
    }

    /// Leave a load.
    pub fn after_load(&mut self) {
        self.load_counter = self.load_counter.saturating_sub(1);
    }

    pub fn is_load_finished(&self) -> bool {
        self.load_counter == 0
    }

    pub fn load_depth(&self) -> usize {
        self.load_counter
    }

    // ========================================================================
    // Non-lazy collections and null associations
    // ========================================================================

    /// Queue a collection to be initialized when the outermost load ends.
    pub fn add_non_lazy_collection(&mut self, collection: CollectionId) {
        self.non_lazy_collections.push_back(collection);
    }

    pub(crate) fn take_next_non_lazy_collection(&mut self) -> Option<CollectionId> {
        self.non_lazy_collections.pop_front()
    }

    /// Record that `property` of the entity under `owner` is a null
    /// association.
    pub fn add_null_property(&mut self, owner: EntityKey, property: impl Into<String>) {
        self.null_associations.insert((owner, property.into()));
    }

    pub fn is_property_null(&self, owner: &EntityKey, property: &str) -> bool {
        self.null_associations
            .contains(&(owner.clone(), property.to_string()))
    }

    pub(crate) fn clear_null_properties(&mut self) {
        self.null_associations.clear();
    }

    // ========================================================================
    // Collections
    // ========================================================================

    fn add_collection(
        &mut self,
        collection: CollectionId,
        entry: CollectionEntry,
        key: Option<(String, Value)>,
    ) -> Result<()> {
        self.collection_entries.insert(collection, entry);
        if let Some((role, key)) = key {
            let collection_key = self.collection_key(&role, key);
            if let Some(old) = self.collections_by_key.insert(collection_key, collection) {
                if old == collection {
                    return Err(Error::assertion("bug adding collection twice"));
                }
                // replaced one wrapper with another for the same key
                if let Some(previous) = self.collections.get_mut(old) {
                    previous.unset_session();
                }
                self.collection_entries.remove(&old);
            }
        }
        self.require_collection_mut(collection)?.set_current_session();
        Ok(())
    }

    /// Register a wrapper created by the application in this unit of work.
    pub fn add_new_collection(&mut self, metadata: &CollectionMetadata, collection: CollectionId) -> Result<()> {
        let wrapper = self.require_collection_mut(collection)?;
        let entry = CollectionEntry::for_new(wrapper);
        tracing::trace!(role = %metadata.role, collection = %collection, "adding new collection");
        self.add_collection(collection, entry, None)
    }

    /// Register a persistent wrapper whose elements are not loaded.
    pub fn add_uninitialized_collection(
        &mut self,
        metadata: &CollectionMetadata,
        collection: CollectionId,
        key: Value,
    ) -> Result<()> {
        let entry = CollectionEntry::for_uninitialized(metadata, key.clone());
        self.add_collection(collection, entry, Some((metadata.role.clone(), key)))
    }

    /// Re-attach a detached, uninitialized wrapper.
    pub fn add_uninitialized_detached_collection(
        &mut self,
        metadata: &CollectionMetadata,
        collection: CollectionId,
    ) -> Result<()> {
        let key = self
            .require_collection_mut(collection)?
            .key()
            .cloned()
            .ok_or_else(|| Error::assertion("detached collection has no key"))?;
        self.add_uninitialized_collection(metadata, collection, key)
    }

    /// Re-attach a detached wrapper with its elements, using the snapshot it
    /// carries. An unreferenced wrapper is treated as new.
    pub fn add_initialized_detached_collection(
        &mut self,
        metadata: &CollectionMetadata,
        collection: CollectionId,
    ) -> Result<()> {
        let wrapper = self.require_collection_mut(collection)?;
        if wrapper.is_unreferenced() {
            return self.add_new_collection(metadata, collection);
        }
        let key = wrapper
            .key()
            .cloned()
            .ok_or_else(|| Error::assertion("detached collection has no key"))?;
        let entry = CollectionEntry::for_detached(wrapper, metadata, key.clone());
        self.add_collection(collection, entry, Some((metadata.role.clone(), key)))
    }

    /// Register a wrapper whose elements were just loaded.
    pub fn add_initialized_collection(
        &mut self,
        metadata: &CollectionMetadata,
        collection: CollectionId,
        key: Value,
    ) -> Result<&CollectionEntry> {
        let ignore = self.flushing;
        let wrapper = self.require_collection_mut(collection)?;
        let entry = CollectionEntry::for_initialized(metadata, key.clone(), wrapper, ignore);
        self.add_collection(collection, entry, Some((metadata.role.clone(), key)))?;
        self.collection_entries
            .get(&collection)
            .ok_or_else(|| Error::assertion("collection entry vanished during insert"))
    }

    pub fn get_collection(&self, key: &CollectionKey) -> Option<CollectionId> {
        self.collections_by_key.get(key).copied()
    }

    pub fn get_collection_entry(&self, collection: CollectionId) -> Option<&CollectionEntry> {
        self.collection_entries.get(&collection)
    }

    pub fn get_collection_entry_mut(&mut self, collection: CollectionId) -> Option<&mut CollectionEntry> {
        self.collection_entries.get_mut(&collection)
    }

    /// Managed wrappers and their entries, in the order they were added.
    pub fn collection_entries(&self) -> impl Iterator<Item = (CollectionId, &CollectionEntry)> {
        self.collection_entries.iter()
    }

    /// Borrow a wrapper and its entry together.
    pub(crate) fn collection_and_entry_mut(
        &mut self,
        collection: CollectionId,
    ) -> Result<(&mut PersistentCollection, &mut CollectionEntry)> {
        let wrapper = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| Error::assertion(format!("collection handle {} is no longer valid", collection)))?;
        let entry = self.collection_entries.get_mut(&collection).ok_or_else(|| {
            Error::assertion(format!(
                "collection {} was not associated with this persistence context",
                collection
            ))
        })?;
        Ok((wrapper, entry))
    }

    /// Snapshot of the collection as loaded.
    pub fn get_snapshot(&self, collection: CollectionId) -> Result<Option<&[PropertyValue]>> {
        self.get_collection_entry(collection)
            .map(CollectionEntry::snapshot)
            .ok_or_else(|| {
                Error::assertion(format!(
                    "collection {} was not associated with this persistence context",
                    collection
                ))
            })
    }

    /// Owner of the collection stored under `key` for the given role.
    pub fn get_collection_owner(
        &self,
        key: &Value,
        metadata: &CollectionMetadata,
        registry: &MetadataRegistry,
    ) -> Result<Option<InstanceId>> {
        let owner = registry.entity_persister(&metadata.owner_entity_name)?.metadata();
        Ok(self.get_entity(&self.entity_key(key.clone(), owner)))
    }

    /// Owner the collection was loaded for, if still in the context.
    pub fn get_loaded_collection_owner_or_null(
        &self,
        collection: CollectionId,
        registry: &MetadataRegistry,
    ) -> Result<Option<InstanceId>> {
        let Some(entry) = self.get_collection_entry(collection) else {
            return Ok(None);
        };
        let (Some(role), Some(key)) = (entry.loaded_role(), entry.loaded_key()) else {
            return Ok(None);
        };
        let metadata = registry.collection_persister(role)?.metadata();
        self.get_collection_owner(key, metadata, registry)
    }

    /// Identifier of the owner the collection was loaded for.
    pub fn get_loaded_collection_owner_id_or_null(&self, collection: CollectionId) -> Option<Value> {
        let entry = self.get_collection_entry(collection)?;
        entry.loaded_role()?;
        entry.loaded_key().cloned()
    }

    /// Park a loaded collection whose owner is not in the context.
    pub fn add_unowned_collection(&mut self, key: CollectionKey, collection: CollectionId) {
        self.unowned_collections.insert(key, collection);
    }

    /// Claim a parked collection for its owner.
    pub fn use_unowned_collection(&mut self, key: &CollectionKey) -> Option<CollectionId> {
        self.unowned_collections.remove(key)
    }

    pub fn add_collection_holder(&mut self, owner: InstanceId, property: usize, collection: CollectionId) {
        self.array_holders.insert(HolderKey { owner, property }, collection);
    }

    pub fn get_collection_holder(&self, owner: InstanceId, property: usize) -> Option<CollectionId> {
        self.array_holders.get(&HolderKey { owner, property }).copied()
    }

    pub fn remove_collection_holder(&mut self, owner: InstanceId, property: usize) -> Option<CollectionId> {
        self.array_holders.remove(&HolderKey { owner, property })
    }

    pub(crate) fn remove_collection_entry(&mut self, collection: CollectionId) -> Option<CollectionEntry> {
        self.collection_entries.remove(&collection)
    }

    // ========================================================================
    // Transaction lifecycle
    // ========================================================================

    pub fn nullifiable_entity_keys(&self) -> &HashSet<EntityKey> {
        &self.nullifiable_entity_keys
    }

    pub fn nullifiable_entity_keys_mut(&mut self) -> &mut HashSet<EntityKey> {
        &mut self.nullifiable_entity_keys
    }

    /// Remember that `id` was inserted in this transaction.
    pub fn register_inserted_key(&mut self, metadata: &EntityMetadata, id: Value) {
        self.register_inserted_root_key(metadata.root_entity_name.clone(), id);
    }

    pub(crate) fn register_inserted_root_key(&mut self, root_entity_name: String, id: Value) {
        self.inserted_keys.entry(root_entity_name).or_default().insert(id);
    }

    pub fn was_inserted_during_transaction(&self, metadata: &EntityMetadata, id: &Value) -> bool {
        self.inserted_keys
            .get(&metadata.root_entity_name)
            .is_some_and(|ids| ids.contains(id))
    }

    /// Forget per-transaction state and release every lock.
    pub fn after_transaction_completion(&mut self) {
        self.inserted_keys.clear();
        for entry in self.entity_entries.values_mut() {
            entry.set_lock_mode(LockMode::None);
        }
    }

    /// Re-key an entity whose identifier was generated by the insert.
    pub fn replace_delayed_entity_identity_insert_keys(
        &mut self,
        old_key: &EntityKey,
        generated_id: Value,
    ) -> Result<()> {
        let instance = self
            .entities_by_key
            .remove(old_key)
            .ok_or_else(|| Error::assertion(format!("no entity bound to {}", old_key)))?;
        let mut entry = self
            .entity_entries
            .remove(&instance)
            .ok_or_else(|| Error::assertion(format!("no entry for {}", old_key)))?;
        self.parents_by_child.clear();

        entry.id = generated_id.clone();
        self.require_instance_mut(instance)?
            .set_identifier(generated_id);
        let new_key = entry.entity_key();
        tracing::debug!(old = %old_key, new = %new_key, "replaced delayed identity insert key");
        self.add_entity(new_key, instance);
        self.add_entry(instance, entry)?;
        Ok(())
    }

    /// Detach everything and empty every map.
    ///
    /// Instances and proxies stay in their arenas as detached objects; the
    /// default read-only setting is kept.
    pub fn clear(&mut self) {
        for (_, proxy) in self.proxies.iter_mut() {
            proxy.set_attached(false);
        }
        for (_, collection) in self.collections.iter_mut() {
            collection.unset_session();
        }
        self.entities_by_key.clear();
        self.entities_by_unique_key.clear();
        self.entity_entries.clear();
        self.proxies_by_key.clear();
        self.entity_snapshots_by_key.clear();
        self.natural_id_snapshots.clear();
        self.collections_by_key.clear();
        self.collection_entries.clear();
        self.array_holders.clear();
        self.nullifiable_entity_keys.clear();
        self.parents_by_child.clear();
        self.null_associations.clear();
        self.non_lazy_collections.clear();
        self.unowned_collections.clear();
        self.inserted_keys.clear();
        self.cascading = 0;
        self.load_counter = 0;
        self.flushing = false;
        self.has_non_read_only_entities = false;
    }

    pub fn is_empty(&self) -> bool {
        self.entities_by_key.is_empty() && self.collection_entries.is_empty()
    }
}

impl fmt::Debug for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("entity_mode", &self.entity_mode)
            .field("entities", &self.entities_by_key.len())
            .field("entries", &self.entity_entries.len())
            .field("proxies", &self.proxies_by_key.len())
            .field("collections", &self.collection_entries.len())
            .field("cascading", &self.cascading)
            .field("load_counter", &self.load_counter)
            .field("flushing", &self.flushing)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for PersistenceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PersistenceContext[entityKeys=[")?;
        for (i, key) in self.entities_by_key.keys().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", key)?;
        }
        write!(f, "],collectionKeys=[")?;
        for (i, key) in self.collections_by_key.keys().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", key)?;
        }
        write!(f, "]]")
    }
}
