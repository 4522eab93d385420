//! Two-phase materialization of loaded rows.
//!
//! Loading is split so that cyclic graphs terminate:
//!
//! 1. [`post_hydrate`] binds the new instance under its key and registers a
//!    `Loading` entry holding the raw row, before anything else is loaded.
//! 2. [`initialize_entity`] resolves associations. A reference back to an
//!    instance still in phase 1 finds it already bound and reuses it.
//!
//! Nested loads only queue non-lazy collections; the outermost load
//! initializes them (see [`Session::initialize_non_lazy_collections`]).

use std::sync::Arc;

use unitwork_core::{
    CacheEntry, CacheKey, CacheMode, EntityPersister, Error, InstanceId, LockMode, PropertyType,
    PropertyValue, Result, Value,
};

use crate::collection::PersistentCollection;
use crate::entity_entry::{EntityEntry, Status};
use crate::listener::{PostLoadEvent, PreLoadEvent};
use crate::proxy::EntityRef;
use crate::session::Session;

/// Phase 1: register `instance` as loading with its hydrated row.
///
/// No association is resolved here, so the instance is findable by key
/// before any of the entities it references are loaded.
pub fn post_hydrate(
    session: &mut Session,
    persister: &dyn EntityPersister,
    id: Value,
    values: Vec<PropertyValue>,
    row_id: Option<Value>,
    instance: InstanceId,
    lock_mode: LockMode,
    lazy_properties_unfetched: bool,
) -> Result<()> {
    let metadata = persister.metadata();
    let version = metadata.version_of(&values);
    let entry = EntityEntry::new(Status::Loading, id, metadata, session.context.entity_mode())
        .with_loaded_state(Some(values))
        .with_version(version)
        .with_lock_mode(lock_mode)
        .existing(true)
        .with_row_id(row_id)
        .with_lazy_properties_unfetched(lazy_properties_unfetched);
    tracing::trace!(entry = %entry, "hydrated entity");
    session.context.add_entity_with_entry(instance, entry)?;
    Ok(())
}

/// Phase 2: resolve the hydrated state and finish the entry.
#[tracing::instrument(level = "debug", skip(session))]
pub fn initialize_entity(session: &mut Session, instance: InstanceId, read_only: bool) -> Result<()> {
    let entry = session
        .context
        .get_entry(instance)
        .ok_or_else(|| Error::assertion("possible non-threadsafe access to the session"))?;
    let entity_name = entry.entity_name().to_owned();
    let id = entry.id().clone();
    let version = entry.version().cloned();
    let lazy_properties_unfetched = entry.has_lazy_properties_unfetched();
    let hydrated = entry.loaded_state().map(<[PropertyValue]>::to_vec).unwrap_or_default();

    let persister = Arc::clone(session.registry().entity_persister(&entity_name)?);
    let metadata = persister.metadata();
    tracing::debug!(entity = %entity_name, id = %id, "resolving associations");

    let mut state = Vec::with_capacity(hydrated.len());
    for (index, value) in hydrated.into_iter().enumerate() {
        let resolved = match (value, metadata.properties.get(index)) {
            (PropertyValue::Unfetched, _) => PropertyValue::Unfetched,
            (value, Some(property)) => {
                resolve_value(session, value, &property.property_type, Some(instance), Some(index), &id)?
            }
            (value, None) => value,
        };
        state.push(resolved);
    }

    for listener in session.load_listeners() {
        listener.on_pre_load(&PreLoadEvent {
            instance,
            entity_name: &entity_name,
            id: &id,
            state: &state,
        })?;
    }
    session.context.require_instance_mut(instance)?.set_property_values(&state);

    let config = session.config();
    let put_enabled = config.second_level_cache_enabled && config.cache_mode.is_put_enabled();
    if let (true, Some(region)) = (put_enabled, persister.cache()) {
        if metadata.lazy_properties_cacheable || !lazy_properties_unfetched {
            let minimal_put = config.minimal_puts && config.cache_mode != CacheMode::Refresh;
            let cache_entry = CacheEntry {
                subclass: entity_name.clone(),
                disassembled_state: disassemble(session, &state),
                version: version.clone(),
                lazy_properties_unfetched,
            };
            let put = region.put_from_load(
                &CacheKey::new(entity_name.clone(), id.clone()),
                &cache_entry,
                session.timestamp(),
                version.as_ref(),
                minimal_put,
            )?;
            tracing::trace!(entity = %entity_name, put, "second-level cache put from load");
        }
    }

    let key = session.context.entity_key(id.clone(), metadata);
    let proxy = session.context.get_proxy(&key);
    let really_read_only = if !metadata.mutable {
        true
    } else if let Some(proxy) = proxy.and_then(|p| session.context.proxy(p)) {
        proxy.is_read_only()
    } else {
        read_only
    };

    if really_read_only {
        session.context.set_entry_status(instance, Status::ReadOnly)?;
    } else {
        if let Some(entry) = session.context.get_entry_mut(instance) {
            entry.loaded_state = Some(state.clone());
        }
        session.context.set_entry_status(instance, Status::Managed)?;
    }

    if let Some(record) = proxy.and_then(|p| session.context.proxies.get_mut(p)) {
        record.set_implementation(instance);
    }

    for listener in session.load_listeners() {
        listener.on_post_load(&PostLoadEvent {
            instance,
            entity_name: &entity_name,
            id: &id,
            read_only: really_read_only,
        })?;
    }
    tracing::debug!(entity = %entity_name, id = %id, read_only = really_read_only, "done materializing entity");
    Ok(())
}

/// Turn one hydrated value into its managed form.
///
/// `index` is the owner property position for top-level values and is
/// used to register array holders. Without an owner (collection elements)
/// nested collections resolve to null.
pub(crate) fn resolve_value(
    session: &mut Session,
    value: PropertyValue,
    property_type: &PropertyType,
    owner: Option<InstanceId>,
    index: Option<usize>,
    owner_id: &Value,
) -> Result<PropertyValue> {
    match (value, property_type) {
        (_, PropertyType::Collection { role }) => match owner {
            Some(owner) => resolve_collection(session, role, owner, index, owner_id),
            None => Ok(PropertyValue::Null),
        },
        (PropertyValue::Unresolved { entity_name, id }, _) => {
            let nullable = matches!(property_type, PropertyType::OneToOne { .. });
            Ok(session
                .internal_load(&entity_name, id, false, nullable)?
                .map_or(PropertyValue::Null, EntityRef::to_value))
        }
        (PropertyValue::Component(values), PropertyType::Component { properties }) => {
            let mut resolved = Vec::with_capacity(values.len());
            for (i, value) in values.into_iter().enumerate() {
                resolved.push(match properties.get(i) {
                    Some(property) => {
                        resolve_value(session, value, &property.property_type, owner, None, owner_id)?
                    }
                    None => value,
                });
            }
            Ok(PropertyValue::Component(resolved))
        }
        (value, _) => Ok(value),
    }
}

/// The wrapper for the collection of `owner` under `role`: the one already
/// registered for the key, a parked unowned one, or a new uninitialized
/// wrapper.
fn resolve_collection(
    session: &mut Session,
    role: &str,
    owner: InstanceId,
    index: Option<usize>,
    owner_id: &Value,
) -> Result<PropertyValue> {
    let persister = Arc::clone(session.registry().collection_persister(role)?);
    let metadata = persister.metadata();
    let key = session.context.collection_key(role, owner_id.clone());

    let collection = if let Some(existing) = session.context.get_collection(&key) {
        existing
    } else if let Some(unowned) = session.context.use_unowned_collection(&key) {
        unowned
    } else {
        let wrapper = PersistentCollection::uninitialized(role, metadata.kind, owner_id.clone());
        let collection = session.context.register_collection(wrapper);
        session
            .context
            .add_uninitialized_collection(metadata, collection, owner_id.clone())?;
        if !metadata.lazy {
            session.context.add_non_lazy_collection(collection);
        }
        tracing::trace!(role = %role, key = %owner_id, "created uninitialized collection");
        collection
    };

    session.context.require_collection_mut(collection)?.set_owner(owner);
    if let (unitwork_core::CollectionKind::Array, Some(index)) = (metadata.kind, index) {
        session.context.add_collection_holder(owner, index, collection);
    }
    Ok(PropertyValue::Collection(collection))
}

/// State as stored in a cache region: references by identifier, no
/// collections.
fn disassemble(session: &Session, state: &[PropertyValue]) -> Vec<PropertyValue> {
    state
        .iter()
        .map(|value| match value {
            PropertyValue::Entity(instance) => session
                .context
                .get_entry(*instance)
                .map_or(PropertyValue::Null, |entry| PropertyValue::Unresolved {
                    entity_name: entry.entity_name().to_owned(),
                    id: entry.id().clone(),
                }),
            PropertyValue::Proxy(proxy) => session
                .context
                .proxy(*proxy)
                .map_or(PropertyValue::Null, |record| PropertyValue::Unresolved {
                    entity_name: record.entity_name().to_owned(),
                    id: record.id().clone(),
                }),
            PropertyValue::Collection(_) => PropertyValue::Null,
            PropertyValue::Component(values) => PropertyValue::Component(disassemble(session, values)),
            other => other.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use unitwork_core::memory::{MemoryCollectionPersister, MemoryEntityPersister};
    use unitwork_core::{
        CacheError, CollectionKind, CollectionMetadata, EntityMetadata, EntityRegionAccess,
        MetadataRegistry, PropertyInfo,
    };

    use crate::action::RecordingBatcher;
    use crate::listener::LoadEventListener;
    use crate::SessionConfig;

    #[derive(Debug, Default)]
    struct RecordingRegion {
        puts: Mutex<Vec<(CacheKey, bool)>>,
    }

    impl EntityRegionAccess for RecordingRegion {
        fn put_from_load(
            &self,
            key: &CacheKey,
            _entry: &CacheEntry,
            _timestamp: i64,
            _version: Option<&Value>,
            minimal_put_override: bool,
        ) -> std::result::Result<bool, CacheError> {
            self.puts.lock().unwrap().push((key.clone(), minimal_put_override));
            Ok(true)
        }
    }

    #[derive(Debug, Default)]
    struct CountingListener {
        events: Mutex<Vec<String>>,
    }

    impl LoadEventListener for CountingListener {
        fn on_pre_load(&self, event: &PreLoadEvent<'_>) -> Result<()> {
            self.events.lock().unwrap().push(format!("pre {}#{}", event.entity_name, event.id));
            Ok(())
        }

        fn on_post_load(&self, event: &PostLoadEvent<'_>) -> Result<()> {
            self.events.lock().unwrap().push(format!("post {}#{}", event.entity_name, event.id));
            Ok(())
        }
    }

    fn unresolved(entity_name: &str, id: i64) -> PropertyValue {
        PropertyValue::Unresolved {
            entity_name: entity_name.to_string(),
            id: Value::BigInt(id),
        }
    }

    /// Node(name, next -> Node, children: Node.children)
    fn fixture() -> (Arc<MemoryEntityPersister>, Arc<MemoryCollectionPersister>, Arc<RecordingRegion>, MetadataRegistry) {
        let region = Arc::new(RecordingRegion::default());
        let nodes = Arc::new(
            MemoryEntityPersister::new(
                EntityMetadata::new("Node")
                    .property(PropertyInfo::scalar("name"))
                    .property(PropertyInfo::many_to_one("next", "Node"))
                    .property(PropertyInfo::collection("children", "Node.children")),
            )
            .with_cache(region.clone()),
        );
        let children = Arc::new(MemoryCollectionPersister::new(
            CollectionMetadata::new("Node.children", "Node")
                .of_entities("Node")
                .kind(CollectionKind::List)
                .eager(),
        ));
        let mut registry = MetadataRegistry::new();
        registry.register_entity(nodes.clone()).unwrap();
        registry.register_collection(children.clone()).unwrap();
        (nodes, children, region, registry)
    }

    fn session(registry: MetadataRegistry) -> Session {
        Session::new(Arc::new(registry), RecordingBatcher::new())
    }

    #[test]
    fn test_mutual_references_resolve_to_one_instance_each() {
        let (nodes, _, _, registry) = fixture();
        nodes.insert_row(1_i64, vec![PropertyValue::Scalar(Value::from("a")), unresolved("Node", 2), PropertyValue::Null]);
        nodes.insert_row(2_i64, vec![PropertyValue::Scalar(Value::from("b")), unresolved("Node", 1), PropertyValue::Null]);
        let mut session = session(registry);

        let a = session.get("Node", 1_i64).unwrap().unwrap();
        let b = match session.persistence_context().instance(a).unwrap().property(1) {
            PropertyValue::Entity(b) => b,
            other => panic!("expected an instance, got {:?}", other),
        };
        assert_eq!(
            session.persistence_context().instance(b).unwrap().property(1),
            PropertyValue::Entity(a)
        );
        assert_eq!(nodes.load_calls(), 2);
        assert!(session.persistence_context().get_entry(a).unwrap().is_managed());
        assert!(session.persistence_context().get_entry(b).unwrap().is_managed());
        assert!(session.persistence_context().is_load_finished());
    }

    #[test]
    fn test_non_lazy_collections_initialize_after_outermost_load() {
        let (nodes, children, _, registry) = fixture();
        nodes.insert_row(1_i64, vec![PropertyValue::Scalar(Value::from("root")), PropertyValue::Null, PropertyValue::Null]);
        nodes.insert_row(2_i64, vec![PropertyValue::Scalar(Value::from("leaf")), PropertyValue::Null, PropertyValue::Null]);
        children.set_elements(1_i64, vec![unresolved("Node", 2)]);
        let mut session = session(registry);

        let root = session.get("Node", 1_i64).unwrap().unwrap();
        let PropertyValue::Collection(collection) = session.persistence_context().instance(root).unwrap().property(2) else {
            panic!("children should be a collection");
        };
        let wrapper = session.persistence_context().collection(collection).unwrap();
        assert!(wrapper.was_initialized());
        assert_eq!(wrapper.len(), 1);
        assert_eq!(wrapper.owner(), Some(root));
        // root, leaf, and each of their children collections
        assert_eq!(children.load_calls(), 2);
        let entry = session.persistence_context().get_collection_entry(collection).unwrap();
        assert_eq!(entry.snapshot().map(<[PropertyValue]>::len), Some(1));
    }

    #[test]
    fn test_read_only_default_and_cache_put() {
        let (nodes, _, region, registry) = fixture();
        nodes.insert_row(5_i64, vec![PropertyValue::Scalar(Value::from("x")), PropertyValue::Null, PropertyValue::Null]);
        let mut session = Session::with_config(
            Arc::new(registry),
            RecordingBatcher::new(),
            SessionConfig::default().with_default_read_only(true).with_minimal_puts(true),
        );

        let node = session.get("Node", 5_i64).unwrap().unwrap();
        let entry = session.persistence_context().get_entry(node).unwrap();
        assert!(entry.is_read_only());
        assert!(entry.loaded_state().is_none());

        let puts = region.puts.lock().unwrap().clone();
        assert_eq!(puts, vec![(CacheKey::new("Node", Value::BigInt(5)), true)]);
    }

    #[test]
    fn test_listeners_fire_in_order() {
        let (nodes, _, _, registry) = fixture();
        nodes.insert_row(1_i64, vec![PropertyValue::Scalar(Value::from("a")), unresolved("Node", 1), PropertyValue::Null]);
        let listener = Arc::new(CountingListener::default());
        let mut session = session(registry);
        session.add_load_listener(listener.clone());

        let a = session.get("Node", 1_i64).unwrap().unwrap();
        assert_eq!(
            session.persistence_context().instance(a).unwrap().property(1),
            PropertyValue::Entity(a)
        );
        assert_eq!(*listener.events.lock().unwrap(), vec!["pre Node#1", "post Node#1"]);
    }

    #[test]
    fn test_initialize_without_entry_is_an_assertion() {
        let (_, _, _, registry) = fixture();
        let mut session = session(registry);
        let instance = session.instantiate("Node", None).unwrap();
        let err = initialize_entity(&mut session, instance, false).unwrap_err();
        assert!(err.is_fatal());
    }
}
