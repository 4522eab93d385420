//! Persisted layout of a [`PersistenceContext`].
//!
//! The context is written as a header followed by nine fixed sections,
//! always in the same order:
//!
//! 1. entities by key
//! 2. entities by unique key
//! 3. proxies by key
//! 4. entity snapshots by key
//! 5. entity entries
//! 6. collections by key
//! 7. collection entries
//! 8. array holders
//! 9. nullifiable entity keys
//!
//! Each section is a `u32` record count followed by the records. Integers
//! are big-endian; strings are a `u32` length plus UTF-8; values and
//! property arrays are a `u32` length plus `serde_json`. Handles are written
//! as their raw `(index, generation)` pair so references between restored
//! objects stay valid.
//!
//! Only objects registered with the context are written. A reference to
//! anything else (a transient instance, an unregistered wrapper or a
//! detached proxy) becomes null on restore, and such collection elements
//! are dropped.
//!
//! # Example
//!
//! ```ignore
//! let mut buf = Vec::new();
//! session.persistence_context().serialize(&mut buf)?;
//! let restored = PersistenceContext::deserialize(&mut buf.as_slice(), &registry)?;
//! ```

use std::collections::HashSet;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use unitwork_core::{
    CollectionId, EntityMode, Error, Handle, InstanceId, LockMode, MetadataRegistry, PropertyAccess,
    PropertyValue, ProxyId, RawHandle, Result, Value,
};

use crate::collection::PersistentCollection;
use crate::collection_entry::CollectionEntry;
use crate::entity_entry::{EntityEntry, Status};
use crate::keys::{CollectionKey, EntityKey, EntityUniqueKey};
use crate::persistence_context::{CachedSnapshot, HolderKey, PersistenceContext};
use crate::proxy::EntityProxy;

/// Leading bytes of every persisted context.
pub const MAGIC: &[u8; 4] = b"UOWP";

/// Layout version written by this build.
pub const FORMAT_VERSION: u16 = 1;

const NO_STATUS: u8 = 0xFF;

// ============================================================================
// Primitive frames
// ============================================================================

pub(crate) fn write_str<W: Write>(w: &mut W, s: &str) -> Result<()> {
    w.write_u32::<BigEndian>(frame_len(s.len())?)?;
    w.write_all(s.as_bytes())?;
    Ok(())
}

pub(crate) fn read_str<R: Read>(r: &mut R) -> Result<String> {
    let bytes = read_frame(r)?;
    String::from_utf8(bytes).map_err(|e| Error::Serde(format!("invalid UTF-8 string: {}", e)))
}

pub(crate) fn write_value<W: Write>(w: &mut W, value: &Value) -> Result<()> {
    write_json(w, value)
}

pub(crate) fn read_value<R: Read>(r: &mut R) -> Result<Value> {
    read_json(r)
}

fn write_json<W: Write, T: Serialize + ?Sized>(w: &mut W, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    w.write_u32::<BigEndian>(frame_len(bytes.len())?)?;
    w.write_all(&bytes)?;
    Ok(())
}

fn read_json<R: Read, T: DeserializeOwned>(r: &mut R) -> Result<T> {
    let bytes = read_frame(r)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// The length prefix is untrusted, so the buffer grows with the bytes
/// actually read.
fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>> {
    let len = r.read_u32::<BigEndian>()?;
    let mut bytes = Vec::new();
    r.by_ref().take(u64::from(len)).read_to_end(&mut bytes)?;
    if bytes.len() != len as usize {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("frame of {} bytes ends after {}", len, bytes.len()),
        )));
    }
    Ok(bytes)
}

fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Serde(format!("frame of {} bytes is too large", len)))
}

fn write_bool<W: Write>(w: &mut W, b: bool) -> Result<()> {
    w.write_u8(u8::from(b))?;
    Ok(())
}

fn read_bool<R: Read>(r: &mut R) -> Result<bool> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(Error::Serde(format!("invalid boolean byte {}", other))),
    }
}

fn write_opt_str<W: Write>(w: &mut W, s: Option<&str>) -> Result<()> {
    write_bool(w, s.is_some())?;
    if let Some(s) = s {
        write_str(w, s)?;
    }
    Ok(())
}

fn read_opt_str<R: Read>(r: &mut R) -> Result<Option<String>> {
    if read_bool(r)? { read_str(r).map(Some) } else { Ok(None) }
}

fn write_handle<W: Write, K: Handle>(w: &mut W, handle: K) -> Result<()> {
    let raw = handle.raw();
    w.write_u32::<BigEndian>(raw.index)?;
    w.write_u32::<BigEndian>(raw.generation)?;
    Ok(())
}

fn read_handle<R: Read, K: Handle>(r: &mut R) -> Result<K> {
    let index = r.read_u32::<BigEndian>()?;
    let generation = r.read_u32::<BigEndian>()?;
    Ok(K::from_raw(RawHandle { index, generation }))
}

fn write_count<W: Write>(w: &mut W, count: usize) -> Result<()> {
    w.write_u32::<BigEndian>(frame_len(count)?)?;
    Ok(())
}

fn read_count<R: Read>(r: &mut R) -> Result<usize> {
    Ok(r.read_u32::<BigEndian>()? as usize)
}

// ============================================================================
// Records
// ============================================================================

fn write_instance<W: Write>(w: &mut W, instance: &dyn PropertyAccess) -> Result<()> {
    write_str(w, instance.entity_name())?;
    write_json(w, &instance.identifier())?;
    write_json(w, &instance.property_values())
}

fn read_instance<R: Read>(r: &mut R, registry: &MetadataRegistry) -> Result<Box<dyn PropertyAccess>> {
    let entity_name = read_str(r)?;
    let id: Option<Value> = read_json(r)?;
    let values: Vec<PropertyValue> = read_json(r)?;
    let persister = registry.entity_persister(&entity_name)?;
    let mut instance = persister.instantiate(id.as_ref());
    instance.set_property_values(&values);
    Ok(instance)
}

fn write_entity_entry<W: Write>(w: &mut W, entry: &EntityEntry) -> Result<()> {
    w.write_u8(entry.status.as_u8())?;
    w.write_u8(entry.previous_status.map_or(NO_STATUS, Status::as_u8))?;
    write_json(w, &entry.loaded_state)?;
    write_json(w, &entry.deleted_state)?;
    write_value(w, &entry.id)?;
    write_json(w, &entry.version)?;
    w.write_u8(entry.lock_mode.as_u8())?;
    write_bool(w, entry.exists_in_database)?;
    write_str(w, &entry.entity_name)?;
    write_str(w, &entry.root_entity_name)?;
    w.write_u8(entry.entity_mode.as_u8())?;
    write_bool(w, entry.mutable)?;
    write_json(w, &entry.row_id)?;
    write_bool(w, entry.being_replicated)?;
    write_bool(w, entry.lazy_properties_unfetched)
}

fn read_status<R: Read>(r: &mut R) -> Result<Status> {
    let tag = r.read_u8()?;
    Status::from_u8(tag).ok_or_else(|| Error::Serde(format!("unknown status tag {}", tag)))
}

fn read_entity_entry<R: Read>(r: &mut R) -> Result<EntityEntry> {
    let status = read_status(r)?;
    let previous_status = match r.read_u8()? {
        NO_STATUS => None,
        tag => Some(Status::from_u8(tag).ok_or_else(|| Error::Serde(format!("unknown status tag {}", tag)))?),
    };
    let loaded_state = read_json(r)?;
    let deleted_state = read_json(r)?;
    let id = read_value(r)?;
    let version = read_json(r)?;
    let lock_tag = r.read_u8()?;
    let lock_mode =
        LockMode::from_u8(lock_tag).ok_or_else(|| Error::Serde(format!("unknown lock mode tag {}", lock_tag)))?;
    let exists_in_database = read_bool(r)?;
    let entity_name = read_str(r)?;
    let root_entity_name = read_str(r)?;
    let mode_tag = r.read_u8()?;
    let entity_mode =
        EntityMode::from_u8(mode_tag).ok_or_else(|| Error::Serde(format!("unknown entity mode tag {}", mode_tag)))?;
    Ok(EntityEntry {
        status,
        previous_status,
        loaded_state,
        deleted_state,
        id,
        version,
        lock_mode,
        exists_in_database,
        entity_name,
        root_entity_name,
        entity_mode,
        mutable: read_bool(r)?,
        row_id: read_json(r)?,
        being_replicated: read_bool(r)?,
        lazy_properties_unfetched: read_bool(r)?,
    })
}

/// Only the loaded state of a collection entry survives; the flush flags
/// are reset.
fn write_collection_entry<W: Write>(w: &mut W, entry: &CollectionEntry) -> Result<()> {
    write_json(w, &entry.snapshot)?;
    write_opt_str(w, entry.role.as_deref())?;
    write_opt_str(w, entry.loaded_role.as_deref())?;
    write_json(w, &entry.loaded_key)
}

fn read_collection_entry<R: Read>(r: &mut R) -> Result<CollectionEntry> {
    Ok(CollectionEntry {
        snapshot: read_json(r)?,
        role: read_opt_str(r)?,
        loaded_role: read_opt_str(r)?,
        loaded_key: read_json(r)?,
        ..CollectionEntry::default()
    })
}

/// Handles of the objects a restored context holds.
struct Written {
    instances: HashSet<InstanceId>,
    proxies: HashSet<ProxyId>,
    collections: HashSet<CollectionId>,
}

impl Written {
    fn of(context: &PersistenceContext) -> Self {
        Self {
            instances: context.instances.iter().map(|(id, _)| id).collect(),
            proxies: context.proxies.iter().map(|(id, _)| id).collect(),
            collections: context.collections.iter().map(|(id, _)| id).collect(),
        }
    }

    fn holds(&self, value: &PropertyValue) -> bool {
        match value {
            PropertyValue::Entity(id) => self.instances.contains(id),
            PropertyValue::Proxy(id) => self.proxies.contains(id),
            PropertyValue::Collection(id) => self.collections.contains(id),
            _ => true,
        }
    }

    /// Null out references to objects that were not written. Returns the
    /// number of references dropped.
    fn null_missing(&self, values: &mut [PropertyValue]) -> usize {
        let mut dropped = 0;
        for value in values {
            if let PropertyValue::Component(inner) = value {
                dropped += self.null_missing(inner);
            } else if !self.holds(value) {
                *value = PropertyValue::Null;
                dropped += 1;
            }
        }
        dropped
    }
}

/// Clear every reference that points outside the restored context.
fn drop_unwritten_references(context: &mut PersistenceContext) {
    let written = Written::of(context);
    let mut dropped = 0;

    let handles: Vec<InstanceId> = written.instances.iter().copied().collect();
    for handle in handles {
        if let Some(instance) = context.instances.get_mut(handle) {
            let mut values = instance.property_values();
            let missing = written.null_missing(&mut values);
            if missing > 0 {
                instance.set_property_values(&values);
                dropped += missing;
            }
        }
    }
    for entry in context.entity_entries.values_mut() {
        for state in [&mut entry.loaded_state, &mut entry.deleted_state].into_iter().flatten() {
            dropped += written.null_missing(state);
        }
    }
    for (_, wrapper) in context.collections.iter_mut() {
        wrapper.retain_elements(|e| written.holds(e));
    }
    for entry in context.collection_entries.values_mut() {
        if let Some(snapshot) = &mut entry.snapshot {
            snapshot.retain(|e| written.holds(e));
        }
    }

    if dropped > 0 {
        tracing::debug!(dropped, "references to objects outside the context restored as null");
    }
}

fn restore<K: Handle, T>(arena: &mut unitwork_core::Arena<K, T>, handle: K, value: T, what: &str) -> Result<()> {
    arena
        .insert_at(handle, value)
        .map_err(|_| Error::Serde(format!("duplicate {} handle {:?}", what, handle)))
}

// ============================================================================
// Context
// ============================================================================

impl PersistenceContext {
    /// Write the context in the persisted layout.
    #[tracing::instrument(level = "debug", skip(self, w), fields(entities = self.entities_by_key.len()))]
    pub fn serialize<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(MAGIC)?;
        w.write_u16::<BigEndian>(FORMAT_VERSION)?;
        write_bool(w, self.default_read_only)?;
        write_bool(w, self.has_non_read_only_entities)?;
        w.write_u8(self.entity_mode().as_u8())?;

        // 1. entities by key, each with its instance state
        write_count(w, self.entities_by_key.len())?;
        for (key, instance) in &self.entities_by_key {
            key.write_to(w)?;
            write_handle(w, *instance)?;
            let state = self.instances.get(*instance).ok_or_else(|| {
                Error::assertion(format!("entity {} is bound to a freed handle {}", key, instance))
            })?;
            write_instance(w, &**state)?;
        }

        // 2. entities by unique key
        write_count(w, self.entities_by_unique_key.len())?;
        for (key, instance) in &self.entities_by_unique_key {
            key.write_to(w)?;
            write_handle(w, *instance)?;
        }

        // 3. proxies by key
        write_count(w, self.proxies_by_key.len())?;
        for (key, proxy) in &self.proxies_by_key {
            key.write_to(w)?;
            match self.proxies.get(*proxy) {
                Some(record) => {
                    w.write_u8(1)?;
                    write_handle(w, *proxy)?;
                    write_json(w, record)?;
                }
                None => w.write_u8(0)?,
            }
        }

        // 4. entity snapshots by key
        write_count(w, self.entity_snapshots_by_key.len())?;
        for (key, snapshot) in &self.entity_snapshots_by_key {
            key.write_to(w)?;
            match snapshot {
                CachedSnapshot::NoRow => w.write_u8(0)?,
                CachedSnapshot::Row(state) => {
                    w.write_u8(1)?;
                    write_json(w, state)?;
                }
            }
        }

        // 5. entity entries
        write_count(w, self.entity_entries.len())?;
        for (instance, entry) in self.entity_entries.iter() {
            write_handle(w, instance)?;
            write_entity_entry(w, entry)?;
        }

        // 6. collections by key
        write_count(w, self.collections_by_key.len())?;
        for (key, collection) in &self.collections_by_key {
            key.write_to(w)?;
            write_handle(w, *collection)?;
        }

        // 7. collection entries, each with its wrapper
        write_count(w, self.collection_entries.len())?;
        for (collection, entry) in self.collection_entries.iter() {
            write_handle(w, collection)?;
            let wrapper = self.collections.get(collection).ok_or_else(|| {
                Error::assertion(format!("collection entry for a freed handle {}", collection))
            })?;
            write_json(w, wrapper)?;
            write_collection_entry(w, entry)?;
        }

        // 8. array holders
        write_count(w, self.array_holders.len())?;
        for (holder, collection) in &self.array_holders {
            write_handle(w, holder.owner)?;
            write_count(w, holder.property)?;
            write_handle(w, *collection)?;
        }

        // 9. nullifiable entity keys
        write_count(w, self.nullifiable_entity_keys.len())?;
        for key in &self.nullifiable_entity_keys {
            key.write_to(w)?;
        }

        tracing::debug!(
            entries = self.entity_entries.len(),
            collections = self.collection_entries.len(),
            "serialized persistence context"
        );
        Ok(())
    }

    /// Rebuild a context from the persisted layout.
    ///
    /// Instances are re-created through their persisters; every handle keeps
    /// the value it had when written.
    #[tracing::instrument(level = "debug", skip(r, registry))]
    pub fn deserialize<R: Read>(r: &mut R, registry: &MetadataRegistry) -> Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::Serde(format!("bad magic {:?}", magic)));
        }
        let version = r.read_u16::<BigEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::Serde(format!("unsupported format version {}", version)));
        }
        let default_read_only = read_bool(r)?;
        let has_non_read_only_entities = read_bool(r)?;
        let mode_tag = r.read_u8()?;
        let entity_mode =
            EntityMode::from_u8(mode_tag).ok_or_else(|| Error::Serde(format!("unknown entity mode tag {}", mode_tag)))?;

        let mut context = PersistenceContext::new(entity_mode);
        context.default_read_only = default_read_only;

        // 1. entities by key
        for _ in 0..read_count(r)? {
            let key = EntityKey::read_from(r)?;
            let handle = read_handle(r)?;
            let instance = read_instance(r, registry)?;
            restore(&mut context.instances, handle, instance, "instance")?;
            context.entities_by_key.insert(key, handle);
        }

        // 2. entities by unique key
        for _ in 0..read_count(r)? {
            let key = EntityUniqueKey::read_from(r)?;
            let handle = read_handle(r)?;
            context.entities_by_unique_key.insert(key, handle);
        }

        // 3. proxies by key
        for _ in 0..read_count(r)? {
            let key = EntityKey::read_from(r)?;
            if r.read_u8()? == 0 {
                tracing::trace!(key = %key, "encountered stale proxy reference, dropping it");
                continue;
            }
            let handle = read_handle(r)?;
            let mut proxy: EntityProxy = read_json(r)?;
            proxy.set_attached(true);
            restore(&mut context.proxies, handle, proxy, "proxy")?;
            context.proxies_by_key.insert(key, handle);
        }

        // 4. entity snapshots by key
        for _ in 0..read_count(r)? {
            let key = EntityKey::read_from(r)?;
            let snapshot = match r.read_u8()? {
                0 => CachedSnapshot::NoRow,
                1 => CachedSnapshot::Row(read_json(r)?),
                tag => return Err(Error::Serde(format!("unknown snapshot tag {}", tag))),
            };
            context.entity_snapshots_by_key.insert(key, snapshot);
        }

        // 5. entity entries
        for _ in 0..read_count(r)? {
            let handle = read_handle(r)?;
            let entry = read_entity_entry(r)?;
            if !context.instances.contains(handle) {
                return Err(Error::Serde(format!(
                    "entry {} refers to an instance that was not written",
                    entry.entity_key()
                )));
            }
            context.entity_entries.insert(handle, entry);
        }
        context.has_non_read_only_entities = has_non_read_only_entities;

        // 6. collections by key
        let mut keyed = Vec::new();
        for _ in 0..read_count(r)? {
            let key = CollectionKey::read_from(r)?;
            let handle = read_handle(r)?;
            keyed.push((key, handle));
        }

        // 7. collection entries
        for _ in 0..read_count(r)? {
            let handle = read_handle(r)?;
            let mut wrapper: PersistentCollection = read_json(r)?;
            let entry = read_collection_entry(r)?;
            wrapper.set_current_session();
            restore(&mut context.collections, handle, wrapper, "collection")?;
            context.collection_entries.insert(handle, entry);
        }
        for (key, handle) in keyed {
            if !context.collections.contains(handle) {
                return Err(Error::Serde(format!("{} refers to a collection that was not written", key)));
            }
            context.collections_by_key.insert(key, handle);
        }

        // 8. array holders
        for _ in 0..read_count(r)? {
            let owner = read_handle(r)?;
            let property = read_count(r)?;
            let collection = read_handle(r)?;
            context
                .array_holders
                .insert(HolderKey { owner, property }, collection);
        }

        // 9. nullifiable entity keys
        for _ in 0..read_count(r)? {
            context.nullifiable_entity_keys.insert(EntityKey::read_from(r)?);
        }

        context.instances.rebuild_free_list();
        context.proxies.rebuild_free_list();
        context.collections.rebuild_free_list();
        drop_unwritten_references(&mut context);

        tracing::debug!(
            entries = context.entity_entries.len(),
            collections = context.collection_entries.len(),
            "deserialized persistence context"
        );
        Ok(context)
    }
}
