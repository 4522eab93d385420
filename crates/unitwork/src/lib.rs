//! unitwork - a unit-of-work engine for object/relational persistence.
//!
//! unitwork keeps track of every object loaded or scheduled for writing
//! within one logical transaction, and decides how and when those writes
//! reach the database:
//!
//! - One managed instance per row (identity map), with loaded-state
//!   snapshots for dirty checking
//! - Ordered flush: inserts, updates, collection writes and deletes in a
//!   fixed category order, with optional insert regrouping for batching
//! - Cascades over associations and collections, including orphan delete
//! - Two-phase load, so cyclic object graphs materialize without recursion
//! - A versioned binary layout for carrying a persistence context across
//!   processes
//!
//! SQL generation and statement execution stay outside: the engine talks
//! to them through [`EntityPersister`], [`CollectionPersister`] and
//! [`Batcher`].
//!
//! # Quick Start
//!
//! ```ignore
//! use unitwork::prelude::*;
//!
//! let customer = EntityMetadata::new("Customer").property(PropertyInfo::scalar("name").not_null());
//! let factory = SessionFactory::builder()
//!     .entity(Arc::new(MemoryEntityPersister::new(customer)))
//!     .build()?;
//!
//! let batcher = RecordingBatcher::new();
//! let mut session = factory.open_session(batcher.clone());
//!
//! // Schedule an insert
//! let ada = session.instantiate("Customer", None)?;
//! session
//!     .persistence_context_mut()
//!     .instance_mut(ada)
//!     .unwrap()
//!     .set_property(0, Value::from("Ada").into());
//! session.persist("Customer", ada)?;
//!
//! // Execute it
//! session.flush()?;
//! session.after_transaction_completion(true)?;
//! assert_eq!(batcher.labels(), vec!["insert Customer#1"]);
//! ```
//!
//! # Crates
//!
//! - `unitwork-core`: values, handles, metadata and persister contracts,
//!   cascade styles, cache contracts, errors
//! - `unitwork-session`: persistence context, action queue, cascades,
//!   two-phase load, session and flush

pub mod factory;

pub use factory::{SessionFactory, SessionFactoryBuilder};

pub use unitwork_core::memory::{MemoryCollectionPersister, MemoryEntityPersister};
pub use unitwork_core::{
    Arena, CacheEntry, CacheError, CacheKey, CacheMode, CascadeKind, CascadePoint, CascadeStyle, CollectionId,
    CollectionKind, CollectionMetadata, CollectionPersister, DynamicEntity, EntityMetadata, EntityMode,
    EntityPersister, EntityRegionAccess, Error, ForeignKeyDirection, Handle, InstanceId, LockMode,
    MetadataRegistry, PropertyAccess, PropertyInfo, PropertyType, PropertyValue, ProxyId, RawHandle, Result,
    UpdateTimestampsCache, Value,
};

pub use unitwork_session::{
    Action, ActionQueue, Batcher, BulkCleanupAction, Cascade, CascadeArgs, CascadingAction, CollectionAction,
    CollectionEntry, CollectionKey, ElementIdentity, EntityDeleteAction, EntityEntry, EntityInsertAction, EntityKey, EntityProxy,
    EntityRef, EntityState, EntityUniqueKey, EntityUpdateAction, FORMAT_VERSION, LoadEventListener, MAGIC,
    PersistenceContext, PersistentCollection, PostLoadEvent, PreLoadEvent, QueuedOperation, RecordingBatcher,
    ReplicationMode, Session, SessionConfig, SessionEvent,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use unitwork::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Batcher, CascadeKind, CascadeStyle, CollectionId, CollectionKind, CollectionMetadata, CollectionPersister,
        DynamicEntity, EntityMetadata, EntityPersister, EntityRef, EntityState, Error, ForeignKeyDirection,
        InstanceId, LockMode, MemoryCollectionPersister, MemoryEntityPersister, PropertyAccess, PropertyInfo,
        PropertyValue, RecordingBatcher, ReplicationMode, Result, Session, SessionConfig, SessionFactory, Value,
    };
    pub use std::sync::Arc;
}
