//! Core types and contracts for the unitwork engine.
//!
//! `unitwork-core` holds everything the unit of work needs to know about
//! the outside world, without any of the tracking machinery:
//!
//! - [`Value`] and [`PropertyValue`] model identifiers and entity state.
//! - [`Arena`] and the typed handles ([`InstanceId`], [`CollectionId`],
//!   [`ProxyId`]) give managed objects a stable identity.
//! - [`EntityPersister`] / [`CollectionPersister`] and their metadata
//!   describe mappings; [`MetadataRegistry`] looks them up.
//! - [`CascadeStyle`] and [`ForeignKeyDirection`] drive cascading.
//! - [`EntityRegionAccess`] and [`UpdateTimestampsCache`] are the
//!   second-level cache contracts.
//! - [`Error`] is the shared error type.

pub mod cache;
pub mod cascade_style;
pub mod error;
pub mod handle;
pub mod lock;
pub mod memory;
pub mod metadata;
pub mod property;
pub mod registry;
pub mod value;

pub use cache::{
    CacheEntry, CacheError, CacheKey, CacheMode, EntityRegionAccess, UpdateTimestampsCache,
};
pub use cascade_style::{CascadeKind, CascadePoint, CascadeStyle, ForeignKeyDirection};
pub use error::{Error, Result};
pub use handle::{Arena, CollectionId, Handle, InstanceId, ProxyId, RawHandle};
pub use lock::LockMode;
pub use metadata::{
    CollectionKind, CollectionMetadata, CollectionPersister, EntityMetadata, EntityMode,
    EntityPersister, PropertyInfo, PropertyType,
};
pub use property::{DynamicEntity, PropertyAccess, PropertyValue};
pub use registry::MetadataRegistry;
pub use value::Value;
