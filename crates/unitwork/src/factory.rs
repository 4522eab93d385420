//! Session factory for unitwork.
//!
//! A [`SessionFactory`] owns the validated mapping metadata and the shared
//! collaborators (timestamps cache, load listeners). Sessions opened from it
//! share the registry and copy the configuration.
//!
//! # Example
//!
//! ```rust,ignore
//! use unitwork::prelude::*;
//!
//! let factory = SessionFactory::builder()
//!     .entity(Arc::new(MemoryEntityPersister::new(EntityMetadata::new("Customer"))))
//!     .config(SessionConfig::default().with_order_inserts(true))
//!     .build()?;
//!
//! let mut session = factory.open_session(RecordingBatcher::new());
//! ```

use std::sync::Arc;

use unitwork_core::{CollectionPersister, EntityPersister, MetadataRegistry, Result, UpdateTimestampsCache};
use unitwork_session::{Batcher, LoadEventListener, Session, SessionConfig};

/// Shared, immutable source of sessions.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    registry: Arc<MetadataRegistry>,
    config: SessionConfig,
    timestamps: Option<Arc<dyn UpdateTimestampsCache>>,
    load_listeners: Vec<Arc<dyn LoadEventListener>>,
}

impl SessionFactory {
    /// Create a factory builder.
    #[must_use]
    pub fn builder() -> SessionFactoryBuilder {
        SessionFactoryBuilder::new()
    }

    /// Wrap an already populated registry. The registry is validated.
    pub fn from_registry(registry: MetadataRegistry, config: SessionConfig) -> Result<Self> {
        registry.validate()?;
        Ok(Self {
            registry: Arc::new(registry),
            config,
            timestamps: None,
            load_listeners: Vec::new(),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session with the factory's configuration.
    pub fn open_session(&self, batcher: impl Batcher + 'static) -> Session {
        self.open_session_with(batcher, self.config.clone())
    }

    /// Open a session with its own configuration.
    pub fn open_session_with(&self, batcher: impl Batcher + 'static, config: SessionConfig) -> Session {
        tracing::debug!(
            order_inserts = config.order_inserts,
            default_read_only = config.default_read_only,
            "opening session"
        );
        let mut session = Session::with_config(Arc::clone(&self.registry), batcher, config);
        if let Some(timestamps) = &self.timestamps {
            session = session.with_timestamps_cache(Arc::clone(timestamps));
        }
        for listener in &self.load_listeners {
            session.add_load_listener(Arc::clone(listener));
        }
        session
    }
}

/// Builder for [`SessionFactory`] with fluent API.
///
/// Persisters are collected first and registered by [`build`], so a
/// mapping error surfaces once, with the first offending persister.
///
/// [`build`]: SessionFactoryBuilder::build
#[derive(Debug, Default)]
pub struct SessionFactoryBuilder {
    entities: Vec<Arc<dyn EntityPersister>>,
    collections: Vec<Arc<dyn CollectionPersister>>,
    config: SessionConfig,
    timestamps: Option<Arc<dyn UpdateTimestampsCache>>,
    load_listeners: Vec<Arc<dyn LoadEventListener>>,
}

impl SessionFactoryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map an entity type.
    #[must_use]
    pub fn entity(mut self, persister: Arc<dyn EntityPersister>) -> Self {
        self.entities.push(persister);
        self
    }

    /// Map a collection role.
    #[must_use]
    pub fn collection(mut self, persister: Arc<dyn CollectionPersister>) -> Self {
        self.collections.push(persister);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Invalidate query spaces through `timestamps` after writes.
    #[must_use]
    pub fn timestamps_cache(mut self, timestamps: Arc<dyn UpdateTimestampsCache>) -> Self {
        self.timestamps = Some(timestamps);
        self
    }

    /// Observe two-phase load in every session.
    #[must_use]
    pub fn load_listener(mut self, listener: Arc<dyn LoadEventListener>) -> Self {
        self.load_listeners.push(listener);
        self
    }

    /// Register every persister and check that associations resolve.
    pub fn build(self) -> Result<SessionFactory> {
        let mut registry = MetadataRegistry::new();
        for persister in self.entities {
            registry.register_entity(persister)?;
        }
        for persister in self.collections {
            registry.register_collection(persister)?;
        }
        registry.validate()?;
        tracing::info!(
            entities = registry.entity_names().count(),
            "session factory built"
        );
        Ok(SessionFactory {
            registry: Arc::new(registry),
            config: self.config,
            timestamps: self.timestamps,
            load_listeners: self.load_listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unitwork_core::memory::{MemoryCollectionPersister, MemoryEntityPersister};
    use unitwork_core::{CollectionMetadata, EntityMetadata, Error, PropertyInfo};
    use unitwork_session::RecordingBatcher;

    fn customer() -> Arc<dyn EntityPersister> {
        Arc::new(MemoryEntityPersister::new(
            EntityMetadata::new("Customer").property(PropertyInfo::scalar("name")),
        ))
    }

    #[test]
    fn test_build_registers_persisters() {
        let factory = SessionFactory::builder()
            .entity(customer())
            .config(SessionConfig::default().with_order_inserts(true))
            .build()
            .unwrap();
        assert!(factory.registry().entity_persister("Customer").is_ok());

        let session = factory.open_session(RecordingBatcher::new());
        assert!(session.config().order_inserts);
    }

    #[test]
    fn test_build_rejects_duplicate_entity() {
        let err = SessionFactory::builder()
            .entity(customer())
            .entity(customer())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn test_build_rejects_dangling_collection_role() {
        let order = EntityMetadata::new("Order").property(PropertyInfo::collection("lines", "Order.lines"));
        let err = SessionFactory::builder()
            .entity(Arc::new(MemoryEntityPersister::new(order)))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Order.lines"));

        let order = EntityMetadata::new("Order").property(PropertyInfo::collection("lines", "Order.lines"));
        let factory = SessionFactory::builder()
            .entity(Arc::new(MemoryEntityPersister::new(order)))
            .collection(Arc::new(MemoryCollectionPersister::new(CollectionMetadata::new(
                "Order.lines",
                "Order",
            ))))
            .build();
        assert!(factory.is_ok());
    }

    #[test]
    fn test_open_session_with_overrides_config() {
        let factory = SessionFactory::builder().entity(customer()).build().unwrap();
        let session = factory.open_session_with(
            RecordingBatcher::new(),
            SessionConfig::default().with_default_read_only(true),
        );
        assert!(session.is_default_read_only());
        assert!(!factory.config().default_read_only);
    }
}
