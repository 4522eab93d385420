//! Session and unit of work for unitwork.
//!
//! `unitwork-session` is the **tracking layer**. It keeps one managed
//! instance per database row, remembers what every instance looked like
//! when it was loaded, and turns the difference into ordered writes.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: identity map, entity and collection entries,
//!   proxies and snapshots ([`PersistenceContext`]).
//! - **Event operations**: persist, save-or-update, merge, delete, lock,
//!   refresh, replicate and evict, with cascades ([`Session`]).
//! - **Action queue**: inserts, updates, deletes and collection writes,
//!   executed in a fixed order on flush ([`ActionQueue`]).
//! - **Two-phase load**: hydrate every row first, then resolve references,
//!   so cycles between rows load cleanly.
//!
//! # Design Philosophy
//!
//! - **Handles, not pointers**: instances, collections and proxies live in
//!   arenas and are referred to by typed handles.
//! - **Explicit writes**: nothing reaches the database until
//!   [`Session::flush`].
//! - **Pluggable persistence**: all I/O goes through the persister traits of
//!   `unitwork-core` and a [`Batcher`].
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(Arc::new(registry), RecordingBatcher::new());
//!
//! // Schedule an insert, cascading to the order lines
//! let order = session.instantiate("Order", None)?;
//! session.persist("Order", order)?;
//!
//! // Get by identifier (uses the identity map)
//! let customer = session.get("Customer", 7_i64)?;
//!
//! // Execute pending writes
//! session.flush()?;
//! session.after_transaction_completion(true)?;
//! ```

pub mod action;
pub mod action_queue;
pub mod cascade;
pub mod collection;
pub mod collection_entry;
pub mod entity_entry;
pub mod flush;
pub mod keys;
pub mod linked_map;
pub mod listener;
pub mod persistence_context;
pub mod proxy;
pub mod serialization;
pub mod session;
pub mod two_phase_load;

pub use action::{
    Action, Batcher, BulkCleanupAction, CollectionAction, EntityDeleteAction, EntityInsertAction,
    EntityUpdateAction, RecordingBatcher,
};
pub use action_queue::ActionQueue;
pub use cascade::{Cascade, CascadeArgs, CascadingAction};
pub use collection::{ElementIdentity, PersistentCollection, QueuedOperation};
pub use collection_entry::CollectionEntry;
pub use entity_entry::EntityEntry;
pub use keys::{CollectionKey, EntityKey, EntityUniqueKey};
pub use listener::{LoadEventListener, PostLoadEvent, PreLoadEvent};
pub use persistence_context::PersistenceContext;
pub use proxy::{EntityProxy, EntityRef};
pub use serialization::{FORMAT_VERSION, MAGIC};
pub use session::{EntityState, ReplicationMode, Session};

use unitwork_core::{CacheMode, EntityMode, Error};

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<(), Error>`.
/// Returning `Err` aborts the operation (e.g. prevents the flush).
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error> + Send>;

/// Holds registered session-level event callbacks.
#[derive(Default)]
pub struct SessionEventCallbacks {
    pub(crate) before_flush: Vec<SessionEventFn>,
    pub(crate) after_flush: Vec<SessionEventFn>,
    pub(crate) after_completion: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("after_completion", &self.after_completion.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    pub(crate) fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::AfterCompletion => &mut self.after_completion,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush computes and executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired after the transaction completed, whatever its outcome.
    AfterCompletion,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Group inserts by entity name, keeping parents before children.
    pub order_inserts: bool,
    /// Sort updates by entity key.
    pub order_updates: bool,
    /// Invalidate query spaces through the timestamps cache.
    pub query_cache_enabled: bool,
    /// Put loaded and written entities into their cache regions.
    pub second_level_cache_enabled: bool,
    /// Skip cache puts for entries that are already cached.
    pub minimal_puts: bool,
    /// Load entities and proxies read-only.
    pub default_read_only: bool,
    /// Reject nulls in non-nullable properties before insert and update.
    pub check_nullability: bool,
    /// Representation of entity instances.
    pub entity_mode: EntityMode,
    /// How loads interact with the second-level cache.
    pub cache_mode: CacheMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            order_inserts: false,
            order_updates: false,
            query_cache_enabled: false,
            second_level_cache_enabled: true,
            minimal_puts: false,
            default_read_only: false,
            check_nullability: true,
            entity_mode: EntityMode::Pojo,
            cache_mode: CacheMode::Normal,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_order_inserts(mut self, enabled: bool) -> Self {
        self.order_inserts = enabled;
        self
    }

    #[must_use]
    pub fn with_order_updates(mut self, enabled: bool) -> Self {
        self.order_updates = enabled;
        self
    }

    #[must_use]
    pub fn with_query_cache(mut self, enabled: bool) -> Self {
        self.query_cache_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_second_level_cache(mut self, enabled: bool) -> Self {
        self.second_level_cache_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_minimal_puts(mut self, enabled: bool) -> Self {
        self.minimal_puts = enabled;
        self
    }

    #[must_use]
    pub fn with_default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = read_only;
        self
    }

    #[must_use]
    pub fn with_check_nullability(mut self, enabled: bool) -> Self {
        self.check_nullability = enabled;
        self
    }

    #[must_use]
    pub fn with_entity_mode(mut self, entity_mode: EntityMode) -> Self {
        self.entity_mode = entity_mode;
        self
    }

    #[must_use]
    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert!(!config.order_inserts);
        assert!(config.second_level_cache_enabled);
        assert!(config.check_nullability);
        assert!(!config.default_read_only);
        assert_eq!(config.entity_mode, EntityMode::Pojo);
        assert_eq!(config.cache_mode, CacheMode::Normal);
    }

    #[test]
    fn test_session_config_builders() {
        let config = SessionConfig::default()
            .with_order_inserts(true)
            .with_default_read_only(true)
            .with_cache_mode(CacheMode::Ignore);
        assert!(config.order_inserts);
        assert!(config.default_read_only);
        assert_eq!(config.cache_mode, CacheMode::Ignore);
    }

    #[test]
    fn test_callbacks_fire_in_order_and_stop_on_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut callbacks = SessionEventCallbacks::default();
        let first = Arc::clone(&calls);
        callbacks.before_flush.push(Box::new(move || {
            first.fetch_add(1, Ordering::SeqCst);
            Err(Error::Custom("veto".to_owned()))
        }));
        let second = Arc::clone(&calls);
        callbacks.before_flush.push(Box::new(move || {
            second.fetch_add(10, Ordering::SeqCst);
            Ok(())
        }));

        assert!(callbacks.fire(SessionEvent::BeforeFlush).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(callbacks.fire(SessionEvent::AfterFlush).is_ok());
    }

    #[test]
    fn test_callbacks_debug_shows_counts() {
        let mut callbacks = SessionEventCallbacks::default();
        callbacks.after_completion.push(Box::new(|| Ok(())));
        let debug = format!("{:?}", callbacks);
        assert!(debug.contains("after_completion: 1"));
    }
}
