//! Second-level cache contracts.
//!
//! The engine never implements cache regions itself. It calls out through
//! [`EntityRegionAccess`] when a freshly loaded entity should be cached and
//! when a write completes, and through [`UpdateTimestampsCache`] to
//! invalidate cached query results touching the written tables.

use std::fmt;

use crate::property::PropertyValue;
use crate::Value;

/// Failure reported by a cache region.
///
/// Cache failures during after-completion are logged and skipped; anywhere
/// else they propagate as [`crate::Error::Cache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheError {
    pub message: String,
}

impl CacheError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CacheError {}

/// Key of an entity in its cache region.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity_or_role: String,
    pub key: Value,
}

impl CacheKey {
    #[must_use]
    pub fn new(entity_or_role: impl Into<String>, key: Value) -> Self {
        Self {
            entity_or_role: entity_or_role.into(),
            key,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_or_role, self.key)
    }
}

/// Disassembled entity state as stored in a region.
///
/// Entity references are stored by identifier (as
/// [`PropertyValue::Unresolved`]); collections are not stored inline.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub subclass: String,
    pub disassembled_state: Vec<PropertyValue>,
    pub version: Option<Value>,
    pub lazy_properties_unfetched: bool,
}

/// How a session interacts with the second-level cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Read from and write to the cache.
    #[default]
    Normal,
    /// Read only; never put.
    Get,
    /// Write only; never read.
    Put,
    /// Write only, overriding minimal puts.
    Refresh,
    /// Neither read nor write.
    Ignore,
}

impl CacheMode {
    pub const fn is_put_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }

    pub const fn is_get_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }
}

/// Access strategy for an entity cache region.
pub trait EntityRegionAccess: fmt::Debug + Send + Sync {
    /// Offer a freshly loaded entity to the cache.
    ///
    /// Returns whether the entry was actually stored. With
    /// `minimal_put_override` the region may skip the put when the key is
    /// already present.
    fn put_from_load(
        &self,
        key: &CacheKey,
        entry: &CacheEntry,
        timestamp: i64,
        version: Option<&Value>,
        minimal_put_override: bool,
    ) -> Result<bool, CacheError>;

    /// Release whatever a write to `key` locked, once the transaction ends.
    fn release(&self, key: &CacheKey, committed: bool) -> Result<(), CacheError> {
        let _ = (key, committed);
        Ok(())
    }

    /// Drop every entry in the region.
    fn evict_all(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Tracks last-modified timestamps of query spaces for the query cache.
pub trait UpdateTimestampsCache: fmt::Debug + Send + Sync {
    fn pre_invalidate(&self, spaces: &[String]) -> Result<(), CacheError>;

    fn invalidate(&self, spaces: &[String]) -> Result<(), CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_mode_flags() {
        assert!(CacheMode::Normal.is_put_enabled());
        assert!(CacheMode::Refresh.is_put_enabled());
        assert!(!CacheMode::Refresh.is_get_enabled());
        assert!(!CacheMode::Ignore.is_put_enabled());
        assert!(CacheMode::Get.is_get_enabled());
    }

    #[test]
    fn test_cache_key_display() {
        let key = CacheKey::new("Person", Value::Int(5));
        assert_eq!(key.to_string(), "Person#5");
    }
}
