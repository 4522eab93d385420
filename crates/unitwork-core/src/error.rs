//! Error types for unit-of-work operations.

use std::fmt;

use crate::Value;
use crate::cache::CacheError;

/// The primary error type for all unit-of-work operations.
#[derive(Debug)]
pub enum Error {
    /// Internal invariant violated. Fatal; never recovered internally.
    Assertion(String),
    /// A different instance is already bound to this identity.
    NonUniqueObject { entity_name: String, id: Value },
    /// A property value violates its mapping (nullability, transient reference).
    PropertyValue {
        entity_name: String,
        property: String,
        message: String,
    },
    /// Second-level cache failure.
    Cache(CacheError),
    /// Operation on an instance the persistence context does not know.
    TransientObject(String),
    /// Operation needing a loaded instance was given an uninitialized proxy.
    PersistentObject(String),
    /// No row exists for the requested identifier.
    ObjectNotFound { entity_name: String, id: Value },
    /// Operation is not valid in the current state.
    IllegalState(String),
    /// No metadata registered under this entity name or collection role.
    UnknownEntity(String),
    /// Inconsistent mapping metadata.
    Mapping(String),
    /// Identifier could not be assigned.
    IdentifierGeneration(String),
    /// Serialization/deserialization errors
    Serde(String),
    /// I/O errors
    Io(std::io::Error),
    /// Custom error with message
    Custom(String),
}

impl Error {
    /// Is this a programming invariant violation?
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Assertion(_))
    }

    /// Is this caused by the data handed to the unit of work?
    pub fn is_data_integrity(&self) -> bool {
        matches!(
            self,
            Error::NonUniqueObject { .. } | Error::PropertyValue { .. }
        )
    }

    pub fn is_cache_error(&self) -> bool {
        matches!(self, Error::Cache(_))
    }

    pub fn assertion(message: impl Into<String>) -> Self {
        Error::Assertion(message.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Assertion(msg) => write!(f, "Assertion failure: {}", msg),
            Error::NonUniqueObject { entity_name, id } => write!(
                f,
                "A different object with the same identifier value was already associated with the session: [{}#{}]",
                entity_name, id
            ),
            Error::PropertyValue {
                entity_name,
                property,
                message,
            } => write!(f, "{}: {}.{}", message, entity_name, property),
            Error::Cache(e) => write!(f, "Cache error: {}", e),
            Error::TransientObject(msg) => write!(f, "Transient object: {}", msg),
            Error::PersistentObject(msg) => write!(f, "Persistent object: {}", msg),
            Error::ObjectNotFound { entity_name, id } => {
                write!(f, "No row with the given identifier exists: [{}#{}]", entity_name, id)
            }
            Error::IllegalState(msg) => write!(f, "Illegal state: {}", msg),
            Error::UnknownEntity(name) => write!(f, "Unknown entity or role: {}", name),
            Error::Mapping(msg) => write!(f, "Mapping error: {}", msg),
            Error::IdentifierGeneration(msg) => write!(f, "Identifier generation error: {}", msg),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Cache(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        Error::Cache(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for unit-of-work operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::assertion("boom").is_fatal());
        let dup = Error::NonUniqueObject {
            entity_name: "Person".into(),
            id: Value::BigInt(7),
        };
        assert!(dup.is_data_integrity());
        assert!(!dup.is_fatal());
        assert!(Error::from(CacheError::new("region down")).is_cache_error());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::PropertyValue {
            entity_name: "Order".into(),
            property: "customer".into(),
            message: "not-null property references a null or transient value".into(),
        };
        assert_eq!(
            err.to_string(),
            "not-null property references a null or transient value: Order.customer"
        );
        let err = Error::ObjectNotFound {
            entity_name: "Order".into(),
            id: Value::Int(3),
        };
        assert!(err.to_string().contains("[Order#3]"));
    }

    #[test]
    fn test_source_chain() {
        use std::error::Error as _;
        let err = Error::from(CacheError::new("lock timeout"));
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("lock timeout"));
    }
}
