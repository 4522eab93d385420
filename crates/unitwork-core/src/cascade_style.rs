//! Cascade styles, cascade points and foreign-key direction.
//!
//! A [`CascadeStyle`] is attached to every association property and says
//! which operations propagate through it. Styles are parsed from mapping
//! strings such as `"all, delete-orphan"` or `"persist,merge"`.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

/// The operation being propagated along an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeKind {
    Persist,
    PersistOnFlush,
    SaveUpdate,
    Merge,
    Delete,
    Lock,
    Refresh,
    Replicate,
    Evict,
}

impl CascadeKind {
    const fn bit(self) -> u16 {
        match self {
            CascadeKind::Persist => 1,
            CascadeKind::PersistOnFlush => 1 << 1,
            CascadeKind::SaveUpdate => 1 << 2,
            CascadeKind::Merge => 1 << 3,
            CascadeKind::Delete => 1 << 4,
            CascadeKind::Lock => 1 << 5,
            CascadeKind::Refresh => 1 << 6,
            CascadeKind::Replicate => 1 << 7,
            CascadeKind::Evict => 1 << 8,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeKind::Persist => "persist",
            CascadeKind::PersistOnFlush => "persist-on-flush",
            CascadeKind::SaveUpdate => "save-update",
            CascadeKind::Merge => "merge",
            CascadeKind::Delete => "delete",
            CascadeKind::Lock => "lock",
            CascadeKind::Refresh => "refresh",
            CascadeKind::Replicate => "replicate",
            CascadeKind::Evict => "evict",
        }
    }
}

impl fmt::Display for CascadeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const ALL_BITS: u16 = (1 << 9) - 1;

/// Set of operations that cascade through one association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeStyle {
    bits: u16,
    delete_orphan: bool,
}

impl CascadeStyle {
    /// No cascading.
    pub const NONE: CascadeStyle = CascadeStyle {
        bits: 0,
        delete_orphan: false,
    };

    /// Cascade every operation.
    pub const ALL: CascadeStyle = CascadeStyle {
        bits: ALL_BITS,
        delete_orphan: false,
    };

    /// Cascade every operation and delete orphans.
    pub const ALL_DELETE_ORPHAN: CascadeStyle = CascadeStyle {
        bits: ALL_BITS,
        delete_orphan: true,
    };

    /// Style cascading a single operation.
    #[must_use]
    pub const fn of(kind: CascadeKind) -> Self {
        let bits = match kind {
            CascadeKind::Persist | CascadeKind::PersistOnFlush => {
                CascadeKind::Persist.bit() | CascadeKind::PersistOnFlush.bit()
            }
            other => other.bit(),
        };
        Self {
            bits,
            delete_orphan: false,
        }
    }

    #[must_use]
    pub const fn with(self, kind: CascadeKind) -> Self {
        let other = Self::of(kind);
        Self {
            bits: self.bits | other.bits,
            delete_orphan: self.delete_orphan,
        }
    }

    #[must_use]
    pub const fn with_delete_orphan(mut self) -> Self {
        self.delete_orphan = true;
        self
    }

    /// Parse a mapping string like `"save-update, delete-orphan"`.
    pub fn parse(styles: &str) -> Result<Self> {
        let separator = separator()
            .as_ref()
            .map_err(|e| Error::Mapping(format!("invalid cascade separator pattern: {}", e)))?;
        let mut style = CascadeStyle::NONE;
        for token in separator.split(styles.trim()).filter(|t| !t.is_empty()) {
            style = match token {
                "none" => style,
                "all" => Self {
                    bits: ALL_BITS,
                    ..style
                },
                "all-delete-orphan" => Self::ALL_DELETE_ORPHAN,
                "delete-orphan" => style.with_delete_orphan(),
                "persist" => style.with(CascadeKind::Persist),
                "save-update" => style.with(CascadeKind::SaveUpdate),
                "merge" => style.with(CascadeKind::Merge),
                "delete" => style.with(CascadeKind::Delete),
                "lock" => style.with(CascadeKind::Lock),
                "refresh" => style.with(CascadeKind::Refresh),
                "replicate" => style.with(CascadeKind::Replicate),
                "evict" => style.with(CascadeKind::Evict),
                other => {
                    return Err(Error::Mapping(format!("unknown cascade style: {}", other)));
                }
            };
        }
        Ok(style)
    }

    /// Should `kind` be propagated along this association at all?
    ///
    /// Delete-orphan implies cascading the operations that can detect
    /// orphans, even when they are not named explicitly.
    pub const fn does_cascade(&self, kind: CascadeKind) -> bool {
        self.bits & kind.bit() != 0
            || (self.delete_orphan
                && matches!(
                    kind,
                    CascadeKind::Delete | CascadeKind::SaveUpdate | CascadeKind::PersistOnFlush
                ))
    }

    /// Should the action be applied to each child, rather than only used
    /// for orphan detection?
    pub const fn really_does_cascade(&self, kind: CascadeKind) -> bool {
        self.bits & kind.bit() != 0 || (self.delete_orphan && matches!(kind, CascadeKind::Delete))
    }

    pub const fn has_orphan_delete(&self) -> bool {
        self.delete_orphan
    }

    pub const fn is_none(&self) -> bool {
        self.bits == 0 && !self.delete_orphan
    }
}

fn separator() -> &'static std::result::Result<Regex, regex::Error> {
    static SEPARATOR: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"[\s,]+"))
}

/// Where in the lifecycle of the parent a cascade happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadePoint {
    /// After the parent is inserted, or before it is deleted.
    AfterInsertBeforeDelete,
    /// Before the parent is inserted, or after it is deleted.
    BeforeInsertAfterDelete,
    /// Same as `AfterInsertBeforeDelete`, reached through a collection.
    AfterInsertBeforeDeleteViaCollection,
    AfterUpdate,
    BeforeFlush,
    AfterEvict,
    BeforeRefresh,
    AfterLock,
    BeforeMerge,
}

/// Which side of an association holds the foreign key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ForeignKeyDirection {
    /// The foreign key is on the child's table, pointing at the parent.
    /// Collections and the owned side of one-to-one use this.
    ToParent,
    /// The foreign key is on the parent's table. Many-to-one uses this.
    #[default]
    FromParent,
}

impl ForeignKeyDirection {
    /// Should we cascade through this association at the given point?
    pub const fn cascade_now(self, point: CascadePoint) -> bool {
        match self {
            ForeignKeyDirection::ToParent => {
                !matches!(point, CascadePoint::BeforeInsertAfterDelete)
            }
            ForeignKeyDirection::FromParent => {
                !matches!(point, CascadePoint::AfterInsertBeforeDelete)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_combined_styles() {
        let style = CascadeStyle::parse("persist, merge").unwrap();
        assert!(style.does_cascade(CascadeKind::Persist));
        assert!(style.does_cascade(CascadeKind::PersistOnFlush));
        assert!(style.does_cascade(CascadeKind::Merge));
        assert!(!style.does_cascade(CascadeKind::Delete));
        assert!(!style.has_orphan_delete());
    }

    #[test]
    fn test_parse_all_delete_orphan() {
        let a = CascadeStyle::parse("all,delete-orphan").unwrap();
        let b = CascadeStyle::parse("all-delete-orphan").unwrap();
        assert_eq!(a, b);
        assert!(a.has_orphan_delete());
        assert!(a.really_does_cascade(CascadeKind::Evict));
    }

    #[test]
    fn test_delete_orphan_alone() {
        let style = CascadeStyle::parse("delete-orphan").unwrap();
        assert!(style.does_cascade(CascadeKind::SaveUpdate));
        assert!(!style.really_does_cascade(CascadeKind::SaveUpdate));
        assert!(style.really_does_cascade(CascadeKind::Delete));
        assert!(!style.does_cascade(CascadeKind::Lock));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        let err = CascadeStyle::parse("persist, explode").unwrap_err();
        assert!(err.to_string().contains("explode"));
        assert!(CascadeStyle::parse("  ").unwrap().is_none());
    }

    #[test]
    fn test_cascade_now() {
        use CascadePoint::*;
        assert!(!ForeignKeyDirection::FromParent.cascade_now(AfterInsertBeforeDelete));
        assert!(ForeignKeyDirection::FromParent.cascade_now(BeforeInsertAfterDelete));
        assert!(ForeignKeyDirection::ToParent.cascade_now(AfterInsertBeforeDelete));
        assert!(!ForeignKeyDirection::ToParent.cascade_now(BeforeInsertAfterDelete));
        assert!(ForeignKeyDirection::ToParent.cascade_now(AfterInsertBeforeDeleteViaCollection));
        assert!(ForeignKeyDirection::FromParent.cascade_now(BeforeFlush));
    }
}
