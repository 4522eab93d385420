//! Lock modes.

use std::fmt;

/// Level of database lock held on an entity's row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// No lock; the state may come from the cache.
    #[default]
    None,
    /// Read through to the database, checking the version.
    Read,
    /// Pessimistic `SELECT ... FOR UPDATE`.
    Upgrade,
    /// Like `Upgrade`, failing instead of waiting.
    UpgradeNoWait,
    /// Acquired implicitly when the row is written.
    Write,
    /// Like `Upgrade`, also incrementing the version.
    Force,
}

impl LockMode {
    const fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 5,
            LockMode::Upgrade | LockMode::UpgradeNoWait | LockMode::Write => 10,
            LockMode::Force => 15,
        }
    }

    pub const fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }

    pub const fn less_than(self, other: LockMode) -> bool {
        self.level() < other.level()
    }

    pub const fn as_u8(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 1,
            LockMode::Upgrade => 2,
            LockMode::UpgradeNoWait => 3,
            LockMode::Write => 4,
            LockMode::Force => 5,
        }
    }

    pub const fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => LockMode::None,
            1 => LockMode::Read,
            2 => LockMode::Upgrade,
            3 => LockMode::UpgradeNoWait,
            4 => LockMode::Write,
            5 => LockMode::Force,
            _ => return None,
        })
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::None => "NONE",
            LockMode::Read => "READ",
            LockMode::Upgrade => "UPGRADE",
            LockMode::UpgradeNoWait => "UPGRADE_NOWAIT",
            LockMode::Write => "WRITE",
            LockMode::Force => "FORCE",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_ordering() {
        assert!(LockMode::Upgrade.greater_than(LockMode::Read));
        assert!(!LockMode::Write.greater_than(LockMode::Upgrade));
        assert!(LockMode::None.less_than(LockMode::Read));
        assert!(LockMode::Force.greater_than(LockMode::Write));
    }

    #[test]
    fn test_tag_round_trip() {
        for mode in [LockMode::None, LockMode::Read, LockMode::Force, LockMode::UpgradeNoWait] {
            assert_eq!(LockMode::from_u8(mode.as_u8()), Some(mode));
        }
        assert_eq!(LockMode::from_u8(42), None);
    }
}
