//! The permission lattice and the capture operator resolver.
//!
//! Every use of a handle carries two permissions. The *scheduling* permission
//! bounds what nested tasks may request, the *immediate* permission is what the
//! owning task may do with the data right now. When a task captures a handle,
//! the capture operators are resolved against the source's scheduling
//! permission to find what the nested task is granted.
use std::fmt;
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};

use crate::error::{DowngradeConflict, InvalidCapture};

/// A point in the lattice `None < Read, Write < Modify`.
///
/// `Read` and `Write` are incomparable, `Modify` is their union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Permissions {
    #[default]
    None,
    Read,
    Write,
    Modify,
}

impl Permissions {
    fn from_bits(read: bool, write: bool) -> Self {
        match (read, write) {
            (false, false) => Permissions::None,
            (true, false) => Permissions::Read,
            (false, true) => Permissions::Write,
            (true, true) => Permissions::Modify,
        }
    }

    pub fn reads(self) -> bool {
        matches!(self, Permissions::Read | Permissions::Modify)
    }

    pub fn writes(self) -> bool {
        matches!(self, Permissions::Write | Permissions::Modify)
    }

    pub fn is_none(self) -> bool {
        self == Permissions::None
    }

    /// Whether everything `self` grants is also granted by `other`.
    pub fn is_within(self, other: Permissions) -> bool {
        (!self.reads() || other.reads()) && (!self.writes() || other.writes())
    }

    pub fn without_read(self) -> Self {
        Permissions::from_bits(false, self.writes())
    }

    pub fn without_write(self) -> Self {
        Permissions::from_bits(self.reads(), false)
    }
}

impl BitOr for Permissions {
    type Output = Permissions;

    fn bitor(self, rhs: Self) -> Self::Output {
        Permissions::from_bits(self.reads() || rhs.reads(), self.writes() || rhs.writes())
    }
}

impl BitAnd for Permissions {
    type Output = Permissions;

    fn bitand(self, rhs: Self) -> Self::Output {
        Permissions::from_bits(self.reads() && rhs.reads(), self.writes() && rhs.writes())
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permissions::None => "None",
            Permissions::Read => "Read",
            Permissions::Write => "Write",
            Permissions::Modify => "Modify",
        };
        f.write_str(s)
    }
}

/// A (scheduling, immediate) permission pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PermissionPair {
    pub scheduling: Permissions,
    pub immediate: Permissions,
}

impl PermissionPair {
    pub const fn new(scheduling: Permissions, immediate: Permissions) -> Self {
        Self {
            scheduling,
            immediate,
        }
    }

    pub fn is_none(self) -> bool {
        self.scheduling.is_none() && self.immediate.is_none()
    }

    /// True when either half asks for write access.
    pub fn writes(self) -> bool {
        self.scheduling.writes() || self.immediate.writes()
    }

    pub fn union(self, other: PermissionPair) -> Self {
        Self::new(
            self.scheduling | other.scheduling,
            self.immediate | other.immediate,
        )
    }
}

impl fmt::Display for PermissionPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}, {}}}", self.scheduling, self.immediate)
    }
}

/// How a nested task asks to capture one half of a permission pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureOp {
    ReadOnly,
    WriteOnly,
    Modify,
    NoCapture,
}

impl CaptureOp {
    /// Resolves the permission a nested task is granted when capturing from a
    /// source holding `source`.
    pub fn resolve(self, source: Permissions) -> Result<Permissions, InvalidCapture> {
        use Permissions as P;

        let invalid = InvalidCapture {
            op: self,
            held: source,
        };

        match (self, source) {
            (CaptureOp::NoCapture, _) => Ok(P::None),
            (CaptureOp::ReadOnly, P::Read | P::Modify) => Ok(P::Read),
            (CaptureOp::ReadOnly, P::None | P::Write) => Err(invalid),
            (CaptureOp::WriteOnly, P::Write | P::Modify) => Ok(P::Write),
            (CaptureOp::WriteOnly, P::None | P::Read) => Err(invalid),
            (CaptureOp::Modify, P::None) => Err(invalid),
            (CaptureOp::Modify, granted) => Ok(granted),
        }
    }

    fn restrict(self, access: Access) -> Self {
        match (access, self) {
            (Access::Default, op) | (_, op @ CaptureOp::NoCapture) => op,
            (Access::ReadOnly, CaptureOp::Modify | CaptureOp::ReadOnly) => CaptureOp::ReadOnly,
            (Access::ReadOnly, CaptureOp::WriteOnly) => CaptureOp::NoCapture,
            (Access::WriteOnly, CaptureOp::Modify | CaptureOp::WriteOnly) => CaptureOp::WriteOnly,
            (Access::WriteOnly, CaptureOp::ReadOnly) => CaptureOp::NoCapture,
        }
    }
}

/// Which data bits a capture keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Access {
    #[default]
    Default,
    ReadOnly,
    WriteOnly,
}

/// Which halves of the permission pair a capture keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Scope {
    #[default]
    Default,
    /// The nested task may only schedule further work, never touch the data.
    ScheduleOnly,
    /// The nested task may touch the data but never schedule further work.
    Leaf,
}

/// A request to capture with less than the default permissions.
///
/// Conflicting requests (read-only together with write-only, schedule-only
/// together with leaf) have no representation; merging two downgrades with
/// [`Downgrade::and`] rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Downgrade {
    pub access: Access,
    pub scope: Scope,
}

impl Downgrade {
    pub const NONE: Downgrade = Downgrade {
        access: Access::Default,
        scope: Scope::Default,
    };

    pub const fn reads() -> Self {
        Downgrade {
            access: Access::ReadOnly,
            scope: Scope::Default,
        }
    }

    pub const fn writes() -> Self {
        Downgrade {
            access: Access::WriteOnly,
            scope: Scope::Default,
        }
    }

    pub const fn schedule_only() -> Self {
        Downgrade {
            access: Access::Default,
            scope: Scope::ScheduleOnly,
        }
    }

    pub const fn leaf() -> Self {
        Downgrade {
            access: Access::Default,
            scope: Scope::Leaf,
        }
    }

    pub fn and(self, other: Downgrade) -> Result<Self, DowngradeConflict> {
        let access = match (self.access, other.access) {
            (Access::Default, a) | (a, Access::Default) => a,
            (a, b) if a == b => a,
            _ => return Err(DowngradeConflict::ReadAndWriteOnly),
        };
        let scope = match (self.scope, other.scope) {
            (Scope::Default, s) | (s, Scope::Default) => s,
            (a, b) if a == b => a,
            _ => return Err(DowngradeConflict::ScheduleOnlyAndLeaf),
        };
        Ok(Downgrade { access, scope })
    }

    /// The (scheduling, immediate) operators left after applying this
    /// downgrade to a default request of `op` on both halves.
    pub fn operators(self, op: CaptureOp) -> (CaptureOp, CaptureOp) {
        let op = op.restrict(self.access);
        match self.scope {
            Scope::Default => (op, op),
            Scope::ScheduleOnly => (op, CaptureOp::NoCapture),
            Scope::Leaf => (CaptureOp::NoCapture, op),
        }
    }
}

/// Resolves a full capture request against the source's scheduling
/// permission: the downgrade picks the operators, the resolver grants them.
pub fn requested_permissions(
    source_scheduling: Permissions,
    op: CaptureOp,
    downgrade: Downgrade,
) -> Result<PermissionPair, InvalidCapture> {
    let (scheduling, immediate) = downgrade.operators(op);
    Ok(PermissionPair::new(
        scheduling.resolve(source_scheduling)?,
        immediate.resolve(source_scheduling)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use Permissions as P;

    const ALL: [Permissions; 4] = [P::None, P::Read, P::Write, P::Modify];

    #[test]
    fn test_resolver_table() {
        let expected = [
            (CaptureOp::ReadOnly, [None, Some(P::Read), None, Some(P::Read)]),
            (CaptureOp::WriteOnly, [None, None, Some(P::Write), Some(P::Write)]),
            (
                CaptureOp::Modify,
                [None, Some(P::Read), Some(P::Write), Some(P::Modify)],
            ),
            (
                CaptureOp::NoCapture,
                [Some(P::None), Some(P::None), Some(P::None), Some(P::None)],
            ),
        ];

        for (op, row) in expected {
            for (source, grant) in ALL.into_iter().zip(row) {
                assert_eq!(op.resolve(source).ok(), grant, "{op:?} from {source}");
                // no hidden state
                assert_eq!(op.resolve(source).ok(), grant);
            }
        }
    }

    #[test]
    fn test_invalid_carries_context() {
        let err = CaptureOp::WriteOnly.resolve(P::Read).unwrap_err();
        assert_eq!(err.op, CaptureOp::WriteOnly);
        assert_eq!(err.held, P::Read);
    }

    #[test]
    fn test_lattice() {
        assert_eq!(P::Read | P::Write, P::Modify);
        assert_eq!(P::Modify & P::Read, P::Read);
        assert_eq!(P::None | P::Read, P::Read);
        assert!(P::Read.is_within(P::Modify));
        assert!(!P::Read.is_within(P::Write));
        assert!(P::None.is_within(P::None));
        assert_eq!(P::Modify.without_write(), P::Read);
        assert_eq!(P::Modify.without_read(), P::Write);
    }

    #[test]
    fn test_downgrades_pick_operators() {
        assert_eq!(
            Downgrade::reads().operators(CaptureOp::Modify),
            (CaptureOp::ReadOnly, CaptureOp::ReadOnly)
        );
        assert_eq!(
            Downgrade::schedule_only().operators(CaptureOp::Modify),
            (CaptureOp::Modify, CaptureOp::NoCapture)
        );
        assert_eq!(
            Downgrade::leaf().operators(CaptureOp::Modify),
            (CaptureOp::NoCapture, CaptureOp::Modify)
        );
        assert_eq!(
            Downgrade::reads().operators(CaptureOp::WriteOnly),
            (CaptureOp::NoCapture, CaptureOp::NoCapture)
        );
    }

    #[test]
    fn test_downgrade_conflicts() {
        assert_eq!(
            Downgrade::reads().and(Downgrade::writes()),
            Err(DowngradeConflict::ReadAndWriteOnly)
        );
        assert_eq!(
            Downgrade::schedule_only().and(Downgrade::leaf()),
            Err(DowngradeConflict::ScheduleOnlyAndLeaf)
        );

        let merged = Downgrade::reads().and(Downgrade::leaf()).unwrap();
        assert_eq!(merged.access, Access::ReadOnly);
        assert_eq!(merged.scope, Scope::Leaf);
    }

    #[test]
    fn test_requested_permissions() {
        let pair = requested_permissions(P::Modify, CaptureOp::Modify, Downgrade::writes()).unwrap();
        assert_eq!(pair, PermissionPair::new(P::Write, P::Write));

        let pair = requested_permissions(P::Read, CaptureOp::Modify, Downgrade::NONE).unwrap();
        assert_eq!(pair, PermissionPair::new(P::Read, P::Read));

        assert!(requested_permissions(P::Read, CaptureOp::Modify, Downgrade::writes()).is_err());
    }
}
