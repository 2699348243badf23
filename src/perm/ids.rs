/// Core identity types for the permission system.
///
/// - `GroupId`: session-unique, monotonically allocated group identifier
/// - `DefIndex`: dense index of a permission definition
/// - `PlayerId`: persistent participant identifier supplied by the host
/// - `ResolverHandle`: replica-local handle for a registered resolver
///
/// All replicated identifiers are small integers so they encode as short
/// varints on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// GroupId
// ---------------------------------------------------------------------------

/// Permission group identifier.
///
/// Allocated from a per-session counter starting at 1. Ids are never reused
/// within a session, so a tombstoned group's id stays distinguishable from
/// any group created afterwards.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    /// First id handed out in a fresh session (the default group).
    pub const FIRST: GroupId = GroupId(1);

    /// Return the raw value.
    pub fn get(&self) -> u32 {
        self.0
    }

    /// The id allocated after this one; `None` once the id space is spent.
    pub fn next(&self) -> Option<GroupId> {
        self.0.checked_add(1).map(GroupId)
    }
}

impl fmt::Debug for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupId({})", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// DefIndex
// ---------------------------------------------------------------------------

/// Dense, zero-based index of a permission definition.
///
/// Assigned once when the registry is built. This is the only identifier used
/// on the hot path; textual keys exist for cross-schema matching.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DefIndex(pub u32);

impl DefIndex {
    /// As a slice index.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub fn from_usize(index: usize) -> Self {
        DefIndex(index as u32)
    }
}

impl fmt::Debug for DefIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DefIndex({})", self.0)
    }
}

impl fmt::Display for DefIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PlayerId
// ---------------------------------------------------------------------------

/// Persistent participant identifier, assigned by the host session.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

impl fmt::Debug for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PlayerId({})", self.0)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ResolverHandle
// ---------------------------------------------------------------------------

/// Opaque handle for a registered resolver.
///
/// Resolvers are replica-local (they drive local side effects only), so
/// handles never travel over the wire. Handles increase monotonically, which
/// lets the registry tell bootstrap-time registrations from later ones.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResolverHandle(pub(crate) u64);

impl ResolverHandle {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ResolverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResolverHandle({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
