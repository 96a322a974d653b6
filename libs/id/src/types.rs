//! Typed ID definitions for simulator resources.
//!
//! Each ID type has a unique prefix that identifies the resource type.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Fleet
// =============================================================================

define_id!(InstanceId, "inst", "Identifier of a simulated fleet instance.");
define_id!(NodeId, "node", "Identifier of the node that owns an instance.");

// =============================================================================
// Replication
// =============================================================================

define_id!(
    ReplicaId,
    "rep",
    "Identifier of one simulator replica in a leader-elected set."
);

// =============================================================================
// API
// =============================================================================

define_id!(RequestId, "req", "Identifier attached to one API request.");

// =============================================================================
// Events
// =============================================================================

/// Event ID is a simple monotonic integer, not ULID-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(i64);

impl EventId {
    /// Creates a new EventId from an i64.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the underlying i64 value.
    #[must_use]
    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<EventId> for i64 {
    fn from(id: EventId) -> Self {
        id.0
    }
}

impl serde::Serialize for EventId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = <i64 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Snapshot Version
// =============================================================================

/// Sequence number of a persisted fleet snapshot.
///
/// Versions are totally ordered and strictly increase across backups,
/// including across process restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SnapshotVersion(u64);

impl SnapshotVersion {
    /// The version preceding every real snapshot (cold start).
    pub const ZERO: Self = Self(0);

    /// Creates a new SnapshotVersion from a u64.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Returns the underlying u64 value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the next version.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SnapshotVersion {
    fn from(version: u64) -> Self {
        Self(version)
    }
}

impl From<SnapshotVersion> for u64 {
    fn from(version: SnapshotVersion) -> Self {
        version.0
    }
}

impl serde::Serialize for SnapshotVersion {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for SnapshotVersion {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let version = <u64 as serde::Deserialize>::deserialize(deserializer)?;
        Ok(Self(version))
    }
}

// =============================================================================
// Tests
// =============================================================================
