//! Fleet snapshot format.
//!
//! A snapshot is a self-describing JSON document:
//!
//! ```json
//! {
//!   "format_version": 1,
//!   "version": 42,
//!   "taken_at": "2026-01-01T00:00:00Z",
//!   "checksum": "sha256:…",
//!   "instances": [ … ]
//! }
//! ```
//!
//! `version` is the backup sequence number. `format_version` guards the
//! layout: readers ignore unknown fields but refuse a layout newer than the
//! one they understand. The checksum covers the canonical serialization of
//! the instance list, so a truncated or hand-edited file is detected at
//! restore time instead of silently producing a partial fleet.

use chrono::{DateTime, Utc};
use fleetsim_id::SnapshotVersion;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::instance::SimulatedInstance;

/// Newest layout this build can read and the one it writes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Errors from encoding or decoding snapshots.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("malformed snapshot: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unsupported snapshot format version {found} (newest supported is {supported})")]
    UnsupportedFormat { found: u32, supported: u32 },

    #[error("snapshot checksum mismatch: recorded {recorded}, computed {computed}")]
    ChecksumMismatch { recorded: String, computed: String },
}

/// Immutable point-in-time serialization of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub format_version: u32,
    pub version: SnapshotVersion,
    pub taken_at: DateTime<Utc>,
    pub checksum: String,
    pub instances: Vec<SimulatedInstance>,
}

#[derive(Deserialize)]
struct Header {
    format_version: u32,
}

impl FleetSnapshot {
    /// Build a snapshot of `instances` at `version`.
    pub fn new(version: SnapshotVersion, mut instances: Vec<SimulatedInstance>) -> Self {
        instances.sort_by_key(|i| i.id);
        let checksum = checksum(&instances);
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            version,
            taken_at: Utc::now(),
            checksum,
            instances,
        }
    }

    /// Serialize for durable storage.
    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        serde_json::to_vec_pretty(self).map_err(SnapshotError::Encode)
    }

    /// Parse and verify a stored snapshot.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let header: Header = serde_json::from_slice(bytes).map_err(SnapshotError::Malformed)?;
        if header.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedFormat {
                found: header.format_version,
                supported: SNAPSHOT_FORMAT_VERSION,
            });
        }

        let snapshot: FleetSnapshot =
            serde_json::from_slice(bytes).map_err(SnapshotError::Malformed)?;
        snapshot.verify()?;
        Ok(snapshot)
    }

    /// Check the recorded checksum against the instance list.
    pub fn verify(&self) -> Result<(), SnapshotError> {
        let computed = checksum(&self.instances);
        if computed != self.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                recorded: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

fn checksum(instances: &[SimulatedInstance]) -> String {
    let mut hasher = Sha256::new();
    for instance in instances {
        // Serializing a plain struct with string keys cannot fail.
        if let Ok(bytes) = serde_json::to_vec(instance) {
            hasher.update(&bytes);
        }
        hasher.update(b"\n");
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
