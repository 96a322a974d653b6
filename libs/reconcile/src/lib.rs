//! Capacity convergence and retry primitives.
//!
//! This library provides helpers shared by the simulated provider and the
//! cluster-state cache that sits between it and the reconciliation
//! controllers:
//!
//! - **Desired capacity**: how many instances of a type the controllers want.
//! - **Reported capacity**: what the simulated provider says exists.
//! - **Convergence**: whether reported capacity has caught up with desired.
//!
//! It also carries the exponential backoff policy used for bounded retries
//! against durable storage.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs
//! - Backoff delays never exceed the configured maximum plus jitter

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Convergence status for one capacity pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    /// Running capacity matches desired.
    Converged,

    /// Pending instances will close the gap once they boot.
    Converging,

    /// Capacity is short or in excess and nothing in flight fixes it.
    Diverged,

    /// No desired count has been declared for this pool.
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the pool has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the pool is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Comparison of desired vs provider-reported capacity for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityComparison {
    pub desired: Option<u32>,
    pub running: u32,
    pub pending: u32,
    /// Signed gap: positive means instances are missing, negative means excess.
    pub shortfall: i64,
    pub status: ConvergenceStatus,
}

/// Compare a desired instance count against reported running/pending counts.
pub fn compare_capacity(desired: Option<u32>, running: u32, pending: u32) -> CapacityComparison {
    let Some(want) = desired else {
        return CapacityComparison {
            desired,
            running,
            pending,
            shortfall: 0,
            status: ConvergenceStatus::Unknown,
        };
    };

    let shortfall = i64::from(want) - i64::from(running);
    let status = if shortfall == 0 && pending == 0 {
        ConvergenceStatus::Converged
    } else if shortfall > 0 && i64::from(pending) >= shortfall {
        ConvergenceStatus::Converging
    } else {
        ConvergenceStatus::Diverged
    };

    CapacityComparison {
        desired,
        running,
        pending,
        shortfall,
        status,
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// A policy without jitter, for deterministic schedules.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::rng())
    }

    /// Calculate delay using the given random source for jitter.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = 2.0_f64.powi(attempt.min(31) as i32);
        let delay = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);

        let jitter = self.jitter.clamp(0.0, 1.0);
        let final_delay = if jitter > 0.0 {
            let range = delay * jitter;
            (delay + rng.random_range(-range..=range)).max(0.0)
        } else {
            delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// Default interval between backups.
pub const DEFAULT_BACKUP_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of write attempts per backup cycle.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
