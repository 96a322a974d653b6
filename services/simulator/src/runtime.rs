//! Simulated hypervisor.
//!
//! The runtime stands in for the machinery that actually boots and stops
//! an instance. It only adds latency and, when asked to, boot failures.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetsim_id::InstanceId;
use thiserror::Error;
use tracing::{debug, info};

use crate::instance::SimulatedInstance;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("instance {instance_id} failed to boot: {reason}")]
    BootFailed {
        instance_id: InstanceId,
        reason: String,
    },
}

/// Instance runtime interface.
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Boot a `Pending` instance.
    async fn boot(&self, instance: &SimulatedInstance) -> Result<(), RuntimeError>;

    /// Stop a terminating instance. Stopping never fails.
    async fn shutdown(&self, instance: &SimulatedInstance);
}

/// Runtime with configurable latency and injectable boot failures.
#[derive(Debug, Default)]
pub struct SimulatedRuntime {
    boot_delay: Duration,
    shutdown_delay: Duration,
    fail_boots: AtomicU32,
    boots: AtomicU64,
}

impl SimulatedRuntime {
    pub fn new(boot_delay: Duration, shutdown_delay: Duration) -> Self {
        Self {
            boot_delay,
            shutdown_delay,
            ..Default::default()
        }
    }

    /// A runtime that boots and stops instantly.
    pub fn instant() -> Self {
        Self::default()
    }

    /// Make the next `count` boots fail.
    pub fn fail_next_boots(&self, count: u32) {
        self.fail_boots.store(count, Ordering::SeqCst);
    }

    /// Number of boots attempted so far.
    pub fn boot_count(&self) -> u64 {
        self.boots.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> bool {
        self.fail_boots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl InstanceRuntime for SimulatedRuntime {
    async fn boot(&self, instance: &SimulatedInstance) -> Result<(), RuntimeError> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        debug!(
            instance_id = %instance.id,
            instance_type = %instance.instance_type,
            node_id = %instance.node_id,
            "Booting instance"
        );

        if !self.boot_delay.is_zero() {
            tokio::time::sleep(self.boot_delay).await;
        }

        if self.take_failure() {
            info!(instance_id = %instance.id, "Injected boot failure");
            return Err(RuntimeError::BootFailed {
                instance_id: instance.id,
                reason: "injected boot failure".to_string(),
            });
        }
        Ok(())
    }

    async fn shutdown(&self, instance: &SimulatedInstance) {
        debug!(instance_id = %instance.id, "Stopping instance");
        if !self.shutdown_delay.is_zero() {
            tokio::time::sleep(self.shutdown_delay).await;
        }
    }
}
