use std::time::Duration;

use chrono::Utc;
use fleetsim_events::{ActorType, FleetEventPayload};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument};

use crate::leadership::LeadershipGate;
use crate::provider::SimulatedProvider;
use crate::worker::shutdown_requested;

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub interval: Duration,
    /// How long `Terminated` instances stay visible before being pruned.
    pub terminated_retention: Duration,
}

impl Default for JanitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            terminated_retention: Duration::from_secs(3600),
        }
    }
}

/// Prunes terminated instance history while this replica leads.
pub struct JanitorWorker {
    provider: SimulatedProvider,
    config: JanitorConfig,
}

impl JanitorWorker {
    pub fn new(provider: SimulatedProvider, config: JanitorConfig) -> Self {
        Self { provider, config }
    }

    #[instrument(skip(self, gate, shutdown))]
    pub async fn run(&self, gate: LeadershipGate, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            res = gate.await_elected() => {
                if res.is_err() {
                    return;
                }
            }
            _ = shutdown_requested(&mut shutdown) => return,
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            retention_secs = self.config.terminated_retention.as_secs(),
            "Starting janitor worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = gate.lost() => {
                    info!("Leadership lost, janitor stopping");
                    break;
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Janitor worker shutting down");
                    break;
                }
                _ = interval.tick() => {
                    self.prune().await;
                }
            }
        }
    }

    /// Remove terminated instances older than the retention window.
    /// Returns how many were pruned. A replica that does not lead prunes
    /// nothing.
    pub async fn prune(&self) -> usize {
        if !self.provider.gate().is_elected() {
            debug!("Not leader, skipping prune");
            return 0;
        }
        let retention =
            chrono::Duration::from_std(self.config.terminated_retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        let pruned = self.provider.store().prune_terminated(cutoff).await;
        for id in &pruned {
            self.provider.events().record(
                id.to_string(),
                ActorType::Janitor,
                FleetEventPayload::InstancePruned,
            );
        }
        if !pruned.is_empty() {
            info!(pruned = pruned.len(), "Pruned terminated instances");
        }
        pruned.len()
    }
}
