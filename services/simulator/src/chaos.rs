//! Chaos worker.
//!
//! While this replica leads, the worker wakes every `interval` plus a
//! random jitter, picks victims among `Running` instances and terminates
//! them through the provider with cause `chaos`. Terminations go through
//! the same path as controller requests, so a victim that a controller is
//! already terminating is simply skipped.

use std::sync::Mutex;
use std::time::Duration;

use fleetsim_events::TerminationCause;
use fleetsim_id::InstanceId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::leadership::LeadershipGate;
use crate::provider::{ProviderError, SimulatedProvider, TerminateOutcome};
use crate::worker::shutdown_requested;

/// How many victims to pick per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ChaosSelection {
    /// Exactly `count` victims (fewer if not enough candidates).
    Fixed { count: usize },
    /// Each candidate independently with `probability`.
    Rate { probability: f64 },
}

#[derive(Debug, Clone)]
pub struct ChaosConfig {
    pub enabled: bool,
    pub interval: Duration,
    /// Upper bound of the uniform random delay added to each interval.
    pub jitter: Duration,
    pub selection: ChaosSelection,
    /// Never reduce the running fleet below this many instances.
    pub min_survivors: usize,
    /// Fixed seed for reproducible runs; OS entropy when unset.
    pub seed: Option<u64>,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
            jitter: Duration::from_secs(15),
            selection: ChaosSelection::Fixed { count: 1 },
            min_survivors: 0,
            seed: None,
        }
    }
}

/// Pick victims from `candidates`, which must be sorted by identifier.
///
/// Victims are returned in candidate order. At most
/// `candidates.len() - min_survivors` are chosen.
pub fn select_victims<R: Rng + ?Sized>(
    candidates: &[InstanceId],
    selection: ChaosSelection,
    min_survivors: usize,
    rng: &mut R,
) -> Vec<InstanceId> {
    let budget = candidates.len().saturating_sub(min_survivors);
    if budget == 0 {
        return Vec::new();
    }

    match selection {
        ChaosSelection::Fixed { count } => {
            let amount = count.min(budget);
            let mut picked = rand::seq::index::sample(rng, candidates.len(), amount).into_vec();
            picked.sort_unstable();
            picked.into_iter().map(|i| candidates[i]).collect()
        }
        ChaosSelection::Rate { probability } => {
            let p = if probability.is_nan() {
                0.0
            } else {
                probability.clamp(0.0, 1.0)
            };
            candidates
                .iter()
                .filter(|_| rng.random_bool(p))
                .take(budget)
                .copied()
                .collect()
        }
    }
}

pub struct ChaosWorker {
    provider: SimulatedProvider,
    config: ChaosConfig,
    rng: Mutex<StdRng>,
}

impl ChaosWorker {
    pub fn new(provider: SimulatedProvider, config: ChaosConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            provider,
            config,
            rng: Mutex::new(rng),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut rng)
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            self.with_rng(|rng| rng.random_range(0..=jitter_ms))
        };
        self.config.interval.saturating_add(Duration::from_millis(extra))
    }

    #[instrument(skip(self, gate, shutdown))]
    pub async fn run(&self, gate: LeadershipGate, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Chaos worker disabled");
            return;
        }

        tokio::select! {
            res = gate.await_elected() => {
                if let Err(e) = res {
                    info!(reason = %e, "Chaos worker not started");
                    return;
                }
            }
            _ = shutdown_requested(&mut shutdown) => return,
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            jitter_secs = self.config.jitter.as_secs(),
            selection = ?self.config.selection,
            min_survivors = self.config.min_survivors,
            seeded = self.config.seed.is_some(),
            "Starting chaos worker"
        );

        loop {
            let delay = self.next_delay();
            tokio::select! {
                biased;
                _ = gate.lost() => {
                    info!("Leadership lost, chaos worker stopping");
                    return;
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Chaos worker shutting down");
                    return;
                }
                _ = tokio::time::sleep(delay) => {
                    tokio::select! {
                        biased;
                        _ = gate.lost() => {
                            info!("Leadership lost during chaos cycle");
                            return;
                        }
                        _ = self.run_cycle() => {}
                    }
                }
            }
        }
    }

    /// Run one selection and termination pass. Returns the instances this
    /// pass actually terminated.
    pub async fn run_cycle(&self) -> Vec<InstanceId> {
        let candidates = self.provider.store().running_ids().await;
        let victims = self.with_rng(|rng| {
            select_victims(
                &candidates,
                self.config.selection,
                self.config.min_survivors,
                rng,
            )
        });
        if victims.is_empty() {
            debug!(candidates = candidates.len(), "No chaos victims this cycle");
            return Vec::new();
        }

        let mut terminated = Vec::with_capacity(victims.len());
        for id in victims {
            match self
                .provider
                .terminate_with_cause(id, TerminationCause::Chaos)
                .await
            {
                Ok(TerminateOutcome::Terminated(_)) => {
                    info!(instance_id = %id, "Chaos terminated instance");
                    terminated.push(id);
                }
                Ok(TerminateOutcome::AlreadyGone(reason)) => {
                    debug!(instance_id = %id, ?reason, "Chaos victim already gone");
                }
                Err(ProviderError::NotLeader) => {
                    info!("No longer leader, ending chaos cycle");
                    break;
                }
                Err(e) => warn!(instance_id = %id, error = %e, "Chaos termination failed"),
            }
        }
        terminated
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use fleetsim_events::InstanceStatus;
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;
    use crate::events::EventRecorder;
    use crate::leadership::{self, LeadershipHandle};
    use crate::provider::LaunchSpec;
    use crate::store::FleetStore;

    fn ids(n: usize) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = (0..n).map(|_| InstanceId::new()).collect();
        ids.sort();
        ids
    }

    #[rstest]
    #[case(ChaosSelection::Fixed { count: 1 }, 5, 0, 1)]
    #[case(ChaosSelection::Fixed { count: 3 }, 5, 0, 3)]
    #[case(ChaosSelection::Fixed { count: 10 }, 5, 0, 5)]
    #[case(ChaosSelection::Fixed { count: 3 }, 5, 4, 1)]
    #[case(ChaosSelection::Fixed { count: 3 }, 5, 5, 0)]
    #[case(ChaosSelection::Fixed { count: 1 }, 0, 0, 0)]
    #[case(ChaosSelection::Rate { probability: 1.0 }, 5, 0, 5)]
    #[case(ChaosSelection::Rate { probability: 1.0 }, 5, 2, 3)]
    #[case(ChaosSelection::Rate { probability: 0.0 }, 5, 0, 0)]
    fn test_victim_counts(
        #[case] selection: ChaosSelection,
        #[case] candidates: usize,
        #[case] min_survivors: usize,
        #[case] expected: usize,
    ) {
        let mut rng = StdRng::seed_from_u64(7);
        let victims = select_victims(&ids(candidates), selection, min_survivors, &mut rng);
        assert_eq!(victims.len(), expected);
    }

    #[test]
    fn test_same_seed_same_victims() {
        let candidates = ids(20);
        let selection = ChaosSelection::Fixed { count: 4 };
        let a = select_victims(&candidates, selection, 0, &mut StdRng::seed_from_u64(42));
        let b = select_victims(&candidates, selection, 0, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn prop_victims_are_distinct_candidates(
            n in 0usize..40,
            count in 0usize..50,
            min_survivors in 0usize..10,
            p in 0.0f64..=1.0,
            use_rate in any::<bool>(),
            seed in any::<u64>(),
        ) {
            let candidates = ids(n);
            let selection = if use_rate {
                ChaosSelection::Rate { probability: p }
            } else {
                ChaosSelection::Fixed { count }
            };
            let mut rng = StdRng::seed_from_u64(seed);
            let victims = select_victims(&candidates, selection, min_survivors, &mut rng);

            let unique: HashSet<_> = victims.iter().collect();
            prop_assert_eq!(unique.len(), victims.len());
            prop_assert!(victims.iter().all(|v| candidates.contains(v)));
            prop_assert!(victims.len() <= n.saturating_sub(min_survivors));
            prop_assert!(victims.windows(2).all(|w| w[0] < w[1]));
        }
    }

    async fn fleet(n: usize) -> (SimulatedProvider, LeadershipHandle) {
        let (handle, gate) = leadership::channel();
        handle.elect();
        let provider = SimulatedProvider::new(
            FleetStore::new(),
            gate,
            Arc::new(EventRecorder::new(None, 256)),
        );
        for _ in 0..n {
            provider
                .launch(LaunchSpec::of_type("sim.small"))
                .await
                .unwrap();
        }
        (provider, handle)
    }

    fn seeded(count: usize) -> ChaosConfig {
        ChaosConfig {
            selection: ChaosSelection::Fixed { count },
            seed: Some(1),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_cycle_never_targets_gone_instances() {
        let (provider, _handle) = fleet(4).await;
        let running = provider.store().running_ids().await;
        provider.terminate(running[0]).await.unwrap();

        let worker = ChaosWorker::new(provider.clone(), seeded(10));
        let terminated = worker.run_cycle().await;
        assert_eq!(terminated.len(), 3);
        assert!(!terminated.contains(&running[0]));

        for id in &terminated {
            let inst = provider.describe(*id).await.unwrap();
            assert_eq!(inst.status, InstanceStatus::Terminated);
            assert_eq!(inst.termination_cause, Some(TerminationCause::Chaos));
        }
        // Nothing left to kill.
        assert!(worker.run_cycle().await.is_empty());
    }

    #[tokio::test]
    async fn test_cycle_respects_min_survivors() {
        let (provider, _handle) = fleet(3).await;
        let worker = ChaosWorker::new(
            provider.clone(),
            ChaosConfig {
                min_survivors: 2,
                ..seeded(3)
            },
        );
        worker.run_cycle().await;
        worker.run_cycle().await;
        assert_eq!(provider.store().running_ids().await.len(), 2);
    }

    #[tokio::test]
    async fn test_cycle_stops_when_not_leader() {
        let (provider, handle) = fleet(3).await;
        handle.revoke();
        let worker = ChaosWorker::new(provider.clone(), seeded(3));
        assert!(worker.run_cycle().await.is_empty());
        assert_eq!(provider.store().running_ids().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_kills_on_schedule_until_leadership_lost() {
        let (provider, handle) = fleet(5).await;
        let worker = Arc::new(ChaosWorker::new(
            provider.clone(),
            ChaosConfig {
                interval: Duration::from_secs(10),
                jitter: Duration::ZERO,
                ..seeded(1)
            },
        ));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let gate = provider.gate().clone();
        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(gate, shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(provider.store().running_ids().await.len(), 3);

        handle.revoke();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.store().running_ids().await.len(), 3);
    }

    #[tokio::test]
    async fn test_huge_interval_saturates() {
        let (provider, _handle) = fleet(0).await;
        let worker = ChaosWorker::new(
            provider,
            ChaosConfig {
                interval: Duration::MAX,
                jitter: Duration::from_secs(15),
                ..seeded(1)
            },
        );
        assert_eq!(worker.next_delay(), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_victim_reaches_terminated_when_leadership_lost_mid_cycle() {
        let (handle, gate) = leadership::channel();
        handle.elect();
        let runtime = Arc::new(crate::runtime::SimulatedRuntime::new(
            Duration::ZERO,
            Duration::from_secs(5),
        ));
        let provider = SimulatedProvider::new(
            FleetStore::new(),
            gate.clone(),
            Arc::new(EventRecorder::new(None, 64)),
        )
        .with_runtime(runtime);
        let victim = provider
            .launch(LaunchSpec::of_type("sim.small"))
            .await
            .unwrap()
            .id;

        let worker = Arc::new(ChaosWorker::new(
            provider.clone(),
            ChaosConfig {
                interval: Duration::from_secs(10),
                jitter: Duration::ZERO,
                ..seeded(1)
            },
        ));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(gate, shutdown_rx).await }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(
            provider.describe(victim).await.unwrap().status,
            InstanceStatus::Terminating
        );
        handle.revoke();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(
            provider.describe(victim).await.unwrap().status,
            InstanceStatus::Terminated
        );
    }

    #[tokio::test]
    async fn test_disabled_worker_returns_immediately() {
        let (provider, _handle) = fleet(1).await;
        let worker = ChaosWorker::new(
            provider.clone(),
            ChaosConfig {
                enabled: false,
                ..Default::default()
            },
        );
        let (_tx, rx) = watch::channel(false);
        worker.run(provider.gate().clone(), rx).await;
        assert_eq!(provider.store().running_ids().await.len(), 1);
    }
}
