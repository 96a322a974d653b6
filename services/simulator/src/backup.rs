//! Periodic fleet backup.
//!
//! Once leadership is confirmed the worker captures the [`FleetStore`] on a
//! fixed interval and persists it as a new [`FleetSnapshot`]. Snapshots are
//! written one at a time; each write attempt allocates a fresh version so
//! versions strictly increase even if an abandoned write lands late.
//!
//! A write rejected because storage already holds a newer version means
//! another replica is leading. That fences this worker for good: it never
//! writes again and [`BackupWorker::fenced`] resolves so the process can
//! give up leadership.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetsim_events::{ActorType, FleetEventPayload, SnapshotWrittenPayload};
use fleetsim_id::SnapshotVersion;
use fleetsim_reconcile::{BackoffPolicy, DEFAULT_BACKUP_INTERVAL, DEFAULT_MAX_ATTEMPTS};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::events::EventRecorder;
use crate::leadership::LeadershipGate;
use crate::snapshot::FleetSnapshot;
use crate::storage::{SnapshotStorage, StorageError};
use crate::store::FleetStore;
use crate::worker::shutdown_requested;

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub interval: Duration,
    /// Write attempts per backup before giving up until the next tick.
    pub max_attempts: u32,
    pub write_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_BACKUP_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            write_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                max: Duration::from_secs(5),
                jitter: 0.25,
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("snapshot write timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("storage holds newer snapshot {latest} than {attempted}; another replica is writing")]
    Fenced {
        attempted: SnapshotVersion,
        latest: SnapshotVersion,
    },

    #[error("backup failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<BackupError>,
    },
}

/// Outcome of recent backups, for readiness reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupStatus {
    pub last_version: Option<SnapshotVersion>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Newer version found in storage; set once and never cleared.
    pub fenced_by: Option<SnapshotVersion>,
}

pub struct BackupWorker {
    store: FleetStore,
    storage: Arc<dyn SnapshotStorage>,
    events: Arc<EventRecorder>,
    config: BackupConfig,
    /// Last allocated version. Held for the whole backup, which keeps
    /// snapshot N+1 from starting before N is finished.
    last_version: Mutex<SnapshotVersion>,
    status: watch::Sender<BackupStatus>,
}

impl BackupWorker {
    /// `after` is the newest version known to exist in storage.
    pub fn new(
        store: FleetStore,
        storage: Arc<dyn SnapshotStorage>,
        events: Arc<EventRecorder>,
        config: BackupConfig,
        after: Option<SnapshotVersion>,
    ) -> Self {
        let (status, _) = watch::channel(BackupStatus {
            last_version: after,
            ..Default::default()
        });
        Self {
            store,
            storage,
            events,
            config,
            last_version: Mutex::new(after.unwrap_or_default()),
            status,
        }
    }

    pub fn status(&self) -> BackupStatus {
        *self.status.borrow()
    }

    /// Observe backup status changes.
    pub fn subscribe(&self) -> watch::Receiver<BackupStatus> {
        self.status.subscribe()
    }

    /// Resolves once a newer writer has fenced this worker off.
    pub async fn fenced(&self) -> SnapshotVersion {
        let mut rx = self.status.subscribe();
        let fenced_by = match rx.wait_for(|s| s.fenced_by.is_some()).await {
            Ok(status) => status.fenced_by,
            Err(_) => None,
        };
        match fenced_by {
            Some(latest) => latest,
            // The sender lives in `self`, so the channel cannot close first.
            None => std::future::pending().await,
        }
    }

    /// Move the version floor up to `version` if it is ahead.
    pub async fn advance_to(&self, version: SnapshotVersion) {
        let mut last = self.last_version.lock().await;
        if version > *last {
            *last = version;
        }
    }

    #[instrument(skip(self, gate, shutdown))]
    pub async fn run(&self, gate: LeadershipGate, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            res = gate.await_elected() => {
                if let Err(e) = res {
                    info!(reason = %e, "Backup worker not started");
                    return;
                }
            }
            _ = shutdown_requested(&mut shutdown) => return,
        }

        info!(
            interval_secs = self.config.interval.as_secs(),
            max_attempts = self.config.max_attempts,
            storage = %self.storage.describe(),
            "Starting backup worker"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = gate.lost() => {
                    info!("Leadership lost, backup worker stopping");
                    return;
                }
                _ = shutdown_requested(&mut shutdown) => {
                    break;
                }
                _ = interval.tick() => {
                    tokio::select! {
                        biased;
                        _ = gate.lost() => {
                            warn!("Leadership lost during backup, abandoning it");
                            return;
                        }
                        res = self.backup_once() => {
                            if let Err(BackupError::Fenced { latest, .. }) = res {
                                error!(%latest, "Backup fenced off by a newer writer, worker stopping");
                                return;
                            }
                            log_result(res);
                        }
                    }
                }
            }
        }

        if gate.is_elected() && self.status().fenced_by.is_none() {
            info!("Taking final backup before shutdown");
            log_result(self.backup_once().await);
        }
        info!("Backup worker shutting down");
    }

    /// Capture the store and persist it, retrying within the configured
    /// bounds. Returns the version written.
    ///
    /// Once fenced, every call fails with [`BackupError::Fenced`] without
    /// touching storage.
    pub async fn backup_once(&self) -> Result<SnapshotVersion, BackupError> {
        let mut last_version = self.last_version.lock().await;
        if let Some(latest) = self.status().fenced_by {
            return Err(BackupError::Fenced {
                attempted: last_version.next(),
                latest,
            });
        }
        let capture = self.store.capture().await;
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            let version = last_version.next();
            *last_version = version;
            let snapshot = FleetSnapshot::new(version, capture.instances.clone());

            let err = match tokio::time::timeout(
                self.config.write_timeout,
                self.storage.write(&snapshot),
            )
            .await
            {
                Ok(Ok(())) => {
                    self.record_success(version, snapshot.instance_count());
                    return Ok(version);
                }
                Ok(Err(StorageError::StaleVersion { attempted, latest })) => {
                    self.status.send_modify(|s| {
                        s.consecutive_failures += 1;
                        s.fenced_by = Some(latest);
                    });
                    return Err(BackupError::Fenced { attempted, latest });
                }
                Ok(Err(e)) => BackupError::Storage(e),
                Err(_) => BackupError::Timeout(self.config.write_timeout),
            };

            warn!(
                %version,
                attempt = attempt + 1,
                max_attempts = attempts,
                error = %err,
                "Snapshot write failed"
            );
            last_error = Some(err);

            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.backoff.delay(attempt)).await;
            }
        }

        self.record_failure();
        Err(BackupError::Exhausted {
            attempts,
            last: Box::new(last_error.unwrap_or(BackupError::Timeout(self.config.write_timeout))),
        })
    }

    fn record_success(&self, version: SnapshotVersion, instance_count: usize) {
        self.status.send_modify(|s| {
            s.last_version = Some(version);
            s.last_success_at = Some(Utc::now());
            s.consecutive_failures = 0;
        });
        self.events.record(
            version.to_string(),
            ActorType::System,
            FleetEventPayload::SnapshotWritten(SnapshotWrittenPayload {
                version,
                instance_count,
            }),
        );
        debug!(%version, instance_count, "Snapshot written");
    }

    fn record_failure(&self) {
        self.status.send_modify(|s| s.consecutive_failures += 1);
    }
}

fn log_result(res: Result<SnapshotVersion, BackupError>) {
    match res {
        Ok(version) => info!(%version, "Backup complete"),
        Err(e @ BackupError::Fenced { .. }) => error!(error = %e, "Backup fenced off"),
        Err(e) => warn!(error = %e, "Backup failed, will retry next interval"),
    }
}
