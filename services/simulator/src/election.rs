//! Leadership electors.
//!
//! An elector drives a [`LeadershipHandle`]: it calls `elect()` once this
//! replica may write and `revoke()` the moment that is no longer certain.
//!
//! - [`StandaloneElector`]: single replica, elected immediately
//! - [`SqliteLeaseElector`]: replicas sharing one SQLite file compete for a
//!   time-bounded lease row with compare-and-set updates

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fleetsim_id::ReplicaId;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::leadership::LeadershipHandle;

/// Errors from electors.
#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("lease taken over by {holder}")]
    LeaseLost { holder: String },

    #[error("lease could not be renewed within {0:?}")]
    RenewalExpired(Duration),

    #[error("election backend unavailable: {0}")]
    Unavailable(String),
}

/// Produces the leadership signal for this process.
#[async_trait]
pub trait Elector: Send + Sync {
    /// Campaign, then hold leadership until `shutdown` fires.
    ///
    /// Returns `Ok` on orderly shutdown and an error when leadership was
    /// lost; the handle has been revoked in that case.
    async fn run(
        &self,
        handle: LeadershipHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ElectionError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// Elects this replica immediately. For single-replica deployments.
#[derive(Debug, Default)]
pub struct StandaloneElector;

#[async_trait]
impl Elector for StandaloneElector {
    async fn run(
        &self,
        handle: LeadershipHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ElectionError> {
        handle.elect();
        info!("Standalone replica elected");
        let _ = shutdown.wait_for(|stop| *stop).await;
        Ok(())
    }

    fn describe(&self) -> String {
        "standalone".to_string()
    }
}

/// Lease-based election over a shared SQLite file.
///
/// The lease is a single row `(holder, expires_at_ms, term)`. A replica
/// acquires it when it is free or expired and renews it every
/// `renew_interval`. Validity is measured from the moment the last
/// successful write was issued, and leadership is revoked half a renew
/// interval before that lease runs out, whether or not a renewal is still
/// in flight. Nobody else can acquire before then.
pub struct SqliteLeaseElector {
    conn: Arc<Mutex<Connection>>,
    holder: String,
    duration: Duration,
    renew_interval: Duration,
    location: String,
}

impl SqliteLeaseElector {
    pub fn open<P: AsRef<Path>>(
        path: P,
        replica_id: ReplicaId,
        duration: Duration,
        renew_interval: Duration,
    ) -> Result<Self, ElectionError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS leader_lease (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT,
                expires_at_ms INTEGER NOT NULL,
                term INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO leader_lease (id, holder, expires_at_ms, term)
            VALUES (1, NULL, 0, 0);
            "#,
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            holder: replica_id.to_string(),
            duration,
            renew_interval,
            location: path.display().to_string(),
        })
    }

    /// Try to take (or keep) the lease. Returns true if this replica holds it.
    pub async fn try_acquire(&self) -> Result<bool, ElectionError> {
        self.try_acquire_at(now_ms()).await
    }

    async fn try_acquire_at(&self, now_ms: i64) -> Result<bool, ElectionError> {
        let conn = Arc::clone(&self.conn);
        let holder = self.holder.clone();
        let expires_at = now_ms + duration_ms(self.duration);

        tokio::task::spawn_blocking(move || -> Result<bool, ElectionError> {
            let mut conn = lock(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let (current, current_expiry, term): (Option<String>, i64, i64) = tx.query_row(
                "SELECT holder, expires_at_ms, term FROM leader_lease WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            let acquired = match current.as_deref() {
                Some(h) if h == holder => {
                    tx.execute(
                        "UPDATE leader_lease SET expires_at_ms = ?1 WHERE id = 1",
                        params![expires_at],
                    )?;
                    true
                }
                Some(_) if current_expiry > now_ms => false,
                _ => {
                    tx.execute(
                        "UPDATE leader_lease SET holder = ?1, expires_at_ms = ?2, term = ?3 WHERE id = 1",
                        params![holder, expires_at, term + 1],
                    )?;
                    true
                }
            };
            tx.commit()?;
            Ok(acquired)
        })
        .await
        .map_err(join_error)?
    }

    /// Extend the lease if this replica still holds it.
    pub async fn renew(&self) -> Result<bool, ElectionError> {
        let conn = Arc::clone(&self.conn);
        let holder = self.holder.clone();
        let expires_at = now_ms() + duration_ms(self.duration);

        tokio::task::spawn_blocking(move || -> Result<bool, ElectionError> {
            let conn = lock(&conn)?;
            let updated = conn.execute(
                "UPDATE leader_lease SET expires_at_ms = ?1 WHERE id = 1 AND holder = ?2",
                params![expires_at, holder],
            )?;
            Ok(updated == 1)
        })
        .await
        .map_err(join_error)?
    }

    /// Give the lease up so another replica can take over without waiting
    /// for it to expire.
    pub async fn release(&self) -> Result<(), ElectionError> {
        let conn = Arc::clone(&self.conn);
        let holder = self.holder.clone();

        tokio::task::spawn_blocking(move || -> Result<(), ElectionError> {
            let conn = lock(&conn)?;
            conn.execute(
                "UPDATE leader_lease SET holder = NULL, expires_at_ms = 0 WHERE id = 1 AND holder = ?1",
                params![holder],
            )?;
            Ok(())
        })
        .await
        .map_err(join_error)?
    }

    /// Current holder and term, if any.
    pub async fn current_holder(&self) -> Result<Option<(String, i64)>, ElectionError> {
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || -> Result<Option<(String, i64)>, ElectionError> {
            let conn = lock(&conn)?;
            let row: Option<(Option<String>, i64)> = conn
                .query_row(
                    "SELECT holder, term FROM leader_lease WHERE id = 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row.and_then(|(holder, term)| holder.map(|h| (h, term))))
        })
        .await
        .map_err(join_error)?
    }
}

#[async_trait]
impl Elector for SqliteLeaseElector {
    #[instrument(skip(self, handle, shutdown), fields(holder = %self.holder))]
    async fn run(
        &self,
        handle: LeadershipHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ElectionError> {
        info!(
            location = %self.location,
            lease_secs = self.duration.as_secs(),
            renew_secs = self.renew_interval.as_secs(),
            "Campaigning for leader lease"
        );

        let mut ticker = tokio::time::interval(self.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut valid_until = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let issued = Instant::now();
                    match self.try_acquire().await {
                        Ok(true) => break issued + self.duration,
                        Ok(false) => debug!("Lease held by another replica"),
                        Err(e) => warn!(error = %e, "Lease acquisition failed"),
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        info!("Election stopped before acquiring lease");
                        return Ok(());
                    }
                }
            }
        };

        handle.elect();
        info!("Leader lease acquired");

        let margin = self.renew_interval / 2;
        loop {
            let deadline = valid_until.checked_sub(margin).unwrap_or(valid_until);
            tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => {
                    handle.revoke();
                    warn!("Lease could not be renewed before expiry");
                    return Err(ElectionError::RenewalExpired(self.duration));
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let issued = Instant::now();
                    let renewed = tokio::select! {
                        biased;
                        _ = tokio::time::sleep_until(deadline) => None,
                        res = self.renew() => Some(res),
                    };
                    match renewed {
                        Some(Ok(true)) => valid_until = issued + self.duration,
                        Some(Ok(false)) => {
                            handle.revoke();
                            let holder = self
                                .current_holder()
                                .await
                                .ok()
                                .flatten()
                                .map(|(h, _)| h)
                                .unwrap_or_else(|| "nobody".to_string());
                            warn!(new_holder = %holder, "Leader lease taken over");
                            return Err(ElectionError::LeaseLost { holder });
                        }
                        Some(Err(e)) => warn!(error = %e, "Lease renewal failed"),
                        None => {
                            handle.revoke();
                            warn!("Lease renewal still pending at expiry");
                            return Err(ElectionError::RenewalExpired(self.duration));
                        }
                    }
                }
            }
        }

        if let Err(e) = self.release().await {
            warn!(error = %e, "Failed to release leader lease");
        } else {
            info!("Leader lease released");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("lease:{}", self.location)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn lock(conn: &Mutex<Connection>) -> Result<std::sync::MutexGuard<'_, Connection>, ElectionError> {
    conn.lock()
        .map_err(|_| ElectionError::Unavailable("lease database lock poisoned".to_string()))
}

fn join_error(err: tokio::task::JoinError) -> ElectionError {
    ElectionError::Unavailable(format!("election task failed: {err}"))
}
