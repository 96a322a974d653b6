use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, ensure, Result};
use fleetsim_id::ReplicaId;

use crate::backup::BackupConfig;
use crate::chaos::{ChaosConfig, ChaosSelection};
use crate::janitor::JanitorConfig;
use crate::storage::StorageBackend;

/// How this replica obtains leadership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionConfig {
    Standalone,
    Lease {
        path: PathBuf,
        duration: Duration,
        renew_interval: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub replica_id: ReplicaId,
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub data_dir: PathBuf,
    pub storage: StorageBackend,
    pub backup: BackupConfig,
    pub chaos: ChaosConfig,
    pub janitor: JanitorConfig,
    /// Live instance cap; `None` means unlimited.
    pub max_instances: Option<usize>,
    pub boot_delay: Duration,
    pub shutdown_delay: Duration,
    pub election: ElectionConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let replica_id = match env.get("FLEETSIM_REPLICA_ID") {
            Some(raw) => ReplicaId::parse(&raw)
                .map_err(|e| anyhow!("invalid FLEETSIM_REPLICA_ID={raw:?}: {e}"))?,
            None => ReplicaId::new(),
        };

        let listen_addr: SocketAddr =
            env.parse_or("FLEETSIM_LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 8080)))?;
        let log_level = env
            .get("FLEETSIM_LOG_LEVEL")
            .unwrap_or_else(|| "info".to_string());
        let data_dir: PathBuf =
            env.parse_or("FLEETSIM_DATA_DIR", PathBuf::from("/var/lib/fleetsim"))?;

        let storage = match env.get("FLEETSIM_STORAGE_BACKEND").as_deref() {
            None | Some("file") => StorageBackend::File {
                dir: data_dir.clone(),
            },
            Some("sqlite") => {
                let retain: usize = env.parse_or("FLEETSIM_SNAPSHOT_RETENTION", 10)?;
                ensure!(retain > 0, "FLEETSIM_SNAPSHOT_RETENTION must be at least 1");
                StorageBackend::Sqlite {
                    path: data_dir.join("snapshots.db"),
                    retain,
                }
            }
            Some("memory") => StorageBackend::Memory,
            Some(other) => bail!(
                "invalid FLEETSIM_STORAGE_BACKEND={other:?}: expected file, sqlite or memory"
            ),
        };

        let backup_defaults = BackupConfig::default();
        let backup = BackupConfig {
            interval: env.secs_or("FLEETSIM_BACKUP_INTERVAL_SECS", 30)?,
            max_attempts: env.parse_or("FLEETSIM_BACKUP_MAX_ATTEMPTS", 3)?,
            write_timeout: env.secs_or("FLEETSIM_BACKUP_WRITE_TIMEOUT_SECS", 10)?,
            backoff: backup_defaults.backoff,
        };
        ensure!(!backup.interval.is_zero(), "FLEETSIM_BACKUP_INTERVAL_SECS must be positive");
        ensure!(backup.max_attempts > 0, "FLEETSIM_BACKUP_MAX_ATTEMPTS must be at least 1");
        ensure!(
            !backup.write_timeout.is_zero(),
            "FLEETSIM_BACKUP_WRITE_TIMEOUT_SECS must be positive"
        );

        let selection = match env.get("FLEETSIM_CHAOS_MODE").as_deref() {
            None | Some("fixed") => ChaosSelection::Fixed {
                count: env.parse_or("FLEETSIM_CHAOS_COUNT", 1)?,
            },
            Some("rate") => {
                let probability: f64 = env.parse_or("FLEETSIM_CHAOS_RATE", 0.05)?;
                ensure!(
                    (0.0..=1.0).contains(&probability),
                    "FLEETSIM_CHAOS_RATE must be between 0 and 1"
                );
                ChaosSelection::Rate { probability }
            }
            Some(other) => bail!("invalid FLEETSIM_CHAOS_MODE={other:?}: expected fixed or rate"),
        };
        let chaos = ChaosConfig {
            enabled: env.bool_or("FLEETSIM_CHAOS_ENABLED", true)?,
            interval: env.secs_or("FLEETSIM_CHAOS_INTERVAL_SECS", 60)?,
            jitter: env.secs_or("FLEETSIM_CHAOS_JITTER_SECS", 15)?,
            selection,
            min_survivors: env.parse_or("FLEETSIM_CHAOS_MIN_SURVIVORS", 0)?,
            seed: env.parse_opt("FLEETSIM_CHAOS_SEED")?,
        };
        ensure!(!chaos.interval.is_zero(), "FLEETSIM_CHAOS_INTERVAL_SECS must be positive");

        let janitor = JanitorConfig {
            interval: env.secs_or("FLEETSIM_JANITOR_INTERVAL_SECS", 300)?,
            terminated_retention: env.secs_or("FLEETSIM_TERMINATED_RETENTION_SECS", 3600)?,
        };
        ensure!(!janitor.interval.is_zero(), "FLEETSIM_JANITOR_INTERVAL_SECS must be positive");

        let max_instances = match env.parse_or("FLEETSIM_MAX_INSTANCES", 1000usize)? {
            0 => None,
            n => Some(n),
        };

        let election = match env.get("FLEETSIM_ELECTION").as_deref() {
            None | Some("standalone") => ElectionConfig::Standalone,
            Some("lease") => {
                let duration = env.secs_or("FLEETSIM_LEASE_DURATION_SECS", 15)?;
                let renew_interval = env.secs_or("FLEETSIM_LEASE_RENEW_SECS", 5)?;
                ensure!(
                    !renew_interval.is_zero() && renew_interval < duration,
                    "FLEETSIM_LEASE_RENEW_SECS must be positive and shorter than FLEETSIM_LEASE_DURATION_SECS"
                );
                ElectionConfig::Lease {
                    path: env.parse_or("FLEETSIM_LEASE_PATH", data_dir.join("leader.db"))?,
                    duration,
                    renew_interval,
                }
            }
            Some(other) => {
                bail!("invalid FLEETSIM_ELECTION={other:?}: expected standalone or lease")
            }
        };

        Ok(Self {
            replica_id,
            listen_addr,
            log_level,
            data_dir,
            storage,
            backup,
            chaos,
            janitor,
            max_instances,
            boot_delay: Duration::from_millis(env.parse_or("FLEETSIM_BOOT_DELAY_MS", 0)?),
            shutdown_delay: Duration::from_millis(env.parse_or("FLEETSIM_SHUTDOWN_DELAY_MS", 0)?),
            election,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank are the same.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_opt<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}"))
            })
            .transpose()
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parse_opt(key)?.unwrap_or(default))
    }

    fn secs_or(&self, key: &str, default: u64) -> Result<Duration> {
        Ok(Duration::from_secs(self.parse_or(key, default)?))
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => bail!("invalid {key}={raw:?}: expected a boolean"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rstest::rstest;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.log_level, "info");
        assert_eq!(
            config.storage,
            StorageBackend::File {
                dir: PathBuf::from("/var/lib/fleetsim")
            }
        );
        assert_eq!(config.backup.interval, Duration::from_secs(30));
        assert_eq!(config.backup.max_attempts, 3);
        assert!(config.chaos.enabled);
        assert_eq!(config.chaos.interval, Duration::from_secs(60));
        assert_eq!(config.chaos.jitter, Duration::from_secs(15));
        assert_eq!(config.chaos.selection, ChaosSelection::Fixed { count: 1 });
        assert_eq!(config.chaos.seed, None);
        assert_eq!(config.max_instances, Some(1000));
        assert_eq!(config.election, ElectionConfig::Standalone);
    }

    #[test]
    fn test_sqlite_and_lease() {
        let config = config(&[
            ("FLEETSIM_DATA_DIR", "/tmp/fleet"),
            ("FLEETSIM_STORAGE_BACKEND", "sqlite"),
            ("FLEETSIM_SNAPSHOT_RETENTION", "4"),
            ("FLEETSIM_ELECTION", "lease"),
            ("FLEETSIM_CHAOS_MODE", "rate"),
            ("FLEETSIM_CHAOS_RATE", "0.5"),
            ("FLEETSIM_CHAOS_SEED", "99"),
            ("FLEETSIM_MAX_INSTANCES", "0"),
        ])
        .unwrap();

        assert_eq!(
            config.storage,
            StorageBackend::Sqlite {
                path: PathBuf::from("/tmp/fleet/snapshots.db"),
                retain: 4
            }
        );
        assert_eq!(
            config.election,
            ElectionConfig::Lease {
                path: PathBuf::from("/tmp/fleet/leader.db"),
                duration: Duration::from_secs(15),
                renew_interval: Duration::from_secs(5),
            }
        );
        assert_eq!(
            config.chaos.selection,
            ChaosSelection::Rate { probability: 0.5 }
        );
        assert_eq!(config.chaos.seed, Some(99));
        assert_eq!(config.max_instances, None);
    }

    #[rstest]
    #[case("FLEETSIM_STORAGE_BACKEND", "s3")]
    #[case("FLEETSIM_BACKUP_INTERVAL_SECS", "0")]
    #[case("FLEETSIM_BACKUP_INTERVAL_SECS", "soon")]
    #[case("FLEETSIM_BACKUP_MAX_ATTEMPTS", "0")]
    #[case("FLEETSIM_CHAOS_ENABLED", "maybe")]
    #[case("FLEETSIM_CHAOS_MODE", "random")]
    #[case("FLEETSIM_CHAOS_COUNT", "-1")]
    #[case("FLEETSIM_CHAOS_INTERVAL_SECS", "0")]
    #[case("FLEETSIM_LISTEN_ADDR", "localhost")]
    #[case("FLEETSIM_REPLICA_ID", "node_01ARZ3NDEKTSV4RRFFQ69G5FAV")]
    #[case("FLEETSIM_ELECTION", "raft")]
    fn test_invalid_values_rejected(#[case] key: &str, #[case] value: &str) {
        assert!(config(&[(key, value)]).is_err());
    }

    #[test]
    fn test_rate_out_of_range_rejected() {
        assert!(config(&[("FLEETSIM_CHAOS_MODE", "rate"), ("FLEETSIM_CHAOS_RATE", "1.5")]).is_err());
    }

    #[test]
    fn test_lease_renew_must_be_shorter() {
        assert!(config(&[
            ("FLEETSIM_ELECTION", "lease"),
            ("FLEETSIM_LEASE_DURATION_SECS", "5"),
            ("FLEETSIM_LEASE_RENEW_SECS", "5"),
        ])
        .is_err());
    }

    #[test]
    fn test_blank_values_use_defaults() {
        let config = config(&[("FLEETSIM_CHAOS_ENABLED", "  "), ("FLEETSIM_LOG_LEVEL", "")]).unwrap();
        assert!(config.chaos.enabled);
        assert_eq!(config.log_level, "info");
    }
}
