// src/core/ha/config.rs

//! Configuration for the HA supervisor, loaded from a standalone TOML file
//! the same way `warden.toml` is loaded for Warden mode.

use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::fs;

/// Top-level HA supervisor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HaConfig {
    /// Seconds between ticks. Must satisfy `etcd.ttl > 2 * loop_wait`.
    #[serde(with = "humantime_serde")]
    pub loop_wait: Duration,
    pub etcd: EtcdConfig,
    pub restapi: RestApiConfig,
    pub postgresql: PostgresqlConfig,
}

/// Coordination-store connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EtcdConfig {
    /// Leader and (by default) member lease TTL.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// `host:port` of the coordination store's HTTP endpoint.
    pub host: String,
    /// The cluster-scope key prefix under which all keys live.
    pub scope: String,
    /// Overrides the member-entry TTL; defaults to `ttl` when absent.
    #[serde(default, with = "humantime_serde")]
    pub member_ttl: Option<Duration>,
}

/// Admin HTTP interface binding.
#[derive(Debug, Clone, Deserialize)]
pub struct RestApiConfig {
    pub listen: String,
}

/// Credentials used by standbys to authenticate as the replication role.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationCredentials {
    pub username: String,
    pub password: String,
    pub network: String,
}

/// An administrative role created during `initialize()`.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleCredentials {
    #[serde(default)]
    pub username: Option<String>,
    pub password: String,
}

/// Archive-restore integration (`postgresql.wal_e` in the distilled spec).
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    pub env_dir: String,
    #[serde(default = "default_threshold_megabytes")]
    pub threshold_megabytes: u64,
    #[serde(default = "default_threshold_backup_size_percentage")]
    pub threshold_backup_size_percentage: u64,
}

fn default_threshold_megabytes() -> u64 {
    10240
}
fn default_threshold_backup_size_percentage() -> u64 {
    30
}

/// Settings for the local database instance this supervisor manages.
#[derive(Debug, Clone, Deserialize)]
pub struct PostgresqlConfig {
    /// Stable name of this node, unique within the cluster.
    pub name: String,
    /// `host:port` the database listens on.
    pub listen: String,
    /// Address advertised to peers; defaults to `listen` when absent.
    #[serde(default)]
    pub connect_address: Option<String>,
    pub data_dir: String,
    pub replication: ReplicationCredentials,
    #[serde(default)]
    pub superuser: Option<RoleCredentials>,
    #[serde(default)]
    pub admin: Option<RoleCredentials>,
    /// Extra server parameters forwarded as `--key=value` to `pg_ctl start`.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Extra `pg_hba.conf` lines appended after the replication rule.
    #[serde(default)]
    pub pg_hba: Vec<String>,
    /// Extra `key = 'value'` lines appended to the standby configuration.
    #[serde(default)]
    pub recovery_conf: HashMap<String, String>,
    /// Maximum bytes of WAL this node may lag the leader by and still be
    /// considered a failover candidate. `0` disables the check.
    #[serde(default)]
    pub maximum_lag_on_failover: i64,
    #[serde(default)]
    pub wal_e: Option<ArchiveConfig>,
}

impl HaConfig {
    /// Reads and parses the HA configuration file, then validates it.
    pub async fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: HaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Enforces I2: the leader lease must outlive two consecutive tick
    /// intervals, or the holder can never renew before expiry.
    fn validate(&self) -> Result<()> {
        if self.etcd.ttl <= self.loop_wait * 2 {
            return Err(anyhow!(
                "fatal: etcd.ttl ({:?}) must be greater than 2 * loop_wait ({:?})",
                self.etcd.ttl,
                self.loop_wait
            ));
        }
        if self.postgresql.name.trim().is_empty() {
            return Err(anyhow!("fatal: postgresql.name cannot be empty"));
        }
        if self.etcd.scope.trim().is_empty() {
            return Err(anyhow!("fatal: etcd.scope cannot be empty"));
        }
        Ok(())
    }

    /// The TTL used when refreshing this node's member entry.
    pub fn member_ttl(&self) -> Duration {
        self.etcd.member_ttl.unwrap_or(self.etcd.ttl)
    }
}
