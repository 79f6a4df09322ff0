// src/core/ha/database.rs

//! Database Adapter (DA): wraps the local PostgreSQL instance behind a
//! typed async interface, shelling out to `pg_ctl`/`psql`/`pg_basebackup`
//! the same way `postgresql.py` wraps `psycopg2` and `subprocess.call` in
//! the original implementation.

use super::config::{ArchiveConfig, PostgresqlConfig};
use super::coordination::ClusterView;
use super::decision::prefer_archive;
use super::error::HaError;
use async_trait::async_trait;
use std::collections::HashSet;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// The role this node's database is currently acting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Replica,
    Uninitialized,
}

/// Hook invoked whenever this node's role changes, so that an external
/// collaborator (e.g. cloud instance tagging) can react. Out of scope for
/// this crate beyond the interface: only a no-op implementation ships here.
pub trait RoleChangeHook: Send + Sync {
    fn on_role_change(&self, new_role: Role);
}

/// Default hook; does nothing.
pub struct NoopRoleChangeHook;

impl RoleChangeHook for NoopRoleChangeHook {
    fn on_role_change(&self, _new_role: Role) {}
}

/// Everything the HA Decision Engine and Supervisor Loop need from the
/// local database instance.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// True if `data_dir` contains no cluster (first boot).
    async fn data_directory_empty(&self) -> bool;
    /// `initdb` + bootstrap roles + `pg_hba.conf`. Only ever called by the
    /// node that wins the `/initialize` race.
    async fn initialize(&self) -> Result<(), HaError>;
    /// Starts `postgres` under `pg_ctl`, clearing any stale PID file first.
    async fn start(&self) -> Result<(), HaError>;
    /// Stops `postgres` with `pg_ctl stop -m fast`.
    async fn stop(&self) -> Result<(), HaError>;
    /// `stop()` followed by `start()`.
    async fn restart(&self) -> Result<(), HaError>;
    /// Asks the running instance to reread its configuration files.
    async fn reload(&self) -> Result<(), HaError>;
    /// True if the local process is up, independent of whether it is
    /// accepting client connections yet.
    async fn is_running(&self) -> bool;
    /// True if the instance accepts connections and answers a trivial query.
    async fn is_healthy(&self) -> bool;
    /// True if the instance is not in recovery (i.e. currently primary).
    async fn is_leader(&self) -> bool;
    /// Writes the promotion trigger file (or calls `pg_ctl promote`) and
    /// waits for the instance to leave recovery.
    async fn promote(&self) -> Result<(), HaError>;
    /// Writes standby configuration referencing `leader_conn_url`, without
    /// restarting or reloading. Used during bootstrap, before the instance
    /// has ever started, and by `check_recovery_conf`'s steady-state sibling.
    async fn write_recovery_conf(&self, leader_conn_url: &str) -> Result<(), HaError>;
    /// True iff the on-disk standby configuration already matches
    /// `leader_conn_url`; lets the steady-state follow path skip a restart
    /// when nothing changed (testable property in §8).
    async fn check_recovery_conf(&self, leader_conn_url: &str) -> bool;
    /// Ensures standby configuration points at `leader_conn_url`, then
    /// restarts unconditionally. Used for the leader-to-follower transition,
    /// where a restart is needed regardless of what was on disk before.
    async fn demote(&self, leader_conn_url: &str) -> Result<(), HaError>;
    /// Provisions the initial data directory from `leader_conn_url`: tries
    /// an archive restore first when configured and preferable per §4.2.1,
    /// otherwise streams a base copy; falls back to the streaming copy if
    /// the archive path fails.
    async fn sync_from_leader(&self, leader_conn_url: &str) -> Result<(), HaError>;
    /// Current WAL/LSN position, as primary or as replay position in recovery.
    async fn xlog_position(&self) -> Result<i64, HaError>;
    /// Reconciles replication slots to exactly `wanted`, dropping the rest.
    async fn create_replication_slots(&self, wanted: &HashSet<String>) -> Result<(), HaError>;
    /// §4.2.2: candidacy for promotion. True if this node is already the
    /// leader (stability); false if it lags the cluster's best-known
    /// position past `maximum_lag`; otherwise true unless a reachable peer
    /// in `view` is a running primary or is strictly ahead of this node.
    async fn is_healthiest_node(&self, view: &ClusterView, self_name: &str, maximum_lag: i64) -> bool;
}

/// `DatabaseAdapter` backed by a real local PostgreSQL instance, driven via
/// child processes exactly as the original `Postgresql` helper does.
pub struct PostgresAdapter {
    config: PostgresqlConfig,
    hook: Box<dyn RoleChangeHook>,
}

impl PostgresAdapter {
    pub fn new(config: PostgresqlConfig, hook: Box<dyn RoleChangeHook>) -> Self {
        Self { config, hook }
    }

    fn pg_ctl_path(&self) -> &str {
        "pg_ctl"
    }

    fn pid_file(&self) -> String {
        format!("{}/postmaster.pid", self.config.data_dir)
    }

    fn trigger_file(&self) -> String {
        format!("{}/promote.trigger", self.config.data_dir)
    }

    fn recovery_conf_path(&self) -> String {
        format!("{}/recovery.conf", self.config.data_dir)
    }

    fn standby_signal_path(&self) -> String {
        format!("{}/standby.signal", self.config.data_dir)
    }

    fn superuser_conn_args(&self) -> Vec<String> {
        let (host, port) = split_host_port(&self.config.listen);
        vec![
            "-h".into(),
            host,
            "-p".into(),
            port,
            "-d".into(),
            "postgres".into(),
        ]
    }

    async fn run_psql(&self, sql: &str) -> Result<String, HaError> {
        let mut args = self.superuser_conn_args();
        args.push("-tAc".into());
        args.push(sql.to_string());

        let output = Command::new("psql")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HaError::Fatal(format!("psql spawn failed: {e}")))?;

        if !output.status.success() {
            return Err(HaError::DatabaseUnavailable);
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn write_pg_hba(&self) -> Result<(), HaError> {
        let mut lines = vec![
            "local all all trust".to_string(),
            "host all all 127.0.0.1/32 trust".to_string(),
            format!(
                "host replication {} {} md5",
                self.config.replication.username, self.config.replication.network
            ),
        ];
        lines.extend(self.config.pg_hba.iter().cloned());

        let path = format!("{}/pg_hba.conf", self.config.data_dir);
        fs::write(&path, lines.join("\n") + "\n")
            .await
            .map_err(|e| HaError::Fatal(format!("failed to write pg_hba.conf: {e}")))
    }

    /// The declarative standby configuration content for `leader_conn_url`,
    /// shared between `write_recovery_conf` and `check_recovery_conf` so the
    /// two can never disagree on what "matches" means.
    fn recovery_conf_content(&self, leader_conn_url: &str) -> String {
        let mut lines = vec![format!(
            "primary_conninfo = '{} application_name={}'",
            leader_conn_url, self.config.name
        )];
        for (key, value) in &self.config.recovery_conf {
            lines.push(format!("{key} = '{value}'"));
        }
        lines.join("\n") + "\n"
    }

    /// Queries one peer's recovery flag and `mine - peer.replay_position` in
    /// a single round-trip, per §4.2.2. `None` means the peer was
    /// unreachable, which the caller treats as no evidence against it.
    async fn probe_peer(&self, peer_conn_url: &str, mine: i64) -> Option<(bool, i64)> {
        let output = Command::new("psql")
            .args([
                peer_conn_url,
                "-tAc",
                "SELECT pg_is_in_recovery(), \
                 COALESCE(pg_wal_lsn_diff(pg_last_wal_replay_lsn(), '0/0')::bigint, 0)",
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let row = String::from_utf8_lossy(&output.stdout);
        let (recovery, replay) = row.trim().split_once('|')?;
        let in_recovery = recovery == "t";
        let replay_position: i64 = replay.trim().parse().ok()?;
        Some((in_recovery, mine - replay_position))
    }

    /// Queries `leader_conn_url`'s current write position the same way
    /// `xlog_position` queries the local instance, for the §4.2.1 delta
    /// computation.
    async fn remote_xlog_position(&self, leader_conn_url: &str) -> Result<i64, HaError> {
        let output = Command::new("psql")
            .args([
                leader_conn_url,
                "-tAc",
                "SELECT pg_wal_lsn_diff(pg_current_wal_lsn(), '0/0')::bigint",
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HaError::ArchiveRestoreFailed(format!("psql spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(HaError::ArchiveRestoreFailed(
                "failed to query leader's xlog position".into(),
            ));
        }
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .map_err(|_| HaError::ArchiveRestoreFailed("malformed leader xlog position".into()))
    }

    /// Lists the archive's backups and parses the latest one's metadata. A
    /// malformed listing (per §4.2.1: "a malformed listing disqualifies the
    /// archive path") surfaces as `ArchiveRestoreFailed` so the caller falls
    /// back to basecopy.
    async fn fetch_archive_metadata(&self, archive: &ArchiveConfig) -> Result<ArchiveBackupMeta, HaError> {
        let output = Command::new("envdir")
            .arg(&archive.env_dir)
            .args(["wal-e", "backup-list", "--detail"])
            .output()
            .await
            .map_err(|e| HaError::ArchiveRestoreFailed(format!("wal-e backup-list spawn failed: {e}")))?;
        if !output.status.success() {
            return Err(HaError::ArchiveRestoreFailed(
                "wal-e backup-list exited non-zero".into(),
            ));
        }
        parse_backup_list(&String::from_utf8_lossy(&output.stdout))
    }

    /// Implements §4.2.1: fetches the archive's latest backup metadata,
    /// computes the WAL delta between it and the live leader, and only
    /// restores from the archive when that delta clears both thresholds.
    /// Any failure along the way (unreachable archive, malformed listing,
    /// unreachable leader, or the thresholds not clearing) is an `Err`, and
    /// the caller falls back to the streaming base copy.
    async fn try_archive_restore(
        &self,
        archive: &ArchiveConfig,
        leader_conn_url: &str,
    ) -> Result<(), HaError> {
        let meta = self.fetch_archive_metadata(archive).await?;
        let leader_position = self.remote_xlog_position(leader_conn_url).await?;
        let diff_bytes = leader_position.saturating_sub(meta.start_position).max(0) as u64;

        if !prefer_archive(
            diff_bytes,
            meta.backup_size_bytes,
            archive.threshold_megabytes,
            archive.threshold_backup_size_percentage,
        ) {
            return Err(HaError::ArchiveRestoreFailed(
                "WAL delta exceeds archive thresholds; basecopy preferred".into(),
            ));
        }

        self.restore_from_archive(archive).await
    }

    /// Restores the data directory from the archive. Internal to
    /// `sync_from_leader`'s §4.2.1 decision; never called unconditionally.
    async fn restore_from_archive(&self, archive: &ArchiveConfig) -> Result<(), HaError> {
        if !self.data_directory_empty().await {
            fs::remove_dir_all(&self.config.data_dir)
                .await
                .map_err(|e| HaError::ArchiveRestoreFailed(format!("failed to clear data dir: {e}")))?;
        }

        let status = Command::new("envdir")
            .arg(&archive.env_dir)
            .args(["wal-e", "backup-fetch", &self.config.data_dir, "LATEST"])
            .status()
            .await
            .map_err(|e| HaError::ArchiveRestoreFailed(e.to_string()))?;

        if !status.success() {
            return Err(HaError::ArchiveRestoreFailed("wal-e backup-fetch exited non-zero".into()));
        }

        let _ = fs::remove_file(self.trigger_file()).await;
        Ok(())
    }

    /// Streams a fresh copy of the leader's data directory via `pg_basebackup`.
    async fn basecopy_from_leader(&self, leader_conn_url: &str) -> Result<(), HaError> {
        if !self.data_directory_empty().await {
            fs::remove_dir_all(&self.config.data_dir)
                .await
                .map_err(|e| HaError::BasecopyFailed(format!("failed to clear data dir: {e}")))?;
        }

        let status = Command::new("pg_basebackup")
            .args([
                "-D",
                &self.config.data_dir,
                "-d",
                leader_conn_url,
                "-U",
                &self.config.replication.username,
                "-X",
                "stream",
                "-P",
            ])
            .status()
            .await
            .map_err(|e| HaError::BasecopyFailed(e.to_string()))?;

        if !status.success() {
            return Err(HaError::BasecopyFailed("pg_basebackup exited non-zero".into()));
        }

        let _ = fs::remove_file(self.trigger_file()).await;
        Ok(())
    }
}

/// Metadata of the archive's most recent backup, parsed from a
/// `wal-e backup-list --detail` listing: the LSN its WAL replay must start
/// from, and its expanded on-disk size.
pub struct ArchiveBackupMeta {
    pub start_position: i64,
    pub backup_size_bytes: u64,
}

/// Parses the last (most recent) data row of a `wal-e backup-list --detail`
/// table. Expected columns, tab- or whitespace-separated: `name`,
/// `last_modified`, `expanded_size_bytes`, `wal_segment_backup_start`,
/// `wal_segment_offset_backup_start`. Any shape mismatch is a malformed
/// listing.
pub fn parse_backup_list(raw: &str) -> Result<ArchiveBackupMeta, HaError> {
    let last_row = raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .next_back()
        .ok_or_else(|| HaError::ArchiveRestoreFailed("archive has no backups listed".into()))?;

    let columns: Vec<&str> = last_row.split_whitespace().collect();
    if columns.len() < 4 {
        return Err(HaError::ArchiveRestoreFailed(format!(
            "malformed backup-list row: {last_row}"
        )));
    }

    let backup_size_bytes: u64 = columns[2]
        .parse()
        .map_err(|_| HaError::ArchiveRestoreFailed("malformed expanded_size_bytes column".into()))?;
    let start_position: i64 = parse_wal_segment_to_lsn(columns[3])?;

    Ok(ArchiveBackupMeta {
        start_position,
        backup_size_bytes,
    })
}

/// WAL-E segment names are 24-character hex strings: 8 hex digits of
/// timeline, 8 of the high 32 bits of the LSN, 8 of the log segment number.
/// Each segment spans 16 MiB (2^24 bytes), so the byte offset the backup
/// starts from is the high bits shifted up by 32 plus the segment number
/// shifted up by 24, matching `should_use_s3_to_create_replica`'s xlog
/// arithmetic — not the raw low 40 bits of the segment name.
pub fn parse_wal_segment_to_lsn(segment: &str) -> Result<i64, HaError> {
    if segment.len() != 24 || !segment.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(HaError::ArchiveRestoreFailed(format!(
            "malformed wal_segment_backup_start column: {segment}"
        )));
    }
    let high_bits = u64::from_str_radix(&segment[8..16], 16)
        .map_err(|_| HaError::ArchiveRestoreFailed("unparseable wal segment".into()))?;
    let segment_no = u64::from_str_radix(&segment[16..24], 16)
        .map_err(|_| HaError::ArchiveRestoreFailed("unparseable wal segment".into()))?;
    let byte_offset = (high_bits << 32) + (segment_no << 24);
    i64::try_from(byte_offset)
        .map_err(|_| HaError::ArchiveRestoreFailed("wal segment offset overflowed i64".into()))
}

/// Splits `host:port`, defaulting the port to `5432` if absent.
fn split_host_port(listen: &str) -> (String, String) {
    match listen.split_once(':') {
        Some((h, p)) => (h.to_string(), p.to_string()),
        None => (listen.to_string(), "5432".to_string()),
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn data_directory_empty(&self) -> bool {
        match fs::read_dir(&self.config.data_dir).await {
            Ok(mut entries) => entries.next_entry().await.ok().flatten().is_none(),
            Err(_) => true,
        }
    }

    async fn initialize(&self) -> Result<(), HaError> {
        info!("initializing new database cluster at {}", self.config.data_dir);

        let status = Command::new(self.pg_ctl_path())
            .args(["initdb", "-D", &self.config.data_dir])
            .status()
            .await
            .map_err(|e| HaError::Fatal(format!("initdb spawn failed: {e}")))?;
        if !status.success() {
            return Err(HaError::Fatal("initdb failed".into()));
        }

        self.start().await?;

        self.run_psql(&format!(
            "CREATE USER {} WITH REPLICATION ENCRYPTED PASSWORD '{}'",
            self.config.replication.username, self.config.replication.password
        ))
        .await?;

        if let Some(admin) = &self.config.admin {
            let username = admin.username.as_deref().unwrap_or("admin");
            self.run_psql(&format!(
                "CREATE USER {} WITH CREATEDB CREATEROLE ENCRYPTED PASSWORD '{}'",
                username, admin.password
            ))
            .await?;
        }

        let status = Command::new(self.pg_ctl_path())
            .args(["stop", "-D", &self.config.data_dir, "-m", "fast"])
            .status()
            .await
            .map_err(|e| HaError::Fatal(format!("pg_ctl stop failed: {e}")))?;
        if !status.success() {
            return Err(HaError::Fatal("pg_ctl stop failed during initialize".into()));
        }

        self.write_pg_hba().await?;
        Ok(())
    }

    async fn start(&self) -> Result<(), HaError> {
        // A stale PID file left over from an unclean shutdown makes pg_ctl
        // refuse to start; removing it first mirrors the original's
        // unconditional cleanup in `start()`.
        let _ = fs::remove_file(self.pid_file()).await;

        let mut cmd = Command::new(self.pg_ctl_path());
        cmd.args(["start", "-D", &self.config.data_dir, "-w"]);
        for (key, value) in &self.config.parameters {
            cmd.arg("-o").arg(format!("--{key}={value}"));
        }

        let status = cmd
            .status()
            .await
            .map_err(|e| HaError::Fatal(format!("pg_ctl start spawn failed: {e}")))?;
        if !status.success() {
            return Err(HaError::DatabaseUnavailable);
        }

        // Role is derived from a live probe of the recovery flag rather than
        // trusting the presence of the standby marker file alone, since a
        // promoted-but-not-yet-restarted node would otherwise misreport.
        let role = if self.is_leader().await {
            Role::Leader
        } else {
            Role::Replica
        };
        self.hook.on_role_change(role);
        Ok(())
    }

    async fn stop(&self) -> Result<(), HaError> {
        let status = Command::new(self.pg_ctl_path())
            .args(["stop", "-D", &self.config.data_dir, "-m", "fast"])
            .status()
            .await
            .map_err(|e| HaError::Fatal(format!("pg_ctl stop spawn failed: {e}")))?;
        if !status.success() {
            warn!("pg_ctl stop returned non-zero for {}", self.config.name);
        }
        Ok(())
    }

    async fn restart(&self) -> Result<(), HaError> {
        self.stop().await?;
        self.start().await
    }

    async fn reload(&self) -> Result<(), HaError> {
        let status = Command::new(self.pg_ctl_path())
            .args(["reload", "-D", &self.config.data_dir])
            .status()
            .await
            .map_err(|e| HaError::Fatal(format!("pg_ctl reload spawn failed: {e}")))?;
        if !status.success() {
            return Err(HaError::Fatal("pg_ctl reload failed".into()));
        }
        Ok(())
    }

    async fn is_running(&self) -> bool {
        Command::new(self.pg_ctl_path())
            .args(["status", "-D", &self.config.data_dir])
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn is_healthy(&self) -> bool {
        self.run_psql("SELECT 1").await.is_ok()
    }

    async fn is_leader(&self) -> bool {
        matches!(self.run_psql("SELECT pg_is_in_recovery()").await.as_deref(), Ok("f"))
    }

    async fn promote(&self) -> Result<(), HaError> {
        let status = Command::new(self.pg_ctl_path())
            .args(["promote", "-D", &self.config.data_dir, "-w"])
            .status()
            .await
            .map_err(|e| HaError::Fatal(format!("pg_ctl promote spawn failed: {e}")))?;
        if !status.success() {
            return Err(HaError::Fatal("pg_ctl promote failed".into()));
        }

        let _ = fs::remove_file(self.trigger_file()).await;
        let _ = fs::remove_file(self.recovery_conf_path()).await;
        let _ = fs::remove_file(self.standby_signal_path()).await;

        self.hook.on_role_change(Role::Leader);
        Ok(())
    }

    async fn write_recovery_conf(&self, leader_conn_url: &str) -> Result<(), HaError> {
        fs::write(
            self.recovery_conf_path(),
            self.recovery_conf_content(leader_conn_url),
        )
        .await
        .map_err(|e| HaError::Fatal(format!("failed to write recovery.conf: {e}")))?;
        let _ = fs::write(self.standby_signal_path(), b"").await;
        Ok(())
    }

    async fn check_recovery_conf(&self, leader_conn_url: &str) -> bool {
        match fs::read_to_string(self.recovery_conf_path()).await {
            Ok(on_disk) => on_disk == self.recovery_conf_content(leader_conn_url),
            Err(_) => false,
        }
    }

    async fn demote(&self, leader_conn_url: &str) -> Result<(), HaError> {
        self.write_recovery_conf(leader_conn_url).await?;
        self.restart().await?;
        self.hook.on_role_change(Role::Replica);
        Ok(())
    }

    async fn sync_from_leader(&self, leader_conn_url: &str) -> Result<(), HaError> {
        if let Some(archive) = &self.config.wal_e {
            match self.try_archive_restore(archive, leader_conn_url).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(
                        "archive restore not taken, falling back to basecopy: {}",
                        e
                    );
                }
            }
        }
        self.basecopy_from_leader(leader_conn_url).await
    }

    async fn xlog_position(&self) -> Result<i64, HaError> {
        let raw = self
            .run_psql(
                "SELECT CASE WHEN pg_is_in_recovery() \
                 THEN pg_wal_lsn_diff(pg_last_wal_replay_lsn(), '0/0')::bigint \
                 ELSE pg_wal_lsn_diff(pg_current_wal_lsn(), '0/0')::bigint END",
            )
            .await?;
        raw.parse().map_err(|_| HaError::DatabaseUnavailable)
    }

    async fn create_replication_slots(&self, wanted: &HashSet<String>) -> Result<(), HaError> {
        let existing_raw = self
            .run_psql("SELECT string_agg(slot_name, ',') FROM pg_replication_slots")
            .await?;
        let existing: HashSet<String> = existing_raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        for stale in existing.difference(wanted) {
            debug!("dropping stale replication slot {}", stale);
            let _ = self
                .run_psql(&format!("SELECT pg_drop_replication_slot('{stale}')"))
                .await;
        }

        for missing in wanted.difference(&existing) {
            debug!("creating replication slot {}", missing);
            self.run_psql(&format!(
                "SELECT pg_create_physical_replication_slot('{missing}')"
            ))
            .await?;
        }

        Ok(())
    }

    async fn is_healthiest_node(&self, view: &ClusterView, self_name: &str, maximum_lag: i64) -> bool {
        if view.leader.as_ref().is_some_and(|l| l.name == self_name) {
            return true;
        }
        if !self.is_healthy().await {
            return false;
        }

        let mine = match self.xlog_position().await {
            Ok(pos) => pos,
            Err(_) => return false,
        };
        // `maximum_lag == 0` means zero tolerated lag, not "disabled"; the
        // original defaults to 0 and still enforces the guard.
        if view.last_leader_operation - mine > maximum_lag {
            return false;
        }

        for peer in view.members.iter().filter(|m| m.name != self_name) {
            match self.probe_peer(&peer.conn_url, mine).await {
                // A reachable primary, or a peer strictly ahead of us, rules
                // this node out; an unreachable peer counts as no evidence
                // against it.
                Some((peer_in_recovery, diff)) => {
                    if !peer_in_recovery || diff < 0 {
                        return false;
                    }
                }
                None => continue,
            }
        }
        true
    }
}

