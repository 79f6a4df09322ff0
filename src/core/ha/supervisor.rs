// src/core/ha/supervisor.rs

//! Supervisor Loop (SL): owns the tick cadence and ties the Coordination
//! Client, Database Adapter, and HA Decision Engine together, the way
//! `Governor` orchestrates `Etcd` and `Postgresql` in the original
//! implementation this module descends from.

use super::coordination::{ClusterView, CoordinationClient, Member};
use super::database::{DatabaseAdapter, Role};
use super::decision::{self, Action, LocalState};
use super::error::HaError;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};

/// Fixed back-off between `touch_member` retries during bootstrap only, per
/// §5's suspension-point contract.
const BOOTSTRAP_BACKOFF: Duration = Duration::from_secs(2);

/// TTL advertised on this node's member entry while it tears down, so peers
/// observe its departure within one additional tick instead of waiting out
/// the full `member_ttl` (§4.4 teardown, §6 exit side-channel).
const TEARDOWN_GRACE_TTL: Duration = Duration::from_secs(30);

/// Point-in-time snapshot the admin HTTP interface is allowed to read.
#[derive(Debug, Clone, Default)]
pub struct SupervisorSnapshot {
    pub name: String,
    pub role: Option<&'static str>,
    pub holds_lease: bool,
    pub last_action: String,
    pub cluster: Option<ClusterView>,
}

/// Owns one node's HA tick loop. Cloneable so the admin HTTP handlers can
/// hold a reference without owning the loop itself, mirroring
/// `MasterMonitor`'s relationship to `GlobalWardenState`.
#[derive(Clone)]
pub struct Supervisor {
    name: String,
    conn_url: String,
    loop_wait: Duration,
    member_ttl: Duration,
    maximum_lag_on_failover: i64,
    cc: Arc<dyn CoordinationClient>,
    da: Arc<dyn DatabaseAdapter>,
    snapshot: Arc<Mutex<SupervisorSnapshot>>,
    holds_lease: Arc<Mutex<bool>>,
}

impl Supervisor {
    pub fn new(
        name: String,
        conn_url: String,
        loop_wait: Duration,
        member_ttl: Duration,
        maximum_lag_on_failover: i64,
        cc: Arc<dyn CoordinationClient>,
        da: Arc<dyn DatabaseAdapter>,
    ) -> Self {
        Self {
            snapshot: Arc::new(Mutex::new(SupervisorSnapshot {
                name: name.clone(),
                ..Default::default()
            })),
            holds_lease: Arc::new(Mutex::new(false)),
            name,
            conn_url,
            loop_wait,
            member_ttl,
            maximum_lag_on_failover,
            cc,
            da,
        }
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        self.snapshot.lock().clone()
    }

    /// Runs until the process is asked to shut down, matching `Governor.run`'s
    /// "initialize once, then tick forever" shape.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if let Err(e) = self.bootstrap().await {
            error!("'{}' failed to bootstrap: {}", self.name, e);
            return;
        }

        let mut ticker = time::interval(self.loop_wait);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        if matches!(e, HaError::Fatal(_)) {
                            error!("'{}' hit a fatal error, stopping: {}", self.name, e);
                            break;
                        }
                        warn!("'{}' tick recovered from: {}", self.name, e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("'{}' received shutdown signal", self.name);
                        break;
                    }
                }
            }
        }

        self.teardown().await;
    }

    /// Bootstraps the local database. Matches `Governor.initialize`'s
    /// bootstrap race: if the data directory is empty, race other nodes for
    /// the `/initialize` key; the winner creates the cluster from scratch
    /// and starts as leader, every loser waits for a leader to appear in
    /// the cluster view and clones from it. If the data directory already
    /// has a cluster on disk, it is simply started (or left running).
    ///
    /// Public so tests can drive bootstrap and individual ticks directly
    /// rather than racing the interval timer in `run`.
    pub async fn bootstrap(&self) -> Result<(), HaError> {
        loop {
            if self
                .cc
                .touch_member(&self.name, &self.conn_url, self.member_ttl)
                .await
            {
                break;
            }
            warn!("'{}' failed to touch its member entry, retrying", self.name);
            time::sleep(BOOTSTRAP_BACKOFF).await;
        }

        if self.da.data_directory_empty().await {
            if self.cc.race("initialize", &self.name).await {
                info!("'{}' won the initialization race, creating cluster", self.name);
                self.da.initialize().await?;
                self.cc.take_leader(&self.name).await;
                *self.holds_lease.lock() = true;
                self.da.start().await?;
            } else {
                info!(
                    "'{}' lost the initialization race, cloning from the current leader",
                    self.name
                );
                self.clone_from_cluster_leader().await?;
                self.da.start().await?;
            }
        } else if !self.da.is_running().await {
            self.da.start().await?;
        }

        Ok(())
    }

    /// Polls the cluster view until a leader appears, then provisions this
    /// node's data directory from it. Retried across ticks until
    /// `sync_from_leader` succeeds, per §4.4's bootstrap loss path.
    async fn clone_from_cluster_leader(&self) -> Result<(), HaError> {
        loop {
            match self.cc.get_cluster().await {
                Ok(view) => {
                    if let Some(leader) = &view.leader {
                        match self.da.sync_from_leader(&leader.conn_url).await {
                            Ok(()) => {
                                self.da.write_recovery_conf(&leader.conn_url).await?;
                                return Ok(());
                            }
                            Err(e) => {
                                warn!(
                                    "'{}' failed to provision from leader '{}', retrying: {}",
                                    self.name, leader.name, e
                                );
                            }
                        }
                    }
                }
                Err(e) => warn!("'{}' could not read cluster view during bootstrap: {}", self.name, e),
            }
            time::sleep(self.loop_wait).await;
        }
    }

    /// One full tick: gather state, decide, dispatch, publish membership.
    pub async fn run_cycle(&self) -> Result<(), HaError> {
        let view = self.cc.get_cluster().await?;
        self.cc
            .touch_member(&self.name, &self.conn_url, self.member_ttl)
            .await;

        let is_healthy = self.da.is_healthy().await;
        let is_leader = is_healthy && self.da.is_leader().await;
        let xlog_position = if is_healthy {
            self.da.xlog_position().await.unwrap_or(0)
        } else {
            0
        };

        let local = LocalState {
            name: self.name.clone(),
            conn_url: self.conn_url.clone(),
            is_healthy,
            is_leader,
            holds_lease: *self.holds_lease.lock(),
            xlog_position,
            maximum_lag_on_failover: self.maximum_lag_on_failover,
        };

        let (action, reason) = decision::decide(&local, &view);
        {
            let mut snap = self.snapshot.lock();
            snap.last_action = reason.clone();
            snap.cluster = Some(view.clone());
        }
        info!("'{}': {}", self.name, reason);

        self.dispatch(action, &local, &view).await
    }

    /// Interprets a single `Action` against CC and DA. Kept separate from
    /// `decide()` so the decision table itself stays free of I/O.
    async fn dispatch(
        &self,
        action: Action,
        local: &LocalState,
        view: &ClusterView,
    ) -> Result<(), HaError> {
        match action {
            Action::ReportUnhealthy => {
                self.set_role(None);
                Ok(())
            }
            Action::DemoteSelfUnhealthy => {
                self.cc.delete_leader(&self.name).await;
                *self.holds_lease.lock() = false;
                self.set_role(None);
                Ok(())
            }
            Action::RenewLease { reconcile_slots } => {
                let renewed = self
                    .cc
                    .update_leader(&self.name, local.xlog_position)
                    .await;
                *self.holds_lease.lock() = renewed;
                self.set_role(Some(Role::Leader));
                if renewed && reconcile_slots {
                    let wanted: HashSet<String> = view
                        .members
                        .iter()
                        .filter(|m| m.name != self.name)
                        .map(|m| m.name.clone())
                        .collect();
                    self.da.create_replication_slots(&wanted).await?;
                }
                if !renewed {
                    warn!("'{}' failed to renew lease, will retry next tick", self.name);
                }
                Ok(())
            }
            Action::ReleaseLease => {
                self.cc.delete_leader(&self.name).await;
                *self.holds_lease.lock() = false;
                Ok(())
            }
            Action::AttemptAcquire => {
                if !self
                    .da
                    .is_healthiest_node(view, &self.name, local.maximum_lag_on_failover)
                    .await
                {
                    return Ok(());
                }
                let won = self.cc.attempt_to_acquire_leader(&self.name).await;
                *self.holds_lease.lock() = won;
                if won {
                    info!("'{}' acquired the leader lease, promoting", self.name);
                    self.da.promote().await?;
                    self.set_role(Some(Role::Leader));
                }
                Ok(())
            }
            Action::Promote => {
                self.da.promote().await?;
                self.set_role(Some(Role::Leader));
                Ok(())
            }
            Action::Follow(leader) => self.follow(&leader).await,
            Action::DemoteAndFollow(leader) => {
                *self.holds_lease.lock() = false;
                self.da.demote(&leader.conn_url).await?;
                self.set_role(Some(Role::Replica));
                Ok(())
            }
            // §4.3's "view.leader is none, not healthiest" row says "follow
            // the previous leader if known; else idle". A non-candidate
            // node that loses the lag guard inside `AttemptAcquire` above
            // lands here as a no-op rather than re-pointing recovery
            // configuration: it already has standby configuration on disk
            // from the leader it was following before the lease opened up,
            // so there is nothing to re-point to until a new leader appears
            // in the cluster view.
            Action::Idle => Ok(()),
        }
    }

    /// Testable property in §8: if standby configuration already points at
    /// `leader` and nothing changed, no restart occurs.
    async fn follow(&self, leader: &Member) -> Result<(), HaError> {
        if !self.da.check_recovery_conf(&leader.conn_url).await {
            self.da.write_recovery_conf(&leader.conn_url).await?;
            self.da.restart().await?;
        }
        self.set_role(Some(Role::Replica));
        Ok(())
    }

    fn set_role(&self, role: Option<Role>) {
        let mut snap = self.snapshot.lock();
        snap.role = role.map(|r| match r {
            Role::Leader => "leader",
            Role::Replica => "replica",
            Role::Uninitialized => "uninitialized",
        });
        snap.holds_lease = *self.holds_lease.lock();
    }

    /// Best-effort cleanup on graceful shutdown, matching the `finally`
    /// block in `Governor.main`: advertise departure with a short-lived
    /// member TTL, stop the database, then release the lease if held.
    pub async fn teardown(&self) {
        self.cc
            .touch_member(&self.name, &self.conn_url, TEARDOWN_GRACE_TTL)
            .await;
        let _ = self.da.stop().await;
        if *self.holds_lease.lock() {
            self.cc.delete_leader(&self.name).await;
        }
    }
}
