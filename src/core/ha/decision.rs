// src/core/ha/decision.rs

//! HA Decision Engine: a pure function from local state + cluster view to
//! a single `Action`, with no I/O of its own. The Supervisor Loop drives
//! `decide()` every tick and interprets the result against CC and DA.
//! Keeping the decision table pure is what lets the property tests in
//! `tests/ha/` exercise it directly, without a database or a network.

use super::coordination::{ClusterView, Member};

/// What the current tick believes about this node, gathered before
/// `decide()` runs (own name, whether the local DB is healthy/leader,
/// and whether the last tick held the lease).
#[derive(Debug, Clone)]
pub struct LocalState {
    pub name: String,
    pub conn_url: String,
    pub is_healthy: bool,
    pub is_leader: bool,
    pub holds_lease: bool,
    pub xlog_position: i64,
    pub maximum_lag_on_failover: i64,
}

/// The single action the Supervisor Loop must take this tick. Each variant
/// corresponds to exactly one row of the decision table.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// We hold the lease and our DB is leader: renew it.
    RenewLease { reconcile_slots: bool },
    /// We hold the lease but our DB is no longer leader. `decide()` itself
    /// never constructs this variant: every row keyed on `view.leader ==
    /// self` routes to `RenewLease` or `Promote` instead. It stays part of
    /// the sum type as the action an out-of-band release (e.g. an admin
    /// tool stepping a node down) would dispatch through.
    ReleaseLease,
    /// No one holds the lease and we are a viable candidate: try to take it.
    AttemptAcquire,
    /// We just won the lease and our DB is not yet leader: promote.
    Promote,
    /// Someone else holds the lease; follow them.
    Follow(Member),
    /// We are leader locally but someone else holds the lease (split-brain
    /// recovery): step down and follow the current holder.
    DemoteAndFollow(Member),
    /// Nothing actionable this tick. `decide()` itself never constructs this
    /// variant today; a non-candidate losing the lag guard resolves inside
    /// `AttemptAcquire`'s dispatch as a no-op, but it stays part of the sum
    /// type as the result a reconciliation pass that's already converged
    /// would report.
    Idle,
    /// The local DB is unhealthy; surface it without touching the lease.
    ReportUnhealthy,
    /// The local DB is unhealthy and we were holding the lease: give it up
    /// so a healthy peer can take over without waiting out the full TTL.
    DemoteSelfUnhealthy,
}

/// Implements the decision table: local database health dominates
/// everything else, then lease ownership, then DB role versus lease
/// ownership, then catch-up-and-follow.
pub fn decide(local: &LocalState, view: &ClusterView) -> (Action, String) {
    if !local.is_healthy {
        if local.holds_lease {
            return (
                Action::DemoteSelfUnhealthy,
                "demoted self; database not healthy".to_string(),
            );
        }
        return (
            Action::ReportUnhealthy,
            "database not running".to_string(),
        );
    }

    match &view.leader {
        Some(leader) if leader.name == local.name => {
            if local.is_leader {
                (
                    Action::RenewLease {
                        reconcile_slots: true,
                    },
                    "holding the lease and acting as leader: renewing".to_string(),
                )
            } else {
                (
                    Action::Promote,
                    "store names us as leader but local database is not yet leader: promoting"
                        .to_string(),
                )
            }
        }
        Some(leader) => {
            if local.is_leader {
                (
                    Action::DemoteAndFollow(leader.clone()),
                    format!(
                        "local database is leader but '{}' holds the lease: demoting and following",
                        leader.name
                    ),
                )
            } else {
                (
                    Action::Follow(leader.clone()),
                    format!("following current leader '{}'", leader.name),
                )
            }
        }
        None if local.is_leader && local.holds_lease => (
            Action::AttemptAcquire,
            "lease expired while we were leader: reacquiring".to_string(),
        ),
        None => (
            Action::AttemptAcquire,
            "no leader in the coordination store; attempting to acquire".to_string(),
        ),
    }
}

/// Whether this node should even contend for an open lease, applying the
/// lag-guard from §4.2.2 against the best-known position in the cluster.
/// `maximum_lag_on_failover = 0` means zero tolerated lag, not "disabled",
/// matching the original `is_healthiest_node`'s default threshold.
pub fn is_failover_candidate(local: &LocalState, cluster_max_lsn: i64) -> bool {
    if !local.is_healthy {
        return false;
    }
    cluster_max_lsn - local.xlog_position <= local.maximum_lag_on_failover
}

/// Implements §4.2.1: archive restore only wins when the WAL delta a replica
/// would need to replay after the restore is a small fraction of both an
/// absolute ceiling and the backup's own size. Above either threshold the
/// streaming base copy is preferable, since the archive path no longer saves
/// meaningful catch-up time.
pub fn prefer_archive(
    diff_bytes: u64,
    backup_size_bytes: u64,
    threshold_megabytes: u64,
    threshold_backup_size_percentage: u64,
) -> bool {
    let absolute_limit = threshold_megabytes.saturating_mul(1_048_576);
    let relative_limit = backup_size_bytes.saturating_mul(threshold_backup_size_percentage) / 100;
    diff_bytes < absolute_limit && diff_bytes < relative_limit
}
