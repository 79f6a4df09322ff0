// tests/ha/decision_test.rs

//! Unit tests against the pure decision table. No coordination store, no
//! database: every case constructs a `LocalState` and `ClusterView` by hand.

use spineldb::core::ha::coordination::{ClusterView, Member};
use spineldb::core::ha::decision::{Action, LocalState, decide, is_failover_candidate, prefer_archive};

fn local(name: &str, healthy: bool, is_leader: bool, holds_lease: bool) -> LocalState {
    LocalState {
        name: name.to_string(),
        conn_url: format!("postgresql://{name}/postgres"),
        is_healthy: healthy,
        is_leader,
        holds_lease,
        xlog_position: 0,
        maximum_lag_on_failover: 0,
    }
}

fn member(name: &str) -> Member {
    Member {
        name: name.to_string(),
        conn_url: format!("postgresql://{name}/postgres"),
    }
}

#[test]
fn unhealthy_database_reports_unhealthy_regardless_of_lease_state() {
    let l = local("node-a", false, true, true);
    let view = ClusterView {
        leader: Some(member("node-a")),
        ..Default::default()
    };
    let (action, _) = decide(&l, &view);
    assert_eq!(action, Action::ReportUnhealthy);
}

#[test]
fn unhealthy_while_holding_lease_demotes_self() {
    let l = local("node-a", false, false, true);
    let view = ClusterView {
        leader: Some(member("node-a")),
        ..Default::default()
    };
    let (action, _) = decide(&l, &view);
    assert_eq!(action, Action::DemoteSelfUnhealthy);
}

#[test]
fn unhealthy_without_lease_just_reports() {
    let l = local("node-a", false, false, false);
    let view = ClusterView::default();
    let (action, _) = decide(&l, &view);
    assert_eq!(action, Action::ReportUnhealthy);
}

#[test]
fn holding_lease_and_leader_renews_with_slot_reconciliation() {
    let l = local("node-a", true, true, true);
    let view = ClusterView {
        leader: Some(member("node-a")),
        ..Default::default()
    };
    let (action, _) = decide(&l, &view);
    assert_eq!(
        action,
        Action::RenewLease {
            reconcile_slots: true
        }
    );
}

#[test]
fn store_names_us_leader_but_local_database_is_not_yet_promotes() {
    let l = local("node-a", true, false, true);
    let view = ClusterView {
        leader: Some(member("node-a")),
        ..Default::default()
    };
    let (action, _) = decide(&l, &view);
    assert_eq!(action, Action::Promote);
}

#[test]
fn another_node_holds_lease_and_we_are_not_leader_follows() {
    let l = local("node-b", true, false, false);
    let view = ClusterView {
        leader: Some(member("node-a")),
        ..Default::default()
    };
    let (action, _) = decide(&l, &view);
    assert_eq!(action, Action::Follow(member("node-a")));
}

#[test]
fn split_brain_demotes_local_leader_to_follow_the_real_holder() {
    let l = local("node-b", true, true, false);
    let view = ClusterView {
        leader: Some(member("node-a")),
        ..Default::default()
    };
    let (action, _) = decide(&l, &view);
    assert_eq!(action, Action::DemoteAndFollow(member("node-a")));
}

#[test]
fn no_leader_in_store_attempts_to_acquire() {
    let l = local("node-a", true, false, false);
    let view = ClusterView::default();
    let (action, _) = decide(&l, &view);
    assert_eq!(action, Action::AttemptAcquire);
}

#[test]
fn expired_lease_while_we_were_leader_reacquires() {
    let l = local("node-a", true, true, true);
    let view = ClusterView::default();
    let (action, _) = decide(&l, &view);
    assert_eq!(action, Action::AttemptAcquire);
}

#[test]
fn lag_guard_excludes_nodes_too_far_behind() {
    let mut l = local("node-b", true, false, false);
    l.xlog_position = 0;
    l.maximum_lag_on_failover = 1_000_000;
    assert!(!is_failover_candidate(&l, 5_000_000));
}

#[test]
fn lag_guard_admits_nodes_within_tolerance() {
    let mut l = local("node-b", true, false, false);
    l.xlog_position = 4_500_000;
    l.maximum_lag_on_failover = 1_000_000;
    assert!(is_failover_candidate(&l, 5_000_000));
}

#[test]
fn zero_maximum_lag_means_zero_tolerated_lag_not_disabled() {
    let mut l = local("node-b", true, false, false);
    l.maximum_lag_on_failover = 0;

    l.xlog_position = 5_000_000;
    assert!(is_failover_candidate(&l, 5_000_000));

    l.xlog_position = 4_999_999;
    assert!(!is_failover_candidate(&l, 5_000_000));
}

#[test]
fn unhealthy_node_is_never_a_failover_candidate() {
    let mut l = local("node-b", false, false, false);
    l.maximum_lag_on_failover = 0;
    assert!(!is_failover_candidate(&l, 5_000_000));
}

// Scenario 5: threshold_megabytes=100, threshold_backup_size_percentage=30,
// backup size 1 GiB.
#[test]
fn small_delta_prefers_archive_restore() {
    let backup_size = 1024 * 1024 * 1024;
    let delta = 50 * 1024 * 1024;
    assert!(prefer_archive(delta, backup_size, 100, 30));
}

#[test]
fn large_delta_falls_back_to_basecopy() {
    let backup_size = 1024 * 1024 * 1024;
    let delta = 400 * 1024 * 1024;
    assert!(!prefer_archive(delta, backup_size, 100, 30));
}

#[test]
fn delta_exceeding_backup_size_percentage_falls_back_to_basecopy() {
    // Under the absolute megabyte ceiling but over 30% of a small backup.
    let backup_size = 100 * 1024 * 1024;
    let delta = 40 * 1024 * 1024;
    assert!(!prefer_archive(delta, backup_size, 100, 30));
}
