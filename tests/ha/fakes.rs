// tests/ha/fakes.rs

//! In-memory fakes for `CoordinationClient` and `DatabaseAdapter`, used by
//! every test in this module so the decision engine and supervisor loop
//! can be exercised without a network or a real PostgreSQL instance.

use async_trait::async_trait;
use spineldb::core::ha::coordination::{ClusterView, CoordinationClient, Member};
use spineldb::core::ha::database::DatabaseAdapter;
use spineldb::core::ha::error::HaError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct LeaseEntry {
    holder: String,
    set_at: Instant,
    ttl: Duration,
}

struct MemberEntry {
    conn_url: String,
    set_at: Instant,
    ttl: Duration,
}

#[derive(Default)]
struct FakeStore {
    leader: Option<LeaseEntry>,
    members: HashMap<String, MemberEntry>,
    subkeys: HashSet<String>,
    last_leader_operation: i64,
    initialize: Option<String>,
    /// When true, every call fails as if the store were unreachable.
    unreachable: bool,
}

impl FakeStore {
    fn leader_member(&self) -> Option<Member> {
        let lease = self.leader.as_ref()?;
        if lease.set_at.elapsed() > lease.ttl {
            return None;
        }
        self.members.get(&lease.holder).map(|m| Member {
            name: lease.holder.clone(),
            conn_url: m.conn_url.clone(),
        })
    }
}

/// `CoordinationClient` backed by a `HashMap`, with lease/member TTLs
/// honored against `tokio::time`'s (mockable) clock.
#[derive(Clone)]
pub struct FakeCoordinationClient {
    store: Arc<Mutex<FakeStore>>,
}

impl FakeCoordinationClient {
    pub fn new() -> Self {
        Self {
            store: Arc::new(Mutex::new(FakeStore::default())),
        }
    }

    pub async fn set_unreachable(&self, unreachable: bool) {
        self.store.lock().await.unreachable = unreachable;
    }

    pub async fn current_leader(&self) -> Option<String> {
        self.store.lock().await.leader_member().map(|m| m.name)
    }

    pub async fn force_expire_leader(&self) {
        let mut store = self.store.lock().await;
        if let Some(lease) = &mut store.leader {
            lease.set_at = Instant::now() - lease.ttl - Duration::from_secs(1);
        }
    }
}

impl Default for FakeCoordinationClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationClient for FakeCoordinationClient {
    async fn get_cluster(&self) -> Result<ClusterView, HaError> {
        let store = self.store.lock().await;
        if store.unreachable {
            return Err(HaError::StoreUnavailable("fake store offline".into()));
        }
        let members: Vec<Member> = store
            .members
            .iter()
            .filter(|(_, m)| m.set_at.elapsed() <= m.ttl)
            .map(|(name, m)| Member {
                name: name.clone(),
                conn_url: m.conn_url.clone(),
            })
            .collect();
        Ok(ClusterView {
            leader: store.leader_member(),
            members,
            last_leader_operation: store.last_leader_operation,
            initialize: store.initialize.clone(),
        })
    }

    async fn touch_member(&self, name: &str, conn_url: &str, ttl: Duration) -> bool {
        let mut store = self.store.lock().await;
        if store.unreachable {
            return false;
        }
        store.members.insert(
            name.to_string(),
            MemberEntry {
                conn_url: conn_url.to_string(),
                set_at: Instant::now(),
                ttl,
            },
        );
        true
    }

    async fn take_leader(&self, name: &str) -> bool {
        let mut store = self.store.lock().await;
        if store.unreachable {
            return false;
        }
        store.leader = Some(LeaseEntry {
            holder: name.to_string(),
            set_at: Instant::now(),
            ttl: Duration::from_secs(30),
        });
        true
    }

    async fn attempt_to_acquire_leader(&self, name: &str) -> bool {
        let mut store = self.store.lock().await;
        if store.unreachable {
            return false;
        }
        let vacant = match &store.leader {
            None => true,
            Some(lease) => lease.set_at.elapsed() > lease.ttl,
        };
        if !vacant {
            return false;
        }
        store.leader = Some(LeaseEntry {
            holder: name.to_string(),
            set_at: Instant::now(),
            ttl: Duration::from_secs(30),
        });
        true
    }

    async fn update_leader(&self, name: &str, last_operation: i64) -> bool {
        let mut store = self.store.lock().await;
        if store.unreachable {
            return false;
        }
        let matches = matches!(&store.leader, Some(lease) if lease.holder == name);
        if !matches {
            return false;
        }
        if let Some(lease) = &mut store.leader {
            lease.set_at = Instant::now();
        }
        store.last_leader_operation = last_operation;
        true
    }

    async fn race(&self, subkey: &str, value: &str) -> bool {
        let mut store = self.store.lock().await;
        if store.unreachable {
            return false;
        }
        if subkey == "initialize" {
            if store.initialize.is_some() {
                return false;
            }
            store.initialize = Some(value.to_string());
            return true;
        }
        store.subkeys.insert(subkey.to_string())
    }

    async fn delete_leader(&self, name: &str) -> bool {
        let mut store = self.store.lock().await;
        if store.unreachable {
            return false;
        }
        let matches = matches!(&store.leader, Some(lease) if lease.holder == name);
        if matches {
            store.leader = None;
        }
        matches
    }

    async fn delete_member(&self, name: &str) -> bool {
        let mut store = self.store.lock().await;
        if store.unreachable {
            return false;
        }
        store.members.remove(name).is_some()
    }
}

/// `DatabaseAdapter` backed by in-memory flags instead of a real
/// PostgreSQL instance.
pub struct FakeDatabaseAdapter {
    inner: Mutex<FakeDbState>,
}

struct FakeDbState {
    empty: bool,
    healthy: bool,
    leader: bool,
    xlog_position: i64,
    slots: HashSet<String>,
    following: Option<String>,
}

impl FakeDatabaseAdapter {
    pub fn new(empty: bool, healthy: bool, leader: bool, xlog_position: i64) -> Self {
        Self {
            inner: Mutex::new(FakeDbState {
                empty,
                healthy,
                leader,
                xlog_position,
                slots: HashSet::new(),
                following: None,
            }),
        }
    }

    pub async fn set_healthy(&self, healthy: bool) {
        self.inner.lock().await.healthy = healthy;
    }

    pub async fn set_leader(&self, leader: bool) {
        self.inner.lock().await.leader = leader;
    }

    pub async fn is_following(&self) -> Option<String> {
        self.inner.lock().await.following.clone()
    }

    pub async fn slots(&self) -> HashSet<String> {
        self.inner.lock().await.slots.clone()
    }
}

#[async_trait]
impl DatabaseAdapter for FakeDatabaseAdapter {
    async fn data_directory_empty(&self) -> bool {
        self.inner.lock().await.empty
    }

    async fn initialize(&self) -> Result<(), HaError> {
        let mut state = self.inner.lock().await;
        state.empty = false;
        state.leader = true;
        Ok(())
    }

    async fn start(&self) -> Result<(), HaError> {
        self.inner.lock().await.healthy = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), HaError> {
        self.inner.lock().await.healthy = false;
        Ok(())
    }

    async fn restart(&self) -> Result<(), HaError> {
        self.stop().await?;
        self.start().await
    }

    async fn reload(&self) -> Result<(), HaError> {
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.inner.lock().await.healthy
    }

    async fn is_healthy(&self) -> bool {
        self.inner.lock().await.healthy
    }

    async fn is_leader(&self) -> bool {
        self.inner.lock().await.leader
    }

    async fn promote(&self) -> Result<(), HaError> {
        let mut state = self.inner.lock().await;
        state.leader = true;
        state.following = None;
        Ok(())
    }

    async fn write_recovery_conf(&self, leader_conn_url: &str) -> Result<(), HaError> {
        self.inner.lock().await.following = Some(leader_conn_url.to_string());
        Ok(())
    }

    async fn check_recovery_conf(&self, leader_conn_url: &str) -> bool {
        self.inner.lock().await.following.as_deref() == Some(leader_conn_url)
    }

    async fn demote(&self, leader_conn_url: &str) -> Result<(), HaError> {
        let mut state = self.inner.lock().await;
        state.leader = false;
        state.following = Some(leader_conn_url.to_string());
        Ok(())
    }

    async fn sync_from_leader(&self, _leader_conn_url: &str) -> Result<(), HaError> {
        self.inner.lock().await.empty = false;
        Ok(())
    }

    async fn xlog_position(&self) -> Result<i64, HaError> {
        Ok(self.inner.lock().await.xlog_position)
    }

    async fn create_replication_slots(&self, wanted: &HashSet<String>) -> Result<(), HaError> {
        self.inner.lock().await.slots = wanted.clone();
        Ok(())
    }

    async fn is_healthiest_node(&self, view: &ClusterView, self_name: &str, maximum_lag: i64) -> bool {
        if view.leader.as_ref().is_some_and(|l| l.name == self_name) {
            return true;
        }
        let state = self.inner.lock().await;
        if !state.healthy {
            return false;
        }
        view.last_leader_operation - state.xlog_position <= maximum_lag
    }
}
