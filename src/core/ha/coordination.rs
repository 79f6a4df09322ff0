// src/core/ha/coordination.rs

//! Coordination Client (CC): a typed wrapper over the external,
//! strongly-consistent key-value store used to assemble the cluster view
//! and perform the leader-lease compare-and-set primitives.
//!
//! The wire protocol mirrors the flat HTTP JSON key-value API used by the
//! original implementation this crate descends from (a recursive directory
//! read returning a tree of `{key, value, dir, nodes}` entries, and
//! conditional writes expressed as query parameters: `prevExist`,
//! `prevValue`, `ttl`). `reqwest` is used as the transport, the same crate
//! already depended on for outbound HTTP elsewhere in this codebase.

use super::config::EtcdConfig;
use super::error::HaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Identity of one database node as advertised in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub conn_url: String,
}

/// A read-only snapshot of the cluster, assembled from a single recursive
/// read of the cluster-scope namespace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterView {
    /// Resolved against `members` per invariant I3; `None` if the lease is
    /// missing/expired or its holder is not a known member.
    pub leader: Option<Member>,
    pub members: Vec<Member>,
    pub last_leader_operation: i64,
    pub initialize: Option<String>,
}

impl ClusterView {
    pub fn member(&self, name: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.name == name)
    }
}

/// The three-compare-and-set-primitives-plus-a-read contract the HA Decision
/// Engine and Supervisor Loop need from the coordination store.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Single recursive read of the cluster namespace.
    async fn get_cluster(&self) -> Result<ClusterView, HaError>;
    /// Idempotent upsert of this member's entry. `false` on any store error.
    async fn touch_member(&self, name: &str, conn_url: &str, ttl: Duration) -> bool;
    /// Unconditional set of the leader key. Bootstrap-only; see contract note.
    async fn take_leader(&self, name: &str) -> bool;
    /// Compare-and-set on absence of the leader key.
    async fn attempt_to_acquire_leader(&self, name: &str) -> bool;
    /// Compare-and-set of the leader key guarded by previous value = `name`.
    async fn update_leader(&self, name: &str, last_operation: i64) -> bool;
    /// Compare-and-set on absence of an arbitrary subkey.
    async fn race(&self, subkey: &str, value: &str) -> bool;
    /// Conditional delete of the leader key, guarded by value = `name`.
    async fn delete_leader(&self, name: &str) -> bool;
    /// Unconditional delete of this member's own entry.
    async fn delete_member(&self, name: &str) -> bool;
}

/// The JSON shape of one node in the store's recursive directory listing.
#[derive(Debug, Deserialize)]
struct RawNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<RawNode>,
}

#[derive(Debug, Deserialize)]
struct RawGetResponse {
    node: RawNode,
}

/// `CoordinationClient` implementation backed by a real HTTP key-value
/// store reachable at `etcd.host`.
pub struct EtcdClient {
    http: reqwest::Client,
    base_url: String,
    scope: String,
    leader_ttl: Duration,
}

impl EtcdClient {
    pub fn new(config: &EtcdConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("http://{}/v2/keys", config.host),
            scope: config.scope.clone(),
            leader_ttl: config.ttl,
        })
    }

    fn key_url(&self, subpath: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.scope, subpath)
    }

    /// Flattens the recursive node tree into a `ClusterView`.
    fn parse_cluster(root: RawNode) -> ClusterView {
        let mut view = ClusterView::default();
        let mut leader_name = None;

        for child in root.nodes {
            let leaf = child.key.rsplit('/').next().unwrap_or_default().to_string();
            match leaf.as_str() {
                "initialize" => view.initialize = child.value.clone(),
                "leader" => leader_name = child.value.clone(),
                "optime" => {
                    for optime_child in &child.nodes {
                        if optime_child.key.ends_with("/leader") {
                            view.last_leader_operation = optime_child
                                .value
                                .as_deref()
                                .and_then(|v| v.parse().ok())
                                .unwrap_or(0);
                        }
                    }
                }
                "members" => {
                    for member_child in child.nodes {
                        if let Some(conn_url) = member_child.value {
                            let name = member_child
                                .key
                                .rsplit('/')
                                .next()
                                .unwrap_or_default()
                                .to_string();
                            view.members.push(Member { name, conn_url });
                        }
                    }
                }
                _ => {}
            }
        }

        // I3: a stale/expired lease, or one whose holder has dropped out of
        // the member set, is reported as no leader at all.
        view.leader = leader_name.and_then(|name| view.member(&name).cloned());
        view
    }
}

#[async_trait]
impl CoordinationClient for EtcdClient {
    async fn get_cluster(&self) -> Result<ClusterView, HaError> {
        let url = format!("{}?recursive=true", self.key_url(""));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| HaError::StoreUnavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(HaError::StoreUnavailable(format!(
                "unexpected status {}",
                resp.status()
            )));
        }

        let body: RawGetResponse = resp
            .json()
            .await
            .map_err(|e| HaError::StoreUnavailable(format!("malformed cluster response: {e}")))?;

        Ok(Self::parse_cluster(body.node))
    }

    async fn touch_member(&self, name: &str, conn_url: &str, ttl: Duration) -> bool {
        let url = self.key_url(&format!("members/{name}"));
        match self
            .http
            .put(&url)
            .query(&[
                ("value", conn_url.to_string()),
                ("ttl", ttl.as_secs().to_string()),
            ])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("touch_member({}) failed: {}", name, e);
                false
            }
        }
    }

    async fn take_leader(&self, name: &str) -> bool {
        let url = self.key_url("leader");
        match self
            .http
            .put(&url)
            .query(&[
                ("value", name.to_string()),
                ("ttl", self.leader_ttl.as_secs().to_string()),
            ])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("take_leader({}) failed: {}", name, e);
                false
            }
        }
    }

    async fn attempt_to_acquire_leader(&self, name: &str) -> bool {
        let url = self.key_url("leader");
        match self
            .http
            .put(&url)
            .query(&[
                ("value", name.to_string()),
                ("ttl", self.leader_ttl.as_secs().to_string()),
                ("prevExist", "false".to_string()),
            ])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("attempt_to_acquire_leader({}) did not win: {}", name, e);
                false
            }
        }
    }

    async fn update_leader(&self, name: &str, last_operation: i64) -> bool {
        let url = self.key_url("leader");
        let renewed = match self
            .http
            .put(&url)
            .query(&[
                ("value", name.to_string()),
                ("ttl", self.leader_ttl.as_secs().to_string()),
                ("prevValue", name.to_string()),
            ])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("update_leader({}) failed: {}", name, e);
                false
            }
        };

        if renewed {
            let optime_url = self.key_url("optime/leader");
            if let Err(e) = self
                .http
                .put(&optime_url)
                .query(&[("value", last_operation.to_string())])
                .send()
                .await
            {
                // Best-effort per contract: failures here never fail the renewal.
                debug!("failed to write optime for '{}': {}", name, e);
            }
        }

        renewed
    }

    async fn race(&self, subkey: &str, value: &str) -> bool {
        let url = self.key_url(subkey);
        match self
            .http
            .put(&url)
            .query(&[
                ("value", value.to_string()),
                ("prevExist", "false".to_string()),
            ])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("race({}) lost: {}", subkey, e);
                false
            }
        }
    }

    async fn delete_leader(&self, name: &str) -> bool {
        let url = self.key_url("leader");
        match self
            .http
            .delete(&url)
            .query(&[("prevValue", name.to_string())])
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("delete_leader({}) failed: {}", name, e);
                false
            }
        }
    }

    async fn delete_member(&self, name: &str) -> bool {
        let url = self.key_url(&format!("members/{name}"));
        match self.http.delete(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!("delete_member({}) failed: {}", name, e);
                false
            }
        }
    }
}
