use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::key::ObjectKey;

/// A label selector: every key/value pair must match (AND semantics). An
/// empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }

    /// Number of keys satisfied; used as the preferred-selector score (more
    /// matched keys ranks higher) rather than a boolean.
    pub fn score(&self, labels: &BTreeMap<String, String>) -> u32 {
        self.match_labels
            .iter()
            .filter(|(k, v)| labels.get(*k) == Some(*v))
            .count() as u32
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Request id also used as the retry/backoff correlation id in logs.
    pub id: String,
    pub required: LabelSelector,
    pub preferred: Vec<LabelSelector>,
    pub metadata_patch: MetadataPatch,
    pub multi_cluster: bool,
}

impl AllocationRequest {
    pub fn matches_required(&self, labels: &BTreeMap<String, String>) -> bool {
        self.required.matches(labels)
    }

    pub fn preferred_score(&self, labels: &BTreeMap<String, String>) -> u32 {
        self.preferred.iter().map(|s| s.score(labels)).sum()
    }

    /// Clears the multi-cluster flag, as required before forwarding to a
    /// remote cluster (prevents forwarding loops).
    pub fn as_local_forward(&self) -> Self {
        Self {
            multi_cluster: false,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameServerAllocationStatus {
    pub game_server: ObjectKey,
    pub address: String,
    pub ports: Vec<super::gameserver::PortBinding>,
    pub metadata: MetadataPatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameServerAllocation {
    pub request: AllocationRequest,
    pub status: Option<GameServerAllocationStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConnection {
    pub cluster_name: String,
    pub endpoint: String,
    /// Namespace/name of the secret holding `tls.crt` / `tls.key` (and
    /// optionally `ca.crt`) for the mTLS client used when this connection
    /// does not name the local cluster.
    pub secret: Option<ObjectKey>,
}

impl ClusterConnection {
    pub fn is_local(&self, local_cluster_name: &str) -> bool {
        self.cluster_name == local_cluster_name
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPolicy {
    pub name: String,
    pub selector: LabelSelector,
    pub connections: Vec<ClusterConnection>,
}
