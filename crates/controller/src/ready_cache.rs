// Component B (§4.B): the in-memory sorted view of Ready game servers the
// allocation engine matches against. Exposes only atomic operations so no
// external locking is needed, following the teacher's `SafeGlobals`
// pattern of hiding a `RwLock` behind a small owning API rather than handing
// out the guard.
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use common::errors::SubstrateError;

use crate::domain::{AllocationRequest, GameServer, GameServerState, ObjectKey};
use crate::substrate::Substrate;

struct Entry {
    gs: GameServer,
    /// Count of `Allocated` game servers observed on the same node at the
    /// time this entry was inserted or last repacked; used for the packing
    /// sort so hot nodes fill up before cold ones.
    node_allocated_count: u32,
}

#[derive(Default)]
struct State {
    entries: HashMap<ObjectKey, Entry>,
    allocated_per_node: HashMap<String, u32>,
}

pub struct ReadyCache {
    state: RwLock<State>,
}

impl ReadyCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    pub fn record_allocated_on_node(&self, node_name: &str) {
        let mut state = self.state.write().unwrap();
        *state.allocated_per_node.entry(node_name.to_string()).or_insert(0) += 1;
    }

    pub fn forget_allocated_on_node(&self, node_name: &str) {
        let mut state = self.state.write().unwrap();
        if let Some(count) = state.allocated_per_node.get_mut(node_name) {
            *count = count.saturating_sub(1);
        }
    }

    /// Adds or replaces the Ready entry for `gs`. Idempotent: re-adding the
    /// same key overwrites in place.
    pub fn add(&self, gs: GameServer) {
        debug_assert!(matches!(gs.status.state, Some(GameServerState::Ready)));
        let mut state = self.state.write().unwrap();
        let node_count = gs
            .status
            .node_name
            .as_ref()
            .and_then(|n| state.allocated_per_node.get(n).copied())
            .unwrap_or(0);
        state.entries.insert(
            gs.key.clone(),
            Entry {
                gs,
                node_allocated_count: node_count,
            },
        );
    }

    /// Restores a server after a failed reservation (§4.B
    /// `AddToReadyGameServer`).
    pub fn restore(&self, gs: GameServer) {
        self.add(gs);
    }

    /// Removes `gs` from the cache, failing with `Conflict` if it is no
    /// longer present (another remover already won it).
    pub fn remove(&self, key: &ObjectKey) -> Result<GameServer, SubstrateError> {
        let mut state = self.state.write().unwrap();
        state
            .entries
            .remove(key)
            .map(|e| e.gs)
            .ok_or_else(|| SubstrateError::Conflict(format!("{key} already removed from ready cache")))
    }

    /// A stable snapshot ordered by the packing heuristic: descending by
    /// count of `Allocated` servers on the same node.
    pub fn list_sorted(&self) -> Vec<GameServer> {
        let state = self.state.read().unwrap();
        let mut by_rank: BTreeMap<(std::cmp::Reverse<u32>, String, String), GameServer> =
            BTreeMap::new();
        for entry in state.entries.values() {
            by_rank.insert(
                (
                    std::cmp::Reverse(entry.node_allocated_count),
                    entry.gs.key.namespace.clone(),
                    entry.gs.key.name.clone(),
                ),
                entry.gs.clone(),
            );
        }
        by_rank.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies the request's patch and returns the now-`Allocated` record;
    /// caller is responsible for persisting it through the substrate.
    pub fn patch_and_allocate(&self, mut gs: GameServer, request: &AllocationRequest) -> GameServer {
        for (k, v) in &request.metadata_patch.labels {
            gs.meta.labels.insert(k.clone(), v.clone());
        }
        for (k, v) in &request.metadata_patch.annotations {
            gs.meta.annotations.insert(k.clone(), v.clone());
        }
        gs.status.state = Some(GameServerState::Allocated);
        gs
    }
}

impl Default for ReadyCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Rebuilds the cache from observed state: every live game server in
/// `Ready` is (re)inserted. Used on startup and after a retry budget is
/// exhausted under sustained contention (§4.E: "a full cache resync is
/// triggered before surfacing the failure").
pub async fn rebuild(substrate: &Substrate, cache: &ReadyCache) -> anyhow::Result<()> {
    let game_servers = substrate.lister.list_game_servers().await?;
    let mut allocated_counts: HashMap<String, u32> = HashMap::new();
    for gs in &game_servers {
        if matches!(gs.status.state, Some(GameServerState::Allocated)) {
            if let Some(node) = &gs.status.node_name {
                *allocated_counts.entry(node.clone()).or_insert(0) += 1;
            }
        }
    }
    {
        let mut state = cache.state.write().unwrap();
        state.entries.clear();
        state.allocated_per_node = allocated_counts;
    }
    for gs in game_servers {
        if matches!(gs.status.state, Some(GameServerState::Ready)) {
            cache.add(gs);
        }
    }
    Ok(())
}

/// Top-N random selection policy (§4.B, §4.E): filter by required selector,
/// then draw uniformly from the best-N window by preferred score, seeded by
/// the request's resource version so the pick is deterministic for a given
/// request but independent across concurrent ones.
pub fn find_match(request: &AllocationRequest, candidates: &[GameServer], window: usize) -> Option<usize> {
    let mut scored: Vec<(usize, u32)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, gs)| request.matches_required(&gs.meta.labels))
        .map(|(i, gs)| (i, request.preferred_score(&gs.meta.labels)))
        .collect();
    if scored.is_empty() {
        return None;
    }
    scored.sort_by(|a, b| b.1.cmp(&a.1));
    let top = &scored[..scored.len().min(window)];
    let seed = seed_from_resource_version(&request.id);
    let pick = (seed as usize) % top.len();
    Some(top[pick].0)
}

fn seed_from_resource_version(resource_version: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    resource_version.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GameServerSpec, HealthCheck, LabelSelector, MetadataPatch};

    fn ready_gs(name: &str, node: &str) -> GameServer {
        let mut gs = GameServer::new(
            ObjectKey::new("default", name),
            GameServerSpec {
                container_image: "img".into(),
                ports: vec![],
                health_check: HealthCheck::default(),
                dev_address: None,
                service_account: None,
            },
        );
        gs.status.state = Some(GameServerState::Ready);
        gs.status.node_name = Some(node.to_string());
        gs
    }

    #[test]
    fn remove_conflicts_on_double_removal() {
        let cache = ReadyCache::new();
        let gs = ready_gs("gs-1", "node-a");
        cache.add(gs.clone());
        cache.remove(&gs.key).unwrap();
        let err = cache.remove(&gs.key).unwrap_err();
        assert!(matches!(err, SubstrateError::Conflict(_)));
    }

    #[test]
    fn list_sorted_packs_busier_nodes_first() {
        let cache = ReadyCache::new();
        cache.record_allocated_on_node("hot");
        cache.record_allocated_on_node("hot");
        cache.add(ready_gs("cold-1", "cold"));
        cache.add(ready_gs("hot-1", "hot"));
        let sorted = cache.list_sorted();
        assert_eq!(sorted[0].key.name, "hot-1");
    }

    #[test]
    fn find_match_respects_required_selector() {
        let mut required = LabelSelector::default();
        required.match_labels.insert("map".into(), "dust2".into());
        let request = AllocationRequest {
            id: "req-1".into(),
            required,
            preferred: vec![],
            metadata_patch: MetadataPatch::default(),
            multi_cluster: false,
        };
        let mut a = ready_gs("gs-a", "node-a");
        a.meta.labels.insert("map".into(), "dust2".into());
        let b = ready_gs("gs-b", "node-a");
        let idx = find_match(&request, &[a, b], 100);
        assert_eq!(idx, Some(0));
    }

    #[test]
    fn find_match_returns_none_without_a_required_match() {
        let mut required = LabelSelector::default();
        required.match_labels.insert("map".into(), "dust2".into());
        let request = AllocationRequest {
            id: "req-1".into(),
            required,
            preferred: vec![],
            metadata_patch: MetadataPatch::default(),
            multi_cluster: false,
        };
        let candidates = vec![ready_gs("gs-a", "node-a")];
        assert_eq!(find_match(&request, &candidates, 100), None);
    }
}
