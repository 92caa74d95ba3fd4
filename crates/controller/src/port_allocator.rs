// Component A (§4.A): one host port per dynamic-port game server, reserved
// from a bounded range partitioned across cluster nodes. Modeled on the
// teacher's `ManagedVec`-backed per-node tables (see `common::basic_types`)
// for O(1) indexed access instead of hashing on every allocation.
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use common::basic_types::{ManagedElement, ManagedVec, ManagedVecIdx};
use common::errors::SubstrateError;

use crate::domain::{GameServer, Node, ObjectKey, PortPolicy};

struct NodeSlots {
    idx: Option<ManagedVecIdx>,
    name: String,
    free: BTreeSet<u16>,
    occupied: BTreeSet<u16>,
}

impl ManagedElement for NodeSlots {
    fn idx(&self) -> Option<ManagedVecIdx> {
        self.idx
    }
    fn set_idx(&mut self, index: Option<ManagedVecIdx>) {
        self.idx = index;
    }
}

impl NodeSlots {
    fn new(name: String, min_port: u16, max_port: u16) -> Self {
        Self {
            idx: None,
            name,
            free: (min_port..=max_port).collect(),
            occupied: BTreeSet::new(),
        }
    }

    fn take_lowest_free(&mut self, n: usize) -> Option<Vec<u16>> {
        if self.free.len() < n {
            return None;
        }
        let taken: Vec<u16> = self.free.iter().take(n).copied().collect();
        for port in &taken {
            self.free.remove(port);
            self.occupied.insert(*port);
        }
        Some(taken)
    }

    fn mark_occupied(&mut self, port: u16) {
        if self.free.remove(&port) {
            self.occupied.insert(port);
        } else {
            self.occupied.insert(port);
        }
    }

    fn release(&mut self, port: u16) {
        if self.occupied.remove(&port) {
            self.free.insert(port);
        }
    }
}

struct Table {
    min_port: u16,
    max_port: u16,
    nodes: ManagedVec<NodeSlots>,
    by_name: HashMap<String, ManagedVecIdx>,
    /// Which node each game server's dynamic ports were drawn from, so
    /// `deallocate` can find the right slice without the domain model
    /// needing to carry node identity on every `PortBinding`.
    reservations: HashMap<ObjectKey, String>,
}

impl Table {
    fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            min_port,
            max_port,
            nodes: ManagedVec::new(),
            by_name: HashMap::new(),
            reservations: HashMap::new(),
        }
    }

    fn ensure_node(&mut self, name: &str) -> ManagedVecIdx {
        if let Some(idx) = self.by_name.get(name) {
            return *idx;
        }
        let idx = self
            .nodes
            .push(NodeSlots::new(name.to_string(), self.min_port, self.max_port))
            .expect("fewer than u16::MAX nodes");
        self.by_name.insert(name.to_string(), idx);
        idx
    }

    fn remove_node(&mut self, name: &str) {
        if let Some(idx) = self.by_name.remove(name) {
            self.nodes.remove(idx);
        }
    }

    /// Picks the node with the most free slots (ties broken by node name)
    /// that can satisfy `count` dynamic ports in one shot, since every
    /// dynamic port on a game server ends up on the same pod.
    fn pick_node(&self, count: usize) -> Option<ManagedVecIdx> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.free.len() >= count)
            .max_by(|(_, a), (_, b)| a.free.len().cmp(&b.free.len()).then(b.name.cmp(&a.name)))
            .map(|(idx, _)| idx)
    }
}

pub struct PortAllocator {
    table: Mutex<Table>,
}

impl PortAllocator {
    pub fn new(min_port: u16, max_port: u16) -> Self {
        Self {
            table: Mutex::new(Table::new(min_port, max_port)),
        }
    }

    pub fn add_node(&self, name: &str) {
        self.table.lock().unwrap().ensure_node(name);
    }

    pub fn remove_node(&self, name: &str) {
        self.table.lock().unwrap().remove_node(name);
    }

    /// Rebuilds occupancy from observed state on startup (§4.A: "MUST
    /// reconcile with live state on startup to handle controller restart").
    pub fn reconcile_startup(&self, nodes: &[Node], live: &[GameServer]) {
        let mut table = self.table.lock().unwrap();
        for node in nodes {
            table.ensure_node(&node.name);
        }
        for gs in live {
            let Some(node_name) = &gs.status.node_name else {
                continue;
            };
            if !gs.status.state.is_some_and(|s| s.at_least(crate::domain::GameServerState::Scheduled)) {
                continue;
            }
            let idx = table.ensure_node(node_name);
            for binding in &gs.status.ports {
                if let Some(slots) = table.nodes.get_mut(idx) {
                    slots.mark_occupied(binding.port);
                }
            }
            table.reservations.insert(gs.key.clone(), node_name.clone());
        }
    }

    /// Fills in every `Dynamic` port on `gs` with a concrete integer,
    /// returning the updated record. Fails with `Invalid` if no node has
    /// enough free slots.
    pub fn allocate(&self, mut gs: GameServer) -> Result<GameServer, SubstrateError> {
        let count = gs.spec.dynamic_port_count();
        if count == 0 {
            return Ok(gs);
        }
        let mut table = self.table.lock().unwrap();
        let Some(idx) = table.pick_node(count) else {
            return Err(SubstrateError::Invalid(format!(
                "no node has {count} free dynamic ports in [{}, {}]",
                table.min_port, table.max_port
            )));
        };
        let node_name = table.nodes.get(idx).unwrap().name.clone();
        let ports = table
            .nodes
            .get_mut(idx)
            .unwrap()
            .take_lowest_free(count)
            .expect("pick_node already checked capacity");
        table.reservations.insert(gs.key.clone(), node_name);

        let mut ports = ports.into_iter();
        for port in gs.spec.ports.iter().filter(|p| p.policy == PortPolicy::Dynamic) {
            let assigned = ports.next().expect("counted above");
            gs.status.ports.push(crate::domain::PortBinding {
                name: port.name.clone(),
                port: assigned,
            });
        }
        Ok(gs)
    }

    /// Returns every port this game server holds back to its node's pool.
    pub fn deallocate(&self, gs: &GameServer) {
        let mut table = self.table.lock().unwrap();
        let Some(node_name) = table.reservations.remove(&gs.key) else {
            return;
        };
        let Some(idx) = table.by_name.get(&node_name).copied() else {
            return;
        };
        let dynamic_names: BTreeSet<&str> = gs
            .spec
            .ports
            .iter()
            .filter(|p| p.policy == PortPolicy::Dynamic)
            .map(|p| p.name.as_str())
            .collect();
        if let Some(slots) = table.nodes.get_mut(idx) {
            for binding in &gs.status.ports {
                if dynamic_names.contains(binding.name.as_str()) {
                    slots.release(binding.port);
                }
            }
        }
    }

    /// `sum(free + occupied) == (max - min + 1) * |nodes|` (§8 invariant 6).
    #[cfg(test)]
    fn total_slots(&self) -> usize {
        let table = self.table.lock().unwrap();
        table
            .nodes
            .iter()
            .map(|(_, n)| n.free.len() + n.occupied.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GameServerPort, GameServerSpec, HealthCheck};

    fn gs(name: &str, dynamic_ports: usize) -> GameServer {
        let ports = (0..dynamic_ports)
            .map(|i| GameServerPort {
                name: format!("p{i}"),
                container_port: 7000 + i as u16,
                policy: PortPolicy::Dynamic,
                host_port: None,
            })
            .collect();
        GameServer::new(
            ObjectKey::new("default", name),
            GameServerSpec {
                container_image: "img".into(),
                ports,
                health_check: HealthCheck::default(),
                dev_address: None,
                service_account: None,
            },
        )
    }

    #[test]
    fn allocates_from_the_only_node() {
        let allocator = PortAllocator::new(7000, 7010);
        allocator.add_node("node-a");
        let updated = allocator.allocate(gs("gs-1", 1)).unwrap();
        assert_eq!(updated.status.ports.len(), 1);
        assert!((7000..=7010).contains(&updated.status.ports[0].port));
    }

    #[test]
    fn exhaustion_fails_on_third_request() {
        let allocator = PortAllocator::new(7000, 7001);
        allocator.add_node("node-a");
        allocator.allocate(gs("gs-1", 1)).unwrap();
        allocator.allocate(gs("gs-2", 1)).unwrap();
        let err = allocator.allocate(gs("gs-3", 1)).unwrap_err();
        assert!(matches!(err, SubstrateError::Invalid(_)));
    }

    #[test]
    fn deallocate_frees_ports_for_reuse() {
        let allocator = PortAllocator::new(7000, 7000);
        allocator.add_node("node-a");
        let updated = allocator.allocate(gs("gs-1", 1)).unwrap();
        allocator.deallocate(&updated);
        let reused = allocator.allocate(gs("gs-2", 1)).unwrap();
        assert_eq!(reused.status.ports[0].port, 7000);
    }

    #[test]
    fn picks_node_with_most_free_slots_ties_broken_by_name() {
        let allocator = PortAllocator::new(7000, 7001);
        allocator.add_node("node-b");
        allocator.add_node("node-a");
        // Both nodes start with 2 free; node-b should win the tie (name
        // compared greatest-first per the table's tie-break rule).
        let updated = allocator.allocate(gs("gs-1", 1)).unwrap();
        assert_eq!(
            allocator.table.lock().unwrap().reservations[&updated.key],
            "node-b"
        );
    }

    #[test]
    fn total_slot_count_invariant_holds_after_churn() {
        let allocator = PortAllocator::new(7000, 7009);
        allocator.add_node("node-a");
        allocator.add_node("node-b");
        let a = allocator.allocate(gs("gs-1", 3)).unwrap();
        let _b = allocator.allocate(gs("gs-2", 2)).unwrap();
        allocator.deallocate(&a);
        assert_eq!(allocator.total_slots(), 10 * 2);
    }
}
