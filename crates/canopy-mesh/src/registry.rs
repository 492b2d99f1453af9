//! Node arena and topology queries.
//!
//! Nodes are created once at configuration load and live for the lifetime of
//! the process, so the registry stores them in a plain `Vec` and everything
//! else refers to them by stable index. The gateway edges form a tree rooted
//! at the gateway board; availability is recomputed along that tree, never
//! stored.

use std::collections::HashMap;
use std::time::Instant;

use tracing::debug;

use crate::node::{Node, NodeIdx, TimeoutOutcome};
use crate::uplink::UplinkNotice;

#[derive(Debug)]
pub struct Registry {
    nodes: Vec<Node>,
    by_id: HashMap<u32, NodeIdx>,
    by_name: HashMap<String, NodeIdx>,
    /// Node indices in ascending route-length order (parents first).
    sweep_order: Vec<NodeIdx>,
}

impl Registry {
    /// Build the arena. Uniqueness of ids and names has already been
    /// validated by the configuration loader.
    pub fn new(nodes: Vec<Node>) -> Self {
        let by_id = nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
        let by_name = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        let mut sweep_order: Vec<NodeIdx> = (0..nodes.len()).collect();
        sweep_order.sort_by_key(|&i| nodes[i].route_length);
        Registry {
            nodes,
            by_id,
            by_name,
            sweep_order,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx]
    }

    pub fn get_mut(&mut self, idx: NodeIdx) -> &mut Node {
        &mut self.nodes[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, &Node)> {
        self.nodes.iter().enumerate()
    }

    pub fn idx_by_id(&self, id: u32) -> Option<NodeIdx> {
        self.by_id.get(&id).copied()
    }

    pub fn idx_by_name(&self, name: &str) -> Option<NodeIdx> {
        self.by_name.get(name).copied()
    }

    /// Resolve an operator-supplied node reference: exact name first, then a
    /// leading decimal id.
    pub fn resolve(&self, reference: &str) -> Option<NodeIdx> {
        if let Some(idx) = self.idx_by_name(reference) {
            return Some(idx);
        }
        let digits: String = reference.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse::<u32>().ok().and_then(|id| self.idx_by_id(id))
    }

    /// Node indices in ascending route-length order.
    pub fn sweep_order(&self) -> &[NodeIdx] {
        &self.sweep_order
    }

    // ─── Availability ───────────────────────────────────────────────────────

    /// Recompute availability for every node: locally ready and every
    /// ancestor on the gateway chain available.
    pub fn availability(&self) -> Vec<bool> {
        let mut avail = vec![false; self.nodes.len()];
        // Parents sort before children, so one pass suffices.
        for &idx in &self.sweep_order {
            let node = &self.nodes[idx];
            let upstream = node.gateway.map_or(true, |gw| avail[gw]);
            avail[idx] = upstream && node.locally_available();
        }
        avail
    }

    /// Whether the gateway chain above `idx` is available (true for nodes
    /// directly on the root).
    pub fn chain_available(&self, avail: &[bool], idx: NodeIdx) -> bool {
        self.nodes[idx].gateway.map_or(true, |gw| avail[gw])
    }

    // ─── Cross-node outcomes ────────────────────────────────────────────────

    /// Deliver a `###TIMEOUT` to a node. On give-up the upstream path is
    /// revalidated by owing a keepalive on the gateway as well.
    pub fn node_timeout(&mut self, idx: NodeIdx, now: Instant) -> TimeoutOutcome {
        let outcome = self.nodes[idx].on_timeout(now);
        if outcome.gave_up {
            if let Some(gw) = self.nodes[idx].gateway {
                self.nodes[gw].set_check();
            }
        }
        outcome
    }

    /// Record a status value for `target` and fan it out to every node so
    /// peers can update their LED mirrors.
    pub fn apply_status(&mut self, target: NodeIdx, status: u32) -> Vec<UplinkNotice> {
        let name = self.nodes[target].name.clone();
        debug!(node = %name, status, "applying status update");
        let mut notices = Vec::new();
        for idx in 0..self.nodes.len() {
            let own = idx == target;
            notices.extend(self.nodes[idx].on_peer_status(&name, own, status));
        }
        notices
    }

    /// Reset every node to disconnected, as after a link loss.
    pub fn reset_runtime(&mut self) {
        for node in &mut self.nodes {
            node.reset_runtime();
        }
    }

    /// Per-node blocks of the state dump.
    pub fn debug_state(&self, now: Instant) -> String {
        let avail = self.availability();
        let mut out = String::new();
        for node in &self.nodes {
            let upstream = match node.gateway {
                None => "Direct",
                Some(gw) if avail[gw] => "Available",
                Some(_) => "ROUTE OFFLINE",
            };
            out.push_str(&node.debug_state(now, upstream));
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Kind, NodeSettings};
    use std::time::Duration;

    fn settings() -> NodeSettings {
        NodeSettings {
            hop_timeout: 2,
            max_retransmissions: 2,
            check_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(30),
        }
    }

    fn node(name: &str, id: u32, gateway: Option<NodeIdx>, route_length: u32) -> Node {
        let gateway_id = 0;
        Node::new(
            name.into(),
            id,
            gateway,
            gateway_id,
            route_length,
            "0:0".into(),
            settings(),
            Kind::Base,
        )
    }

    fn chain() -> Registry {
        // A (root) <- B <- C
        Registry::new(vec![
            node("A", 2, None, 1),
            node("B", 3, Some(0), 2),
            node("C", 4, Some(1), 3),
        ])
    }

    fn make_available(reg: &mut Registry, idx: NodeIdx) {
        let now = Instant::now();
        let node = reg.get_mut(idx);
        node.next_message(now, true);
        node.on_ack(0, now).unwrap();
        node.next_message(now, true);
        node.on_ack(0, now).unwrap();
    }

    #[test]
    fn availability_is_transitive() {
        let mut reg = chain();
        make_available(&mut reg, 0);
        make_available(&mut reg, 1);
        make_available(&mut reg, 2);
        assert_eq!(reg.availability(), vec![true, true, true]);

        // Dropping the middle node takes the leaf down with it.
        reg.get_mut(1).abort_command();
        let avail = reg.availability();
        assert_eq!(avail, vec![true, false, false]);
        for (idx, node) in reg.iter() {
            if avail[idx] {
                if let Some(gw) = node.gateway {
                    assert!(avail[gw], "available node with unavailable gateway");
                }
            }
        }
    }

    #[test]
    fn give_up_owes_check_upstream() {
        let mut reg = chain();
        make_available(&mut reg, 0);
        make_available(&mut reg, 1);

        let now = Instant::now();
        // Run B's keepalive out of retransmissions.
        reg.get_mut(1).set_check();
        reg.get_mut(1).next_message(now, true).unwrap();
        for _ in 0..2 {
            reg.node_timeout(1, now);
            reg.get_mut(1).next_message(now, true).unwrap();
        }
        let outcome = reg.node_timeout(1, now);
        assert!(outcome.gave_up);
        assert!(reg.get(0).flags.check, "gateway owes a path check");
    }

    #[test]
    fn resolve_by_name_and_id() {
        let reg = chain();
        assert_eq!(reg.resolve("B"), Some(1));
        assert_eq!(reg.resolve("3"), Some(1));
        assert_eq!(reg.resolve("4x"), Some(2));
        assert_eq!(reg.resolve("nope"), None);
    }

    #[test]
    fn sweep_order_is_parents_first() {
        let reg = Registry::new(vec![
            node("C", 4, Some(1), 3),
            node("B", 3, Some(2), 2),
            node("A", 2, None, 1),
        ]);
        assert_eq!(reg.sweep_order(), &[2, 1, 0]);
    }
}
