use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::Error;
use crate::incident_nets::IncidentNetArray;
use crate::{EdgeId, NodeId, Weight};

/// Nets removed from one vertex by a single-pin cleanup, in call order.
pub type RemovedNets = (NodeId, Vec<EdgeId>);

/// Static hypergraph with two CSR-style adjacencies: the pin list of each
/// hyperedge (shrinkable in place) and the incident-net arena of each vertex.
/// Contractions are applied in place and can be undone in reverse order.
pub struct Hypergraph {
    initial_num_nodes: usize,
    initial_num_edges: usize,
    initial_num_pins: usize,
    current_num_nodes: usize,
    node_weights: Vec<Weight>,
    node_enabled: Vec<bool>,
    edge_weights: Vec<Weight>,
    edge_enabled: Vec<bool>,
    pin_offsets: Vec<usize>,
    pin_sizes: Vec<u32>,
    pins: Vec<NodeId>,
    incident_nets: IncidentNetArray,
    total_weight: Weight,
}

impl Hypergraph {
    /// Builds a hypergraph from explicit pin lists. Duplicate pins within an
    /// edge are merged; empty edges and out-of-range pins are rejected.
    pub fn new(
        num_nodes: usize,
        mut edge_vector: Vec<Vec<NodeId>>,
        edge_weights: Option<Vec<Weight>>,
        node_weights: Option<Vec<Weight>>,
    ) -> Result<Self, Error> {
        for (e, pins) in edge_vector.iter_mut().enumerate() {
            if pins.is_empty() {
                return Err(Error::InvalidInput(format!("hyperedge {e} has no pins")));
            }
            pins.sort_unstable();
            pins.dedup();
            if let Some(&max_pin) = pins.last() {
                if max_pin as usize >= num_nodes {
                    return Err(Error::InvalidInput(format!(
                        "hyperedge {e} references pin {max_pin}, but there are only {num_nodes} vertices"
                    )));
                }
            }
        }

        let num_edges = edge_vector.len();
        if let Some(ref w) = edge_weights {
            if w.len() != num_edges {
                return Err(Error::InputLenMismatch { expected: num_edges, actual: w.len() });
            }
        }
        if let Some(ref w) = node_weights {
            if w.len() != num_nodes {
                return Err(Error::InputLenMismatch { expected: num_nodes, actual: w.len() });
            }
        }

        let node_weights = node_weights.unwrap_or_else(|| vec![1; num_nodes]);
        let edge_weights = edge_weights.unwrap_or_else(|| vec![1; num_edges]);
        let total_weight = node_weights.iter().sum();

        let mut pin_offsets = Vec::with_capacity(num_edges + 1);
        let mut pin_sizes = Vec::with_capacity(num_edges);
        let mut pins = Vec::new();
        pin_offsets.push(0);
        for edge_pins in &edge_vector {
            pins.extend_from_slice(edge_pins);
            pin_sizes.push(edge_pins.len() as u32);
            pin_offsets.push(pins.len());
        }

        let incident_nets = IncidentNetArray::new(num_nodes, &edge_vector);

        Ok(Hypergraph {
            initial_num_nodes: num_nodes,
            initial_num_edges: num_edges,
            initial_num_pins: pins.len(),
            current_num_nodes: num_nodes,
            node_weights,
            node_enabled: vec![true; num_nodes],
            edge_weights,
            edge_enabled: vec![true; num_edges],
            pin_offsets,
            pin_sizes,
            pins,
            incident_nets,
            total_weight,
        })
    }

    pub fn initial_num_nodes(&self) -> usize {
        self.initial_num_nodes
    }

    pub fn initial_num_edges(&self) -> usize {
        self.initial_num_edges
    }

    pub fn initial_num_pins(&self) -> usize {
        self.initial_num_pins
    }

    /// Number of vertices that are still enabled.
    pub fn current_num_nodes(&self) -> usize {
        self.current_num_nodes
    }

    pub fn total_weight(&self) -> Weight {
        self.total_weight
    }

    pub fn max_node_weight(&self) -> Weight {
        self.nodes().map(|u| self.node_weight(u)).max().unwrap_or(0)
    }

    /// Iterates over all enabled vertices.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.initial_num_nodes as NodeId).filter(move |&u| self.node_enabled[u as usize])
    }

    /// Iterates over all enabled hyperedges.
    pub fn edges(&self) -> impl Iterator<Item = EdgeId> + '_ {
        (0..self.initial_num_edges as EdgeId).filter(move |&e| self.edge_enabled[e as usize])
    }

    pub fn node_is_enabled(&self, u: NodeId) -> bool {
        self.node_enabled[u as usize]
    }

    pub fn edge_is_enabled(&self, e: EdgeId) -> bool {
        self.edge_enabled[e as usize]
    }

    pub fn node_weight(&self, u: NodeId) -> Weight {
        self.node_weights[u as usize]
    }

    pub fn edge_weight(&self, e: EdgeId) -> Weight {
        self.edge_weights[e as usize]
    }

    pub fn node_degree(&self, u: NodeId) -> u32 {
        self.incident_nets.degree(u)
    }

    /// Active pins of hyperedge e.
    pub fn pins(&self, e: EdgeId) -> &[NodeId] {
        let off = self.pin_offsets[e as usize];
        &self.pins[off..off + self.pin_sizes[e as usize] as usize]
    }

    pub fn edge_size(&self, e: EdgeId) -> usize {
        self.pin_sizes[e as usize] as usize
    }

    /// Active incident nets of vertex u.
    pub fn incident_edges(&self, u: NodeId) -> impl Iterator<Item = EdgeId> + '_ {
        self.incident_nets.incident_edges(u)
    }

    /// True iff every enabled hyperedge has exactly two pins.
    pub fn is_graph(&self) -> bool {
        self.edges().all(|e| self.edge_size(e) == 2)
    }

    /// Contracts vertex v into representative u: shared nets lose the
    /// duplicate pin, non-shared nets replace v by u, and v's incident-net
    /// ring is appended to u's.
    pub fn contract(&mut self, u: NodeId, v: NodeId) {
        debug_assert!(u != v);
        debug_assert!(self.node_enabled[u as usize] && self.node_enabled[v as usize]);

        let shared: FxHashSet<EdgeId> = self.incident_nets.incident_edges(u).collect();
        let v_edges: Vec<EdgeId> = self.incident_nets.incident_edges(v).collect();
        for &e in &v_edges {
            if shared.contains(&e) {
                self.remove_pin(e, v);
            } else {
                self.replace_pin(e, v, u);
            }
        }

        self.incident_nets.contract(u, v, |e| shared.contains(&e), |_| {}, |_| {});
        self.node_weights[u as usize] += self.node_weights[v as usize];
        self.node_enabled[v as usize] = false;
        self.current_num_nodes -= 1;
    }

    /// Uncontracts the pair (u, v). Must be called in reverse contraction
    /// order. Returns the nets whose pin list regained v, so a partition
    /// maintained on top can adjust its pin counts.
    pub fn uncontract(&mut self, u: NodeId, v: NodeId) -> Vec<EdgeId> {
        debug_assert!(!self.node_enabled[v as usize]);

        let mut survivors = Vec::new();
        let mut reactivated = Vec::new();
        self.incident_nets.uncontract(
            u,
            v,
            |e| survivors.push(e),
            |e| reactivated.push(e),
            |_| {},
            |_| {},
        );

        for &e in &survivors {
            self.restore_pin(e, u, v);
        }
        for &e in &reactivated {
            // The deactivated slot right behind the active range still holds v.
            let off = self.pin_offsets[e as usize];
            let size = self.pin_sizes[e as usize] as usize;
            debug_assert_eq!(self.pins[off + size], v);
            self.pin_sizes[e as usize] += 1;
        }

        self.node_weights[u as usize] -= self.node_weights[v as usize];
        self.node_enabled[v as usize] = true;
        self.current_num_nodes += 1;
        reactivated
    }

    /// Disables all hyperedges with a single pin and detaches them from the
    /// incident-net arena. The returned groups must be handed back to
    /// `restore_single_pin_nets` in reverse level order.
    pub fn remove_single_pin_nets(&mut self) -> Vec<RemovedNets> {
        let mut by_vertex: FxHashMap<NodeId, Vec<EdgeId>> = FxHashMap::default();
        for e in 0..self.initial_num_edges as EdgeId {
            if self.edge_enabled[e as usize] && self.pin_sizes[e as usize] == 1 {
                let pin = self.pins[self.pin_offsets[e as usize]];
                by_vertex.entry(pin).or_default().push(e);
                self.edge_enabled[e as usize] = false;
            }
        }

        let mut groups: Vec<RemovedNets> = by_vertex.into_iter().collect();
        groups.sort_unstable_by_key(|(u, _)| *u);
        for (u, edges) in &groups {
            let removed: FxHashSet<EdgeId> = edges.iter().copied().collect();
            self.incident_nets.remove_incident_nets(*u, |e| removed.contains(&e));
        }
        groups
    }

    pub fn restore_single_pin_nets(&mut self, groups: &[RemovedNets]) {
        for (u, edges) in groups.iter().rev() {
            self.incident_nets.restore_incident_nets(*u);
            for &e in edges {
                self.edge_enabled[e as usize] = true;
            }
        }
    }

    fn remove_pin(&mut self, e: EdgeId, v: NodeId) {
        let off = self.pin_offsets[e as usize];
        let size = self.pin_sizes[e as usize] as usize;
        let slot = self.pins[off..off + size]
            .iter()
            .position(|&p| p == v)
            .expect("pin not present in hyperedge");
        self.pins.swap(off + slot, off + size - 1);
        self.pin_sizes[e as usize] -= 1;
    }

    fn replace_pin(&mut self, e: EdgeId, v: NodeId, u: NodeId) {
        let off = self.pin_offsets[e as usize];
        let size = self.pin_sizes[e as usize] as usize;
        let slot = self.pins[off..off + size]
            .iter()
            .position(|&p| p == v)
            .expect("pin not present in hyperedge");
        self.pins[off + slot] = u;
    }

    fn restore_pin(&mut self, e: EdgeId, u: NodeId, v: NodeId) {
        let off = self.pin_offsets[e as usize];
        let size = self.pin_sizes[e as usize] as usize;
        let slot = self.pins[off..off + size]
            .iter()
            .position(|&p| p == u)
            .expect("representative not present in hyperedge");
        self.pins[off + slot] = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn toy_hypergraph() -> Hypergraph {
        Hypergraph::new(
            7,
            vec![vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
            None,
            None,
        )
        .unwrap()
    }

    fn sorted_pins(hg: &Hypergraph, e: EdgeId) -> Vec<NodeId> {
        let mut pins = hg.pins(e).to_vec();
        pins.sort_unstable();
        pins
    }

    #[test]
    fn test_construction() {
        let hg = toy_hypergraph();
        assert_eq!(hg.initial_num_nodes(), 7);
        assert_eq!(hg.initial_num_edges(), 4);
        assert_eq!(hg.initial_num_pins(), 12);
        assert_eq!(hg.total_weight(), 7);
        assert_eq!(hg.node_degree(0), 2);
        assert_eq!(hg.edge_size(1), 4);
        assert!(!hg.is_graph());
    }

    #[test]
    fn test_rejects_malformed_input() {
        assert!(Hypergraph::new(3, vec![vec![]], None, None).is_err());
        assert!(Hypergraph::new(3, vec![vec![0, 3]], None, None).is_err());
        assert!(Hypergraph::new(3, vec![vec![0, 1]], Some(vec![1, 2]), None).is_err());
    }

    #[test]
    fn test_contract_merges_pins_and_weights() {
        let mut hg = toy_hypergraph();
        hg.contract(3, 4);

        assert_eq!(hg.current_num_nodes(), 6);
        assert_eq!(hg.node_weight(3), 2);
        assert!(!hg.node_is_enabled(4));
        // e1 = {0, 1, 3, 4} loses the duplicate pin, e2 = {3, 4, 6} as well.
        assert_eq!(sorted_pins(&hg, 1), vec![0, 1, 3]);
        assert_eq!(sorted_pins(&hg, 2), vec![3, 6]);
        assert_eq!(hg.node_degree(3), 2);
    }

    #[test]
    fn test_contract_uncontract_round_trip() {
        let mut hg = toy_hypergraph();
        let before: Vec<Vec<NodeId>> = (0..4).map(|e| sorted_pins(&hg, e)).collect();

        hg.contract(3, 4);
        hg.contract(0, 3);
        hg.uncontract(0, 3);
        hg.uncontract(3, 4);

        for e in 0..4 {
            assert_eq!(sorted_pins(&hg, e), before[e as usize]);
        }
        assert_eq!(hg.current_num_nodes(), 7);
        assert_eq!(hg.node_weight(3), 1);
        assert_eq!(hg.node_weight(0), 1);
        for u in 0..7 {
            assert!(hg.node_is_enabled(u));
        }
        let mut incident: Vec<EdgeId> = hg.incident_edges(3).collect();
        incident.sort_unstable();
        assert_eq!(incident, vec![1, 2]);
    }

    #[test]
    fn test_single_pin_net_removal_round_trip() {
        let mut hg = toy_hypergraph();
        // Contracting 2 into 0 shrinks e0 = {0, 2} to a single pin.
        hg.contract(0, 2);
        assert_eq!(hg.edge_size(0), 1);

        let removed = hg.remove_single_pin_nets();
        assert_eq!(removed.len(), 1);
        assert!(!hg.edge_is_enabled(0));
        assert_eq!(hg.node_degree(0), 2);

        hg.restore_single_pin_nets(&removed);
        assert!(hg.edge_is_enabled(0));
        assert_eq!(hg.node_degree(0), 3);

        hg.uncontract(0, 2);
        assert_eq!(sorted_pins(&hg, 0), vec![0, 2]);
        assert_eq!(hg.node_degree(0), 2);
        assert_eq!(hg.node_degree(2), 2);
    }
}
