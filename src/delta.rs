use rustc_hash::FxHashMap;

use crate::partitioned::PartitionedHypergraph;
use crate::{BlockId, EdgeId, Gain, NodeId, Weight};

/// Copy-on-write view over a shared `PartitionedHypergraph`. Reads combine
/// the shared state with a small set of local overrides; writes only touch
/// the overrides. Dropping (or clearing) the overlay discards the local
/// moves, committing happens by replaying them against the shared state.
pub struct DeltaPartitionedHypergraph<'p, 'a> {
    phg: &'p PartitionedHypergraph<'a>,
    part_delta: FxHashMap<NodeId, BlockId>,
    pin_count_delta: FxHashMap<(EdgeId, BlockId), i32>,
    part_weight_delta: Vec<Weight>,
    benefit_delta: FxHashMap<NodeId, Gain>,
    incident_in_delta: FxHashMap<(NodeId, BlockId), Gain>,
}

impl<'p, 'a> DeltaPartitionedHypergraph<'p, 'a> {
    pub fn new(phg: &'p PartitionedHypergraph<'a>) -> Self {
        DeltaPartitionedHypergraph {
            phg,
            part_delta: FxHashMap::default(),
            pin_count_delta: FxHashMap::default(),
            part_weight_delta: vec![0; phg.k() as usize],
            benefit_delta: FxHashMap::default(),
            incident_in_delta: FxHashMap::default(),
        }
    }

    pub fn shared(&self) -> &'p PartitionedHypergraph<'a> {
        self.phg
    }

    pub fn k(&self) -> BlockId {
        self.phg.k()
    }

    /// Drops all local overrides, re-binding the view to the shared state.
    pub fn clear(&mut self) {
        self.part_delta.clear();
        self.pin_count_delta.clear();
        self.part_weight_delta.fill(0);
        self.benefit_delta.clear();
        self.incident_in_delta.clear();
    }

    pub fn part_id(&self, u: NodeId) -> BlockId {
        self.part_delta.get(&u).copied().unwrap_or_else(|| self.phg.part_id(u))
    }

    pub fn part_weight(&self, b: BlockId) -> Weight {
        self.phg.part_weight(b) + self.part_weight_delta[b as usize]
    }

    pub fn pin_count_in_part(&self, e: EdgeId, b: BlockId) -> u32 {
        let delta = self.pin_count_delta.get(&(e, b)).copied().unwrap_or(0);
        (self.phg.pin_count_in_part(e, b) as i32 + delta) as u32
    }

    pub fn connectivity(&self, e: EdgeId) -> u32 {
        (0..self.k()).filter(|&b| self.pin_count_in_part(e, b) > 0).count() as u32
    }

    /// km1 gain of moving u to `to`, seen through the overlay. Starts from
    /// the shared gain cache and applies the local corrections.
    pub fn gain(&self, u: NodeId, to: BlockId) -> Gain {
        let base = self.phg.gain(u, to);
        let benefit_fix = self.benefit_delta.get(&u).copied().unwrap_or(0);
        let incident_fix = self.incident_in_delta.get(&(u, to)).copied().unwrap_or(0);
        base + benefit_fix + incident_fix
    }

    /// Exact gain recomputed from the overlay's pin counts.
    pub fn compute_gain(&self, u: NodeId, to: BlockId) -> Gain {
        let from = self.part_id(u);
        let hg = self.phg.hypergraph();
        let mut gain = 0;
        for e in hg.incident_edges(u) {
            let we = hg.edge_weight(e);
            if self.pin_count_in_part(e, from) == 1 {
                gain += we;
            }
            if self.pin_count_in_part(e, to) == 0 {
                gain -= we;
            }
        }
        gain
    }

    pub fn heaviest_part_weight(&self) -> Weight {
        (0..self.k()).map(|b| self.part_weight(b)).max().unwrap_or(0)
    }

    /// Applies a move to the overlay only. Mirrors
    /// `PartitionedHypergraph::change_node_part` including the balance
    /// precondition against the combined weight.
    pub fn change_node_part(
        &mut self,
        u: NodeId,
        from: BlockId,
        to: BlockId,
        max_weight: Weight,
        mut delta_fn: impl FnMut(EdgeId, Weight, usize, u32, u32),
    ) -> bool {
        debug_assert_ne!(from, to);
        debug_assert_eq!(self.part_id(u), from);
        let hg = self.phg.hypergraph();
        let w = hg.node_weight(u);
        if self.part_weight(to) + w > max_weight {
            return false;
        }

        self.part_delta.insert(u, to);
        self.part_weight_delta[to as usize] += w;
        self.part_weight_delta[from as usize] -= w;

        let mut own_benefit = 0;
        for e in hg.incident_edges(u) {
            *self.pin_count_delta.entry((e, from)).or_insert(0) -= 1;
            *self.pin_count_delta.entry((e, to)).or_insert(0) += 1;
            let pcf = self.pin_count_in_part(e, from);
            let pct = self.pin_count_in_part(e, to);
            let we = hg.edge_weight(e);
            self.update_gains_for_edge(u, e, from, to, pcf, pct);
            if pct == 1 {
                own_benefit += we;
            }
            delta_fn(e, we, hg.edge_size(e), pcf, pct);
        }
        // Re-anchor u's benefit: stored = shared benefit + delta, so the
        // delta is the difference to the freshly computed value.
        self.set_benefit_delta(u, own_benefit);

        true
    }

    fn set_benefit_delta(&mut self, u: NodeId, target_benefit: Gain) {
        // phg.gain(u, b) = benefit[u] - penalty(u, b); we only correct the
        // benefit component, so store target - shared_benefit.
        let shared_benefit = self.shared_benefit(u);
        self.benefit_delta.insert(u, target_benefit - shared_benefit);
    }

    fn shared_benefit(&self, u: NodeId) -> Gain {
        // benefit[u] = gain(u, b) + penalty(u, b) for any b; with b = part,
        // penalty(u, part) counts nets not touching part at all, which is 0
        // for incident nets, so gain(u, part) equals benefit - penalty(part).
        // Using the identity directly on the cache avoids exposing the raw
        // arrays: gain(u, to) + (total - incident_in[to]) = benefit.
        let to = self.phg.part_id(u);
        self.phg.gain(u, to)
    }

    fn update_gains_for_edge(
        &mut self,
        mover: NodeId,
        e: EdgeId,
        from: BlockId,
        to: BlockId,
        pin_count_in_from_after: u32,
        pin_count_in_to_after: u32,
    ) {
        let hg = self.phg.hypergraph();
        let we = hg.edge_weight(e);
        if pin_count_in_from_after == 0 {
            for &p in hg.pins(e) {
                *self.incident_in_delta.entry((p, from)).or_insert(0) -= we;
            }
        } else if pin_count_in_from_after == 1 {
            for &p in hg.pins(e) {
                if p != mover && self.part_id(p) == from {
                    *self.benefit_delta.entry(p).or_insert(0) += we;
                }
            }
        }
        if pin_count_in_to_after == 1 {
            for &p in hg.pins(e) {
                *self.incident_in_delta.entry((p, to)).or_insert(0) += we;
            }
        } else if pin_count_in_to_after == 2 {
            for &p in hg.pins(e) {
                if p != mover && self.part_id(p) == to {
                    *self.benefit_delta.entry(p).or_insert(0) -= we;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypergraph::Hypergraph;

    fn toy() -> Hypergraph {
        Hypergraph::new(
            7,
            vec![vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_overlay_reads_through_to_shared_state() {
        let hg = toy();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 1, 0, 0, 1, 1]);

        let delta = DeltaPartitionedHypergraph::new(&phg);
        assert_eq!(delta.part_id(2), 1);
        assert_eq!(delta.part_weight(0), 4);
        assert_eq!(delta.pin_count_in_part(0, 0), 1);
    }

    #[test]
    fn test_local_moves_do_not_touch_shared_state() {
        let hg = toy();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 1, 0, 0, 1, 1]);

        let mut delta = DeltaPartitionedHypergraph::new(&phg);
        assert!(delta.change_node_part(6, 1, 0, Weight::MAX, |_, _, _, _, _| {}));

        assert_eq!(delta.part_id(6), 0);
        assert_eq!(phg.part_id(6), 1);
        assert_eq!(delta.part_weight(0), 5);
        assert_eq!(phg.part_weight(0), 4);
        assert_eq!(delta.pin_count_in_part(2, 1), 0);
        assert_eq!(phg.pin_count_in_part(2, 1), 1);
    }

    #[test]
    fn test_overlay_gain_matches_recomputation() {
        let hg = toy();
        let mut phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 1, 0, 0, 1, 1]);
        phg.initialize_gain_cache();

        let mut delta = DeltaPartitionedHypergraph::new(&phg);
        assert!(delta.change_node_part(6, 1, 0, Weight::MAX, |_, _, _, _, _| {}));
        assert!(delta.change_node_part(2, 1, 0, Weight::MAX, |_, _, _, _, _| {}));

        for u in hg.nodes() {
            for b in 0..2 {
                if b != delta.part_id(u) {
                    assert_eq!(delta.gain(u, b), delta.compute_gain(u, b), "node {u} to {b}");
                }
            }
        }
    }

    #[test]
    fn test_clear_discards_overrides() {
        let hg = toy();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 1, 0, 0, 1, 1]);

        let mut delta = DeltaPartitionedHypergraph::new(&phg);
        delta.change_node_part(6, 1, 0, Weight::MAX, |_, _, _, _, _| {});
        delta.clear();

        assert_eq!(delta.part_id(6), 1);
        assert_eq!(delta.part_weight(0), 4);
    }
}
