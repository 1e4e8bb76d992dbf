use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};

use rayon::prelude::*;

use crate::hypergraph::Hypergraph;
use crate::{BlockId, EdgeId, Gain, NodeId, Weight, INVALID_BLOCK};

/// Attributed km1 delta of a move, derived from the pin counts *after* the
/// move: the source block may leave the connectivity set of e, the target
/// block may newly enter it.
#[inline]
pub fn km1_delta(edge_weight: Weight, pin_count_in_from_after: u32, pin_count_in_to_after: u32) -> Gain {
    let mut delta = 0;
    if pin_count_in_from_after == 0 {
        delta -= edge_weight;
    }
    if pin_count_in_to_after == 1 {
        delta += edge_weight;
    }
    delta
}

/// Attributed cut delta of a move.
#[inline]
pub fn cut_delta(
    edge_weight: Weight,
    edge_size: usize,
    pin_count_in_from_after: u32,
    pin_count_in_to_after: u32,
) -> Gain {
    if edge_size == 1 {
        return 0;
    }
    if pin_count_in_to_after as usize == edge_size {
        -edge_weight
    } else if pin_count_in_from_after as usize == edge_size - 1
        && pin_count_in_to_after == 1
    {
        edge_weight
    } else {
        0
    }
}

/// Incremental km1 gain cache. For every vertex it stores the move-from
/// benefit (weight of nets where the vertex is the last pin in its block) and
/// per (vertex, block) the incident weight of nets already touching that
/// block. Only the four pin-count transitions 0/1 in the source and 1/2 in
/// the target block require updates.
struct GainCache {
    benefit: Vec<AtomicI64>,
    incident_in: Vec<AtomicI64>,
    incident_total: Vec<AtomicI64>,
    initialized: bool,
}

/// A hypergraph together with a mutable k-way partition: block assignment,
/// atomic pin counts per (edge, block), atomic block weights and an optional
/// gain cache. All move application is thread-safe; the balance precondition
/// `W[to] + c(v) <= max_weight[to]` is enforced with a CAS on the target
/// block weight before anything else is touched.
pub struct PartitionedHypergraph<'a> {
    hg: &'a Hypergraph,
    k: BlockId,
    part: Vec<AtomicI32>,
    pin_counts: Vec<AtomicU32>,
    part_weights: Vec<AtomicI64>,
    gain_cache: GainCache,
}

impl<'a> PartitionedHypergraph<'a> {
    pub fn new(hg: &'a Hypergraph, k: BlockId) -> Self {
        let n = hg.initial_num_nodes();
        let m = hg.initial_num_edges();
        let ku = k as usize;
        PartitionedHypergraph {
            hg,
            k,
            part: (0..n).map(|_| AtomicI32::new(INVALID_BLOCK)).collect(),
            pin_counts: (0..m * ku).map(|_| AtomicU32::new(0)).collect(),
            part_weights: (0..ku).map(|_| AtomicI64::new(0)).collect(),
            gain_cache: GainCache {
                benefit: (0..n).map(|_| AtomicI64::new(0)).collect(),
                incident_in: (0..n * ku).map(|_| AtomicI64::new(0)).collect(),
                incident_total: (0..n).map(|_| AtomicI64::new(0)).collect(),
                initialized: false,
            },
        }
    }

    pub fn hypergraph(&self) -> &Hypergraph {
        self.hg
    }

    pub fn k(&self) -> BlockId {
        self.k
    }

    pub fn part_id(&self, u: NodeId) -> BlockId {
        self.part[u as usize].load(Ordering::Relaxed)
    }

    pub fn part_weight(&self, b: BlockId) -> Weight {
        self.part_weights[b as usize].load(Ordering::Relaxed)
    }

    pub fn pin_count_in_part(&self, e: EdgeId, b: BlockId) -> u32 {
        self.pin_counts[e as usize * self.k as usize + b as usize].load(Ordering::Relaxed)
    }

    /// Number of blocks the pins of e are spread over.
    pub fn connectivity(&self, e: EdgeId) -> u32 {
        (0..self.k).filter(|&b| self.pin_count_in_part(e, b) > 0).count() as u32
    }

    /// Blocks with at least one pin of e.
    pub fn connectivity_set(&self, e: EdgeId) -> impl Iterator<Item = BlockId> + '_ {
        (0..self.k).filter(move |&b| self.pin_count_in_part(e, b) > 0)
    }

    /// True iff u has an incident net spanning more than one block.
    pub fn is_border_node(&self, u: NodeId) -> bool {
        self.hg.incident_edges(u).any(|e| self.connectivity(e) > 1)
    }

    /// Assigns u to block b without maintaining pin counts or weights. Used
    /// while constructing an initial partition; finish with
    /// `initialize_partition`.
    pub fn set_only_node_part(&self, u: NodeId, b: BlockId) {
        self.part[u as usize].store(b, Ordering::Relaxed);
    }

    /// Assigns u to block b and maintains block weights and pin counts. Used
    /// by sequential flat partitioners that grow a partition node by node.
    pub fn set_node_part(&self, u: NodeId, b: BlockId) {
        debug_assert_eq!(self.part_id(u), INVALID_BLOCK);
        self.part[u as usize].store(b, Ordering::Relaxed);
        self.part_weights[b as usize].fetch_add(self.hg.node_weight(u), Ordering::Relaxed);
        for e in self.hg.incident_edges(u) {
            self.pin_counts[e as usize * self.k as usize + b as usize]
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Recomputes block weights and pin counts from the block assignment.
    pub fn initialize_partition(&self) {
        let ku = self.k as usize;
        for c in &self.pin_counts {
            c.store(0, Ordering::Relaxed);
        }
        for w in &self.part_weights {
            w.store(0, Ordering::Relaxed);
        }
        self.hg.nodes().for_each(|u| {
            let b = self.part_id(u);
            debug_assert_ne!(b, INVALID_BLOCK);
            self.part_weights[b as usize].fetch_add(self.hg.node_weight(u), Ordering::Relaxed);
        });
        self.hg
            .edges()
            .collect::<Vec<_>>()
            .par_iter()
            .for_each(|&e| {
                for &p in self.hg.pins(e) {
                    let b = self.part_id(p);
                    self.pin_counts[e as usize * ku + b as usize].fetch_add(1, Ordering::Relaxed);
                }
            });
    }

    pub fn reset_partition(&self) {
        for p in &self.part {
            p.store(INVALID_BLOCK, Ordering::Relaxed);
        }
        for c in &self.pin_counts {
            c.store(0, Ordering::Relaxed);
        }
        for w in &self.part_weights {
            w.store(0, Ordering::Relaxed);
        }
    }

    pub fn extract_partition(&self, out: &mut [BlockId]) {
        for u in 0..self.hg.initial_num_nodes() {
            out[u] = self.part[u].load(Ordering::Relaxed);
        }
    }

    pub fn apply_partition(&self, partition: &[BlockId]) {
        for u in self.hg.nodes() {
            self.set_only_node_part(u, partition[u as usize]);
        }
        self.initialize_partition();
    }

    /// Moves u from `from` to `to` if the balance precondition holds.
    /// `report_success` runs right after the move is guaranteed to happen
    /// (used to draw a move id); `delta_fn` receives
    /// (edge, weight, size, pin_count_in_from_after, pin_count_in_to_after)
    /// for every incident net.
    pub fn change_node_part(
        &self,
        u: NodeId,
        from: BlockId,
        to: BlockId,
        max_weight: Weight,
        report_success: impl FnOnce(),
        delta_fn: impl FnMut(EdgeId, Weight, usize, u32, u32),
    ) -> bool {
        self.change_node_part_impl(u, from, to, max_weight, report_success, delta_fn, false)
    }

    /// Same as `change_node_part`, but also keeps the gain cache in sync.
    pub fn change_node_part_with_gain_cache(
        &self,
        u: NodeId,
        from: BlockId,
        to: BlockId,
        max_weight: Weight,
        report_success: impl FnOnce(),
        delta_fn: impl FnMut(EdgeId, Weight, usize, u32, u32),
    ) -> bool {
        self.change_node_part_impl(u, from, to, max_weight, report_success, delta_fn, true)
    }

    fn change_node_part_impl(
        &self,
        u: NodeId,
        from: BlockId,
        to: BlockId,
        max_weight: Weight,
        report_success: impl FnOnce(),
        mut delta_fn: impl FnMut(EdgeId, Weight, usize, u32, u32),
        update_gain_cache: bool,
    ) -> bool {
        debug_assert_ne!(from, to);
        let ku = self.k as usize;
        let w = self.hg.node_weight(u);

        let mut current = self.part_weights[to as usize].load(Ordering::Relaxed);
        loop {
            if current + w > max_weight {
                return false;
            }
            match self.part_weights[to as usize].compare_exchange_weak(
                current,
                current + w,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        // A concurrent search may have grabbed the vertex in the meantime;
        // losing the race gives the weight reservation back.
        if self.part[u as usize]
            .compare_exchange(from, to, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            self.part_weights[to as usize].fetch_sub(w, Ordering::Relaxed);
            return false;
        }
        report_success();

        let mut own_benefit = 0;
        for e in self.hg.incident_edges(u) {
            let idx = e as usize * ku;
            let pcf = self.pin_counts[idx + from as usize].fetch_sub(1, Ordering::Relaxed) - 1;
            let pct = self.pin_counts[idx + to as usize].fetch_add(1, Ordering::Relaxed) + 1;
            let we = self.hg.edge_weight(e);
            if update_gain_cache {
                self.update_gains_for_edge(u, e, from, to, pcf, pct);
                if pct == 1 {
                    own_benefit += we;
                }
            }
            delta_fn(e, we, self.hg.edge_size(e), pcf, pct);
        }
        if update_gain_cache {
            self.gain_cache.benefit[u as usize].store(own_benefit, Ordering::Relaxed);
        }

        self.part_weights[from as usize].fetch_sub(w, Ordering::Relaxed);
        true
    }

    fn update_gains_for_edge(
        &self,
        mover: NodeId,
        e: EdgeId,
        from: BlockId,
        to: BlockId,
        pin_count_in_from_after: u32,
        pin_count_in_to_after: u32,
    ) {
        let ku = self.k as usize;
        let we = self.hg.edge_weight(e);
        if pin_count_in_from_after == 0 {
            // `from` left the connectivity set: the net no longer binds any
            // pin to it.
            for &p in self.hg.pins(e) {
                self.gain_cache.incident_in[p as usize * ku + from as usize]
                    .fetch_sub(we, Ordering::Relaxed);
            }
        } else if pin_count_in_from_after == 1 {
            // A single pin remains in `from`; moving it away would free the
            // net from that block.
            for &p in self.hg.pins(e) {
                if p != mover && self.part_id(p) == from {
                    self.gain_cache.benefit[p as usize].fetch_add(we, Ordering::Relaxed);
                }
            }
        }
        if pin_count_in_to_after == 1 {
            // `to` entered the connectivity set.
            for &p in self.hg.pins(e) {
                self.gain_cache.incident_in[p as usize * ku + to as usize]
                    .fetch_add(we, Ordering::Relaxed);
            }
        } else if pin_count_in_to_after == 2 {
            // The pin that used to be alone in `to` lost its benefit.
            for &p in self.hg.pins(e) {
                if p != mover && self.part_id(p) == to {
                    self.gain_cache.benefit[p as usize].fetch_sub(we, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn gain_cache_initialized(&self) -> bool {
        self.gain_cache.initialized
    }

    /// (Re)computes the gain cache from the current pin counts.
    pub fn initialize_gain_cache(&mut self) {
        let ku = self.k as usize;
        {
            let this = &*self;
            let nodes: Vec<NodeId> = this.hg.nodes().collect();
            nodes.par_iter().for_each(|&u| {
                let my_block = this.part_id(u);
                let mut total = 0;
                let mut benefit = 0;
                let mut incident = vec![0i64; ku];
                for e in this.hg.incident_edges(u) {
                    let we = this.hg.edge_weight(e);
                    total += we;
                    if this.pin_count_in_part(e, my_block) == 1 {
                        benefit += we;
                    }
                    for b in 0..ku {
                        if this.pin_count_in_part(e, b as BlockId) > 0 {
                            incident[b] += we;
                        }
                    }
                }
                this.gain_cache.incident_total[u as usize].store(total, Ordering::Relaxed);
                this.gain_cache.benefit[u as usize].store(benefit, Ordering::Relaxed);
                for b in 0..ku {
                    this.gain_cache.incident_in[u as usize * ku + b]
                        .store(incident[b], Ordering::Relaxed);
                }
            });
        }
        self.gain_cache.initialized = true;
    }

    /// Cached km1 gain of moving u to block `to`. May be stale under
    /// concurrent moves; callers re-validate at move extraction time.
    pub fn gain(&self, u: NodeId, to: BlockId) -> Gain {
        let ku = self.k as usize;
        let benefit = self.gain_cache.benefit[u as usize].load(Ordering::Relaxed);
        let total = self.gain_cache.incident_total[u as usize].load(Ordering::Relaxed);
        let incident_to =
            self.gain_cache.incident_in[u as usize * ku + to as usize].load(Ordering::Relaxed);
        benefit - (total - incident_to)
    }

    /// Exact km1 gain of moving u to block `to`, recomputed from pin counts.
    pub fn compute_gain(&self, u: NodeId, to: BlockId) -> Gain {
        let from = self.part_id(u);
        let mut gain = 0;
        for e in self.hg.incident_edges(u) {
            let we = self.hg.edge_weight(e);
            if self.pin_count_in_part(e, from) == 1 {
                gain += we;
            }
            if self.pin_count_in_part(e, to) == 0 {
                gain -= we;
            }
        }
        gain
    }

    /// Heaviest block and its weight.
    pub fn heaviest_part_and_weight(&self) -> (BlockId, Weight) {
        let mut block = 0;
        let mut weight = Weight::MIN;
        for b in 0..self.k {
            let w = self.part_weight(b);
            if w > weight {
                weight = w;
                block = b;
            }
        }
        (block, weight)
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

    fn partitioned(hg: &Hypergraph) -> PartitionedHypergraph<'_> {
        let phg = PartitionedHypergraph::new(hg, 2);
        // {0, 1, 3, 4} | {2, 5, 6}
        phg.apply_partition(&[0, 0, 1, 0, 0, 1, 1]);
        phg
    }

    #[test]
    fn test_pin_counts_and_connectivity() {
        let hg = toy();
        let phg = partitioned(&hg);

        assert_eq!(phg.pin_count_in_part(0, 0), 1);
        assert_eq!(phg.pin_count_in_part(0, 1), 1);
        assert_eq!(phg.connectivity(0), 2);
        assert_eq!(phg.connectivity(1), 1);
        assert_eq!(phg.part_weight(0), 4);
        assert_eq!(phg.part_weight(1), 3);
        // pin counts of every edge sum to its size
        for e in hg.edges() {
            let total: u32 = (0..2).map(|b| phg.pin_count_in_part(e, b)).sum();
            assert_eq!(total as usize, hg.edge_size(e));
        }
    }

    #[test]
    fn test_km1_of_toy_partition() {
        let hg = toy();
        let phg = partitioned(&hg);
        assert_eq!(crate::metrics::km1(&phg), 2);
        assert_eq!(crate::metrics::cut(&phg), 2);
    }

    #[test]
    fn test_change_node_part_respects_balance() {
        let hg = toy();
        let phg = partitioned(&hg);
        // Block 0 already carries weight 4 = max.
        assert!(!phg.change_node_part(2, 1, 0, 4, || {}, |_, _, _, _, _| {}));
        assert!(phg.change_node_part(2, 1, 0, 5, || {}, |_, _, _, _, _| {}));
        assert_eq!(phg.part_id(2), 0);
        assert_eq!(phg.part_weight(0), 5);
        assert_eq!(phg.part_weight(1), 2);
    }

    #[test]
    fn test_attributed_delta_matches_recomputation() {
        let hg = toy();
        let phg = partitioned(&hg);
        let before = crate::metrics::km1(&phg);

        let mut delta = 0;
        phg.change_node_part(6, 1, 0, Weight::MAX, || {}, |_, we, _, pcf, pct| {
            delta += km1_delta(we, pcf, pct);
        });

        assert_eq!(crate::metrics::km1(&phg), before + delta);
    }

    #[test]
    fn test_gain_cache_agrees_with_recomputation() {
        let hg = toy();
        let mut phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 1, 0, 0, 1, 1]);
        phg.initialize_gain_cache();

        for u in hg.nodes() {
            for b in 0..2 {
                if b != phg.part_id(u) {
                    assert_eq!(phg.gain(u, b), phg.compute_gain(u, b), "node {u} to {b}");
                }
            }
        }

        // Cache stays exact across a sequence of moves.
        phg.change_node_part_with_gain_cache(6, 1, 0, Weight::MAX, || {}, |_, _, _, _, _| {});
        phg.change_node_part_with_gain_cache(2, 1, 0, Weight::MAX, || {}, |_, _, _, _, _| {});
        for u in hg.nodes() {
            for b in 0..2 {
                if b != phg.part_id(u) {
                    assert_eq!(phg.gain(u, b), phg.compute_gain(u, b), "node {u} to {b}");
                }
            }
        }
    }

    #[test]
    fn test_connectivity_set_is_never_empty() {
        let hg = toy();
        let phg = partitioned(&hg);
        for e in hg.edges() {
            assert!(phg.connectivity_set(e).count() >= 1);
        }
    }
}
