use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::context::Context;
use crate::partitioned::PartitionedHypergraph;
use crate::{BlockId, EdgeId, Gain, Weight};

pub const INVALID_SEARCH_ID: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPair {
    pub i: BlockId,
    pub j: BlockId,
}

/// State of one quotient-graph edge (unordered block pair i < j): its cut
/// hyperedges, the accumulated cut weight, the owning search and the
/// improvement history used by the scheduler.
pub struct QuotientGraphEdge {
    pub cut_hes: Mutex<Vec<EdgeId>>,
    pub cut_he_weight: AtomicI64,
    ownership: AtomicU32,
    is_in_queue: AtomicBool,
    pub num_improvements_found: AtomicU32,
    pub total_improvement: AtomicI64,
}

impl QuotientGraphEdge {
    fn new() -> Self {
        QuotientGraphEdge {
            cut_hes: Mutex::new(Vec::new()),
            cut_he_weight: AtomicI64::new(0),
            ownership: AtomicU32::new(INVALID_SEARCH_ID),
            is_in_queue: AtomicBool::new(false),
            num_improvements_found: AtomicU32::new(0),
            total_improvement: AtomicI64::new(0),
        }
    }

    fn add_hyperedge(&self, he: EdgeId, weight: Weight) {
        self.cut_hes.lock().push(he);
        self.cut_he_weight.fetch_add(weight, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.cut_hes.lock().clear();
        self.cut_he_weight.store(0, Ordering::Relaxed);
        self.ownership.store(INVALID_SEARCH_ID, Ordering::Relaxed);
        self.is_in_queue.store(false, Ordering::Relaxed);
    }

    fn acquire(&self, search_id: u32) -> bool {
        self.ownership
            .compare_exchange(INVALID_SEARCH_ID, search_id, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    fn release(&self, search_id: u32) {
        let _ = self.ownership.compare_exchange(
            search_id,
            INVALID_SEARCH_ID,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    fn mark_as_in_queue(&self) -> bool {
        !self.is_in_queue.swap(true, Ordering::Relaxed)
    }

    fn mark_as_not_in_queue(&self) {
        self.is_in_queue.store(false, Ordering::Relaxed);
    }

    pub fn is_in_queue(&self) -> bool {
        self.is_in_queue.load(Ordering::Relaxed)
    }
}

// One scheduling round: a FIFO of unscheduled block pairs and the set of
// blocks that became active in this round.
struct SchedulingRound {
    queue: Mutex<VecDeque<BlockPair>>,
    active_blocks: Mutex<Vec<bool>>,
    remaining_blocks: AtomicUsize,
    round_improvement: AtomicI64,
}

impl SchedulingRound {
    fn new(k: usize) -> Self {
        SchedulingRound {
            queue: Mutex::new(VecDeque::new()),
            active_blocks: Mutex::new(vec![false; k]),
            remaining_blocks: AtomicUsize::new(0),
            round_improvement: AtomicI64::new(0),
        }
    }

    fn is_active(&self, block: BlockId) -> bool {
        self.active_blocks.lock()[block as usize]
    }
}

/// Tracks cut hyperedges between every block pair and schedules flow
/// searches over them in multiple rounds of active block pairs.
pub struct QuotientGraph {
    k: BlockId,
    edges: Vec<QuotientGraphEdge>,
    rounds: RwLock<Vec<Arc<SchedulingRound>>>,
    first_active_round: AtomicUsize,
    terminate: AtomicBool,
    round_lock: Mutex<()>,
    next_search_id: AtomicU32,
    num_active_searches: AtomicUsize,
    min_improvement_per_round: Gain,
    is_input_hypergraph: bool,
    skip_small_cuts: bool,
    skip_unpromising_blocks: bool,
}

impl QuotientGraph {
    pub fn new(ctx: &Context, initial_objective: Gain, is_input_hypergraph: bool) -> Self {
        let k = ctx.k;
        let num_pairs = (k as usize * (k as usize - 1)) / 2;
        QuotientGraph {
            k,
            edges: (0..num_pairs).map(|_| QuotientGraphEdge::new()).collect(),
            rounds: RwLock::new(Vec::new()),
            first_active_round: AtomicUsize::new(0),
            terminate: AtomicBool::new(false),
            round_lock: Mutex::new(()),
            next_search_id: AtomicU32::new(0),
            num_active_searches: AtomicUsize::new(0),
            min_improvement_per_round: (ctx.refinement.flows.min_relative_improvement_per_round
                * initial_objective as f64) as Gain,
            is_input_hypergraph,
            skip_small_cuts: ctx.refinement.flows.skip_small_cuts,
            skip_unpromising_blocks: ctx.refinement.flows.skip_unpromising_blocks,
        }
    }

    fn pair_index(&self, i: BlockId, j: BlockId) -> usize {
        debug_assert!(i < j);
        let k = self.k as usize;
        let i = i as usize;
        let j = j as usize;
        // Triangular index of (i, j) with i < j.
        i * k - (i * (i + 1)) / 2 + (j - i - 1)
    }

    pub fn edge(&self, i: BlockId, j: BlockId) -> &QuotientGraphEdge {
        &self.edges[self.pair_index(i, j)]
    }

    /// Collects all cut hyperedges and seeds round 1 with every active
    /// block pair, most promising first.
    pub fn initialize(&self, phg: &PartitionedHypergraph) {
        for edge in &self.edges {
            edge.reset();
        }
        self.first_active_round.store(0, Ordering::Relaxed);
        self.terminate.store(false, Ordering::Relaxed);
        self.rounds.write().clear();

        let hg = phg.hypergraph();
        for he in hg.edges() {
            if phg.connectivity(he) > 1 {
                let weight = hg.edge_weight(he);
                let blocks: Vec<BlockId> = phg.connectivity_set(he).collect();
                for a in 0..blocks.len() {
                    for b in a + 1..blocks.len() {
                        self.edge(blocks[a], blocks[b]).add_hyperedge(he, weight);
                    }
                }
            }
        }

        let mut pairs = Vec::new();
        for i in 0..self.k {
            for j in i + 1..self.k {
                if self.is_active_block_pair(i, j) {
                    pairs.push(BlockPair { i, j });
                }
            }
        }
        // Most promising pairs first: by total improvement, then cut weight.
        pairs.sort_by(|lhs, rhs| {
            let l = self.edge(lhs.i, lhs.j);
            let r = self.edge(rhs.i, rhs.j);
            (
                r.total_improvement.load(Ordering::Relaxed),
                r.cut_he_weight.load(Ordering::Relaxed),
            )
                .cmp(&(
                    l.total_improvement.load(Ordering::Relaxed),
                    l.cut_he_weight.load(Ordering::Relaxed),
                ))
        });

        if !pairs.is_empty() {
            let round = Arc::new(SchedulingRound::new(self.k as usize));
            self.rounds.write().push(round);
            for pair in pairs {
                self.push_block_pair_into_round(pair, 0);
            }
        }
    }

    fn is_active_block_pair(&self, i: BlockId, j: BlockId) -> bool {
        let edge = self.edge(i, j);
        let skip_small = !self.is_input_hypergraph && self.skip_small_cuts;
        let cut_weight = edge.cut_he_weight.load(Ordering::Relaxed);
        let contains_enough_cut = if skip_small { cut_weight > 10 } else { cut_weight > 0 };
        let is_promising = !self.skip_unpromising_blocks
            || self.first_active_round.load(Ordering::Relaxed) == 0
            || edge.num_improvements_found.load(Ordering::Relaxed) > 0;
        contains_enough_cut && is_promising
    }

    fn push_block_pair_into_round(&self, pair: BlockPair, round_index: usize) -> bool {
        let edge = self.edge(pair.i, pair.j);
        if !edge.mark_as_in_queue() {
            return false;
        }
        let rounds = self.rounds.read();
        let round = &rounds[round_index];
        round.queue.lock().push_back(pair);
        round.remaining_blocks.fetch_add(1, Ordering::Relaxed);
        true
    }

    // Guarantees a successor round exists so finalize can always reschedule.
    fn ensure_round(&self, round_index: usize) {
        let _guard = self.round_lock.lock();
        let mut rounds = self.rounds.write();
        while rounds.len() <= round_index {
            rounds.push(Arc::new(SchedulingRound::new(self.k as usize)));
        }
    }

    /// Pops the next block pair to work on. Returns the search id, the pair
    /// and the round it was scheduled in.
    pub fn request_new_search(&self) -> Option<(u32, BlockPair, usize)> {
        loop {
            if self.terminate.load(Ordering::Relaxed) {
                return None;
            }
            let num_rounds = self.rounds.read().len();
            let first = self.first_active_round.load(Ordering::Relaxed);
            let mut popped: Option<(BlockPair, usize)> = None;
            for round_index in first..num_rounds {
                let round = self.rounds.read()[round_index].clone();
                let pair = round.queue.lock().pop_front();
                if let Some(pair) = pair {
                    self.edge(pair.i, pair.j).mark_as_not_in_queue();
                    popped = Some((pair, round_index));
                    break;
                }
            }

            let Some((pair, round_index)) = popped else {
                // Nothing queued anywhere: the schedule is drained when no
                // search is still running that could reactivate blocks.
                if self.num_active_searches.load(Ordering::Relaxed) == 0 {
                    return None;
                }
                std::thread::yield_now();
                continue;
            };

            // There must always be a next round available for rescheduling.
            self.ensure_round(round_index + 1);

            let search_id = self.next_search_id.fetch_add(1, Ordering::Relaxed);
            if self.edge(pair.i, pair.j).acquire(search_id) {
                self.num_active_searches.fetch_add(1, Ordering::Relaxed);
                return Some((search_id, pair, round_index));
            }
            // Pair is owned by a running search; account the pop as a
            // finished no-op so the round can still close.
            self.finalize_without_search(pair, round_index);
        }
    }

    fn finalize_without_search(&self, pair: BlockPair, round_index: usize) {
        self.finalize_round_state(pair, round_index, 0);
    }

    /// Registers the outcome of a search on a block pair and performs the
    /// active-block rescheduling.
    pub fn finalize_search(&self, search_id: u32, pair: BlockPair, round_index: usize, improvement: Gain) {
        let edge = self.edge(pair.i, pair.j);
        if improvement > 0 {
            edge.num_improvements_found.fetch_add(1, Ordering::Relaxed);
            edge.total_improvement.fetch_add(improvement, Ordering::Relaxed);
        }
        edge.release(search_id);
        self.finalize_round_state(pair, round_index, improvement);
        self.num_active_searches.fetch_sub(1, Ordering::Relaxed);
    }

    fn finalize_round_state(&self, pair: BlockPair, round_index: usize, improvement: Gain) {
        let round = self.rounds.read()[round_index].clone();
        round.round_improvement.fetch_add(improvement, Ordering::Relaxed);

        let mut block_i_becomes_active = false;
        let mut block_j_becomes_active = false;
        if improvement > 0 {
            let mut active = round.active_blocks.lock();
            block_i_becomes_active = !active[pair.i as usize];
            block_j_becomes_active = !active[pair.j as usize];
            active[pair.i as usize] = true;
            active[pair.j as usize] = true;
        }

        if block_i_becomes_active || block_j_becomes_active {
            self.ensure_round(round_index + 1);
        }
        for (becomes_active, block) in
            [(block_i_becomes_active, pair.i), (block_j_becomes_active, pair.j)]
        {
            if becomes_active {
                // All pairs incident to a newly active block move into the
                // next round.
                for other in 0..self.k {
                    if other == block {
                        continue;
                    }
                    let (i, j) = (block.min(other), block.max(other));
                    if self.is_active_block_pair(i, j) {
                        self.push_block_pair_into_round(BlockPair { i, j }, round_index + 1);
                    }
                }
            }
        }

        // Special case: the pair improved while one of its blocks was
        // already active in this round, but the pair itself is not queued
        // for the next round (it sat in an earlier queue when the block
        // became active). Reschedule it explicitly.
        if improvement > 0
            && !self.edge(pair.i, pair.j).is_in_queue()
            && self.is_active_block_pair(pair.i, pair.j)
            && (round.is_active(pair.i) || round.is_active(pair.j))
        {
            self.ensure_round(round_index + 1);
            self.push_block_pair_into_round(pair, round_index + 1);
        }

        round.remaining_blocks.fetch_sub(1, Ordering::Relaxed);

        // Close finished rounds in order; a too-small round improvement
        // terminates the whole schedule.
        if round_index == self.first_active_round.load(Ordering::Relaxed)
            && round.remaining_blocks.load(Ordering::Relaxed) == 0
        {
            let _guard = self.round_lock.lock();
            loop {
                let first = self.first_active_round.load(Ordering::Relaxed);
                let rounds = self.rounds.read();
                if first >= rounds.len()
                    || rounds[first].remaining_blocks.load(Ordering::Relaxed) != 0
                {
                    break;
                }
                let round_improvement = rounds[first].round_improvement.load(Ordering::Relaxed);
                debug!(round = first, round_improvement, "flow scheduling round closed");
                if round_improvement < self.min_improvement_per_round {
                    self.terminate.store(true, Ordering::Relaxed);
                }
                drop(rounds);
                self.first_active_round.store(first + 1, Ordering::Relaxed);
            }
        }
    }

    pub fn num_block_pairs(&self) -> usize {
        self.edges.len()
    }

    /// Registers a hyperedge that newly entered the cut between `block` and
    /// the other blocks it touches, so later searches see it.
    pub fn add_new_cut_hyperedge(
        &self,
        phg: &PartitionedHypergraph,
        he: EdgeId,
        block: BlockId,
    ) {
        let weight = phg.hypergraph().edge_weight(he);
        for other in phg.connectivity_set(he) {
            if other != block {
                self.edge(block.min(other), block.max(other)).add_hyperedge(he, weight);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, FlowAlgorithm, Preset};
    use crate::hypergraph::Hypergraph;

    fn flow_context(k: i32) -> Context {
        let mut ctx = Context::from_preset(Preset::Speed, k, 0.03);
        ctx.refinement.flows.algorithm = FlowAlgorithm::FlowCut;
        ctx.refinement.flows.skip_small_cuts = false;
        ctx
    }

    fn toy_partitioned<'a>(hg: &'a Hypergraph, k: i32, partition: &[BlockId]) -> PartitionedHypergraph<'a> {
        let phg = PartitionedHypergraph::new(hg, k);
        phg.apply_partition(partition);
        phg
    }

    #[test]
    fn test_initialize_collects_cut_edges() {
        let hg = Hypergraph::new(
            7,
            vec![vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
            None,
            None,
        )
        .unwrap();
        let ctx = flow_context(2);
        let phg = toy_partitioned(&hg, 2, &[0, 0, 1, 0, 0, 1, 1]);

        let qg = QuotientGraph::new(&ctx, 2, true);
        qg.initialize(&phg);

        let edge = qg.edge(0, 1);
        let mut cut = edge.cut_hes.lock().clone();
        cut.sort_unstable();
        assert_eq!(cut, vec![0, 2]);
        assert_eq!(edge.cut_he_weight.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_search_lifecycle() {
        let hg = Hypergraph::new(
            7,
            vec![vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
            None,
            None,
        )
        .unwrap();
        let ctx = flow_context(2);
        let phg = toy_partitioned(&hg, 2, &[0, 0, 1, 0, 0, 1, 1]);

        let qg = QuotientGraph::new(&ctx, 2, true);
        qg.initialize(&phg);

        let (sid, pair, round) = qg.request_new_search().expect("one pair must be scheduled");
        assert_eq!(pair, BlockPair { i: 0, j: 1 });
        assert_eq!(round, 0);

        // No improvement: the schedule drains and terminates.
        qg.finalize_search(sid, pair, round, 0);
        assert!(qg.request_new_search().is_none());
    }

    #[test]
    fn test_improvement_reschedules_pair() {
        // Invariant: a round with enough improvement has a non-empty
        // successor round.
        let hg = Hypergraph::new(
            7,
            vec![vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
            None,
            None,
        )
        .unwrap();
        let ctx = flow_context(2);
        let phg = toy_partitioned(&hg, 2, &[0, 0, 1, 0, 0, 1, 1]);

        let qg = QuotientGraph::new(&ctx, 2, true);
        qg.initialize(&phg);

        let (sid, pair, round) = qg.request_new_search().unwrap();
        qg.finalize_search(sid, pair, round, 5);

        // Both blocks became active, so (0, 1) must be scheduled again in
        // round 2.
        let (sid2, pair2, round2) = qg.request_new_search().expect("pair must be rescheduled");
        assert_eq!(pair2, pair);
        assert_eq!(round2, 1);
        qg.finalize_search(sid2, pair2, round2, 0);
        assert!(qg.request_new_search().is_none());
    }

    #[test]
    fn test_special_case_requeue_when_blocks_already_active() {
        // Three blocks, all three pairs cut. While (1,2) still sits in the
        // round-1 queue, improvements on (0,2) and (0,1) activate all three
        // blocks; the activation pushes fail because (1,2) is still queued.
        // When (1,2) is finally popped and improves, no block becomes newly
        // active, so only the special-case reschedule can carry it into the
        // next round.
        let hg = Hypergraph::new(
            6,
            vec![vec![0, 1], vec![2, 3], vec![4, 5], vec![0, 2], vec![2, 4], vec![0, 4]],
            None,
            None,
        )
        .unwrap();
        let ctx = flow_context(3);
        let phg = toy_partitioned(&hg, 3, &[0, 0, 1, 1, 2, 2]);

        let qg = QuotientGraph::new(&ctx, 2, true);
        qg.initialize(&phg);

        // Pop (0,1) and (0,2); (1,2) stays queued in round 1.
        let (sid_a, pair_a, round_a) = qg.request_new_search().unwrap();
        let (sid_b, pair_b, round_b) = qg.request_new_search().unwrap();
        assert_eq!((pair_a, pair_b), (BlockPair { i: 0, j: 1 }, BlockPair { i: 0, j: 2 }));

        qg.finalize_search(sid_b, pair_b, round_b, 3);
        qg.finalize_search(sid_a, pair_a, round_a, 2);

        let (sid_c, pair_c, round_c) = qg.request_new_search().unwrap();
        assert_eq!(pair_c, BlockPair { i: 1, j: 2 });
        assert_eq!(round_c, 0);

        // All blocks are already active: a normal activation cannot requeue
        // the pair, the special case must.
        qg.finalize_search(sid_c, pair_c, round_c, 1);
        assert!(
            qg.edge(1, 2).is_in_queue(),
            "special case requeue did not happen"
        );
    }
}
