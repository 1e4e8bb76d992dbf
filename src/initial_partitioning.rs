use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use std::collections::VecDeque;
use tracing::debug;

use crate::context::Context;
use crate::hypergraph::Hypergraph;
use crate::metrics;
use crate::partitioned::PartitionedHypergraph;
use crate::refinement::{label_propagation, two_way_fm};
use crate::{BlockId, NodeId, Weight, INVALID_BLOCK};

/// Flat partitioners raced against each other on the coarsest hypergraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatAlgorithm {
    Random,
    Bfs,
    Greedy,
    LabelPropagation,
}

pub const FLAT_ALGORITHMS: [FlatAlgorithm; 4] = [
    FlatAlgorithm::Random,
    FlatAlgorithm::Bfs,
    FlatAlgorithm::Greedy,
    FlatAlgorithm::LabelPropagation,
];

/// Quality of one flat partitioning run. The tags only matter in
/// deterministic mode, where they break exact ties in a reproducible way.
#[derive(Debug, Clone)]
pub struct PartitioningResult {
    pub algorithm: FlatAlgorithm,
    pub objective: Weight,
    pub imbalance: f64,
    pub random_tag: u64,
    pub deterministic_tag: u64,
}

impl PartitioningResult {
    fn sentinel() -> Self {
        PartitioningResult {
            algorithm: FlatAlgorithm::Random,
            objective: Weight::MAX,
            imbalance: f64::MAX,
            random_tag: u64::MAX,
            deterministic_tag: u64::MAX,
        }
    }

    fn is_sentinel(&self) -> bool {
        self.objective == Weight::MAX
    }

    /// True iff `other` is a better partition than `self`.
    pub fn is_other_better(&self, other: &Self, epsilon: f64) -> bool {
        let equal_metric = other.objective == self.objective;
        let improved_metric = other.objective < self.objective;
        let improved_imbalance = other.imbalance < self.imbalance;
        let is_feasible = self.imbalance <= epsilon;
        let is_other_feasible = other.imbalance <= epsilon;
        (improved_metric && (is_other_feasible || improved_imbalance))
            || (equal_metric && improved_imbalance)
            || (is_other_feasible && !is_feasible)
            || (improved_imbalance && !is_other_feasible && !is_feasible)
            || (equal_metric
                && self.imbalance == other.imbalance
                && (other.random_tag, other.deterministic_tag)
                    < (self.random_tag, self.deterministic_tag))
    }
}

// Bounded population of the best partitions seen so far, kept as a binary
// heap with the worst member at the root. Replacement happens under a
// single lock.
struct Population {
    epsilon: f64,
    entries: Mutex<Vec<(PartitioningResult, Vec<BlockId>)>>,
}

impl Population {
    fn new(capacity: usize, epsilon: f64, num_nodes: usize) -> Self {
        let entries = (0..capacity)
            .map(|_| (PartitioningResult::sentinel(), vec![INVALID_BLOCK; num_nodes]))
            .collect();
        Population { epsilon, entries: Mutex::new(entries) }
    }

    fn maybe_insert(&self, result: PartitioningResult, partition: impl FnOnce() -> Vec<BlockId>) {
        // Cheap pre-check without the partition copy.
        {
            let entries = self.entries.lock();
            if !entries[0].0.is_other_better(&result, self.epsilon) {
                return;
            }
        }
        let partition = partition();
        let mut entries = self.entries.lock();
        if entries[0].0.is_other_better(&result, self.epsilon) {
            entries[0] = (result, partition);
            self.sift_down(&mut entries, 0);
        }
    }

    // Restores worst-at-root: a parent must not be better than its children.
    fn sift_down(&self, entries: &mut [(PartitioningResult, Vec<BlockId>)], mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut worst = pos;
            if left < entries.len() && entries[worst].0.is_other_better(&entries[left].0, self.epsilon)
            {
                worst = left;
            }
            if right < entries.len()
                && entries[worst].0.is_other_better(&entries[right].0, self.epsilon)
            {
                worst = right;
            }
            if worst == pos {
                break;
            }
            entries.swap(pos, worst);
            pos = worst;
        }
    }

    fn into_members(self) -> Vec<(PartitioningResult, Vec<BlockId>)> {
        self.entries
            .into_inner()
            .into_iter()
            .filter(|(result, _)| !result.is_sentinel())
            .collect()
    }
}

// Running mean and standard deviation (Welford) of the quality produced by
// one flat algorithm, plus the best feasible objective over all algorithms.
struct RunStats {
    n: usize,
    mean: f64,
    sum_of_squares: f64,
}

impl RunStats {
    fn add(&mut self, quality: f64) {
        self.n += 1;
        let old_mean = self.mean;
        self.mean += (quality - old_mean) / self.n as f64;
        self.sum_of_squares += (quality - old_mean) * (quality - self.mean);
    }

    fn stddev(&self) -> f64 {
        if self.n <= 1 {
            0.0
        } else {
            (self.sum_of_squares / (self.n - 1) as f64).sqrt()
        }
    }
}

struct GlobalStats {
    inner: Mutex<(Vec<RunStats>, Weight)>,
}

impl GlobalStats {
    fn new() -> Self {
        let stats = FLAT_ALGORITHMS
            .iter()
            .map(|_| RunStats { n: 0, mean: 0.0, sum_of_squares: 0.0 })
            .collect();
        GlobalStats { inner: Mutex::new((stats, Weight::MAX)) }
    }

    fn add_run(&self, algorithm: FlatAlgorithm, quality: Weight, feasible: bool) {
        let mut inner = self.inner.lock();
        inner.0[algorithm as usize].add(quality as f64);
        if feasible && quality < inner.1 {
            inner.1 = quality;
        }
    }

    // An algorithm whose quality distribution sits more than two standard
    // deviations above the best feasible result is unlikely to produce a
    // new best partition; skip further runs of it.
    fn should_run(&self, algorithm: FlatAlgorithm, ctx: &Context) -> bool {
        if ctx.deterministic || !ctx.initial_partitioning.use_adaptive_ip_runs {
            return true;
        }
        let inner = self.inner.lock();
        let stats = &inner.0[algorithm as usize];
        stats.n < ctx.initial_partitioning.min_adaptive_ip_runs
            || stats.mean - 2.0 * stats.stddev() <= inner.1 as f64
    }
}

/// Races the flat partitioners on the coarsest hypergraph, keeps a
/// population of the best results, refines each population member and
/// returns the winner.
pub fn partition_coarsest(hg: &Hypergraph, ctx: &Context) -> Vec<BlockId> {
    let n = hg.initial_num_nodes();
    let k = ctx.k;
    let max_part_weight = ctx.max_part_weight(hg.total_weight());
    let max_part_weights = vec![max_part_weight; k as usize];

    let capacity = ctx
        .initial_partitioning
        .population_size
        .min(ctx.num_threads.max(1))
        .max(1);
    let population = Population::new(capacity, ctx.epsilon, n);
    let stats = GlobalStats::new();

    let runs = ctx.initial_partitioning.runs.max(1);
    let tasks: Vec<(FlatAlgorithm, usize)> = FLAT_ALGORITHMS
        .iter()
        .flat_map(|&algo| (0..runs).map(move |run| (algo, run)))
        .collect();

    tasks.par_iter().enumerate().for_each_init(
        || PartitionedHypergraph::new(hg, k),
        |phg, (task_index, &(algorithm, _run))| {
            if !stats.should_run(algorithm, ctx) {
                return;
            }
            let mut rng = SmallRng::seed_from_u64(mix_seed(ctx.seed, task_index as u64));
            phg.reset_partition();
            run_flat(algorithm, phg, ctx, &max_part_weights, &mut rng);
            refine_flat(phg, ctx, &max_part_weights);

            let objective = metrics::objective(phg, ctx.objective);
            let imbalance = metrics::imbalance_of(phg);
            let result = PartitioningResult {
                algorithm,
                objective,
                imbalance,
                random_tag: if ctx.deterministic { rng.gen() } else { u64::MAX },
                deterministic_tag: if ctx.deterministic { task_index as u64 } else { u64::MAX },
            };
            stats.add_run(algorithm, objective, imbalance <= ctx.epsilon);
            population.maybe_insert(result, || {
                let mut partition = vec![INVALID_BLOCK; n];
                phg.extract_partition(&mut partition);
                partition
            });
        },
    );

    let mut members = population.into_members();
    debug_assert!(!members.is_empty());

    // Every population member gets a final refinement pass.
    if ctx.initial_partitioning.perform_refinement_on_best_partitions {
        members.par_iter_mut().for_each_init(
            || PartitionedHypergraph::new(hg, k),
            |phg, (result, partition)| {
                phg.reset_partition();
                phg.apply_partition(partition);
                refine_flat(phg, ctx, &max_part_weights);
                let refined = PartitioningResult {
                    algorithm: result.algorithm,
                    objective: metrics::objective(phg, ctx.objective),
                    imbalance: metrics::imbalance_of(phg),
                    random_tag: result.random_tag,
                    deterministic_tag: result.deterministic_tag,
                };
                if result.is_other_better(&refined, ctx.epsilon) {
                    phg.extract_partition(partition);
                    *result = refined;
                }
            },
        );
    }

    // Deterministic winner selection: order members by their tags first.
    if ctx.deterministic {
        members.sort_by_key(|(result, _)| result.deterministic_tag);
    }
    let mut best = 0;
    for i in 1..members.len() {
        if members[best].0.is_other_better(&members[i].0, ctx.epsilon) {
            best = i;
        }
    }
    debug!(
        objective = members[best].0.objective,
        imbalance = members[best].0.imbalance,
        "initial partitioning winner"
    );
    members.swap_remove(best).1
}

fn refine_flat(phg: &PartitionedHypergraph, ctx: &Context, max_part_weights: &[Weight]) {
    if phg.k() == 2 {
        two_way_fm::refine(phg, max_part_weights, ctx.initial_partitioning.fm_refinement_rounds);
    } else {
        label_propagation::refine(phg, ctx, max_part_weights, true);
    }
}

fn run_flat(
    algorithm: FlatAlgorithm,
    phg: &PartitionedHypergraph,
    ctx: &Context,
    max_part_weights: &[Weight],
    rng: &mut SmallRng,
) {
    match algorithm {
        FlatAlgorithm::Random => run_random(phg, max_part_weights, rng),
        FlatAlgorithm::Bfs => run_bfs(phg, max_part_weights, rng),
        FlatAlgorithm::Greedy => run_greedy(phg, max_part_weights, rng),
        FlatAlgorithm::LabelPropagation => run_label_propagation(phg, ctx, max_part_weights, rng),
    }
    fill_unassigned(phg, max_part_weights);
}

fn fits(phg: &PartitionedHypergraph, u: NodeId, b: BlockId, max_part_weights: &[Weight]) -> bool {
    phg.part_weight(b) + phg.hypergraph().node_weight(u) <= max_part_weights[b as usize]
}

// Leftovers go to the lightest block.
fn fill_unassigned(phg: &PartitionedHypergraph, max_part_weights: &[Weight]) {
    for u in phg.hypergraph().nodes() {
        if phg.part_id(u) == INVALID_BLOCK {
            let b = label_propagation::assign_unassigned_vertex(phg, u, max_part_weights);
            phg.set_node_part(u, b);
        }
    }
}

fn run_random(phg: &PartitionedHypergraph, max_part_weights: &[Weight], rng: &mut SmallRng) {
    let k = phg.k();
    let mut nodes: Vec<NodeId> = phg.hypergraph().nodes().collect();
    nodes.shuffle(rng);
    for u in nodes {
        let b = rng.gen_range(0..k);
        if fits(phg, u, b, max_part_weights) {
            phg.set_node_part(u, b);
        }
        // Nodes that do not fit are handled by fill_unassigned.
    }
}

// Greedy round-robin BFS growing: every block grows from a random seed in
// breadth-first order; blocks take turns claiming one vertex at a time.
fn run_bfs(phg: &PartitionedHypergraph, max_part_weights: &[Weight], rng: &mut SmallRng) {
    let hg = phg.hypergraph();
    let k = phg.k() as usize;
    let mut pool: Vec<NodeId> = hg.nodes().collect();
    pool.shuffle(rng);
    let mut pool_pos = 0;
    let mut queues: Vec<VecDeque<NodeId>> = vec![VecDeque::new(); k];

    let total = hg.current_num_nodes();
    let mut assigned = 0;
    while assigned < total {
        let mut progress = false;
        for b in 0..k {
            let mut claimed = None;
            while let Some(u) = queues[b].pop_front() {
                if phg.part_id(u) == INVALID_BLOCK && fits(phg, u, b as BlockId, max_part_weights) {
                    claimed = Some(u);
                    break;
                }
            }
            if claimed.is_none() {
                // Empty or exhausted queue: restart from the pool.
                while pool_pos < pool.len() {
                    let u = pool[pool_pos];
                    pool_pos += 1;
                    if phg.part_id(u) == INVALID_BLOCK && fits(phg, u, b as BlockId, max_part_weights)
                    {
                        claimed = Some(u);
                        break;
                    }
                }
            }
            if let Some(u) = claimed {
                phg.set_node_part(u, b as BlockId);
                assigned += 1;
                progress = true;
                for e in hg.incident_edges(u) {
                    for &p in hg.pins(e) {
                        if phg.part_id(p) == INVALID_BLOCK {
                            queues[b].push_back(p);
                        }
                    }
                }
            }
        }
        if !progress {
            break;
        }
    }
}

// Greedy hypergraph growing: like BFS, but every block claims the vertex it
// is most attracted to (sum of weights of incident nets already touching
// the block), with stale priorities refreshed on extraction.
fn run_greedy(phg: &PartitionedHypergraph, max_part_weights: &[Weight], rng: &mut SmallRng) {
    use crate::refinement::pq::IndexedMaxHeap;

    let hg = phg.hypergraph();
    let k = phg.k() as usize;
    let mut pool: Vec<NodeId> = hg.nodes().collect();
    pool.shuffle(rng);
    let mut pool_pos = 0;
    let mut pqs: Vec<IndexedMaxHeap> = (0..k).map(|_| IndexedMaxHeap::new()).collect();

    let attraction = |u: NodeId, b: BlockId| -> Weight {
        hg.incident_edges(u)
            .filter(|&e| phg.pin_count_in_part(e, b) > 0)
            .map(|e| hg.edge_weight(e))
            .sum()
    };

    let total = hg.current_num_nodes();
    let mut assigned = 0;
    while assigned < total {
        let mut progress = false;
        for b in 0..k {
            let mut claimed = None;
            while let Some((u, gain)) = pqs[b].pop() {
                if phg.part_id(u) != INVALID_BLOCK {
                    continue;
                }
                let fresh = attraction(u, b as BlockId);
                if fresh != gain {
                    pqs[b].push(u, fresh);
                    continue;
                }
                if fits(phg, u, b as BlockId, max_part_weights) {
                    claimed = Some(u);
                    break;
                }
            }
            if claimed.is_none() {
                while pool_pos < pool.len() {
                    let u = pool[pool_pos];
                    pool_pos += 1;
                    if phg.part_id(u) == INVALID_BLOCK && fits(phg, u, b as BlockId, max_part_weights)
                    {
                        claimed = Some(u);
                        break;
                    }
                }
            }
            if let Some(u) = claimed {
                phg.set_node_part(u, b as BlockId);
                assigned += 1;
                progress = true;
                for e in hg.incident_edges(u) {
                    for &p in hg.pins(e) {
                        if phg.part_id(p) == INVALID_BLOCK && !pqs[b].contains(p) {
                            pqs[b].push(p, attraction(p, b as BlockId));
                        }
                    }
                }
            }
        }
        if !progress {
            break;
        }
    }
}

// Label-propagation initial partitioning: random seeds, then rounds in
// which unassigned vertices join their most attractive block and assigned
// vertices take their best positive-gain move.
fn run_label_propagation(
    phg: &PartitionedHypergraph,
    ctx: &Context,
    max_part_weights: &[Weight],
    rng: &mut SmallRng,
) {
    let hg = phg.hypergraph();
    let k = phg.k();
    let mut nodes: Vec<NodeId> = hg.nodes().collect();
    nodes.shuffle(rng);

    for (b, &seed) in nodes.iter().take(k as usize).enumerate() {
        phg.set_node_part(seed, b as BlockId);
    }

    for _ in 0..ctx.refinement.label_propagation.maximum_iterations {
        let mut moved = 0;
        for &u in &nodes {
            if phg.part_id(u) == INVALID_BLOCK {
                let b = label_propagation::assign_unassigned_vertex(phg, u, max_part_weights);
                phg.set_node_part(u, b);
                moved += 1;
            } else {
                let from = phg.part_id(u);
                let mut best_to = from;
                let mut best_gain = 0;
                for to in 0..k {
                    if to == from || !fits(phg, u, to, max_part_weights) {
                        continue;
                    }
                    let gain = phg.compute_gain(u, to);
                    if gain > best_gain {
                        best_gain = gain;
                        best_to = to;
                    }
                }
                if best_to != from
                    && phg.change_node_part(
                        u,
                        from,
                        best_to,
                        max_part_weights[best_to as usize],
                        || {},
                        |_, _, _, _, _| {},
                    )
                {
                    moved += 1;
                }
            }
        }
        if moved == 0 {
            break;
        }
    }
}

fn mix_seed(seed: u64, index: u64) -> u64 {
    // splitmix64 step
    let mut z = seed.wrapping_add(index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, Preset};
    use crate::metrics::km1;

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
    fn test_toy_bisection_reaches_optimum() {
        let hg = toy();
        let mut ctx = Context::from_preset(Preset::Speed, 2, 0.03);
        ctx.initial_partitioning.runs = 10;
        ctx.initial_partitioning.fm_refinement_rounds = 10;
        ctx.seed = 7;

        let partition = partition_coarsest(&hg, &ctx);
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&partition);

        assert_eq!(km1(&phg), 2);
        assert!(phg.part_weight(0) <= 4);
        assert!(phg.part_weight(1) <= 4);
    }

    #[test]
    fn test_all_flat_algorithms_produce_complete_partitions() {
        let hg = toy();
        let ctx = Context::from_preset(Preset::Speed, 4, 0.1);
        let max_part_weights = vec![ctx.max_part_weight(hg.total_weight()); 4];

        for (i, &algo) in FLAT_ALGORITHMS.iter().enumerate() {
            let phg = PartitionedHypergraph::new(&hg, 4);
            let mut rng = SmallRng::seed_from_u64(i as u64);
            run_flat(algo, &phg, &ctx, &max_part_weights, &mut rng);
            for u in hg.nodes() {
                assert_ne!(phg.part_id(u), INVALID_BLOCK, "{algo:?} left vertex {u} unassigned");
            }
        }
    }

    #[test]
    fn test_selection_rule_prefers_feasible() {
        let feasible = PartitioningResult {
            algorithm: FlatAlgorithm::Random,
            objective: 10,
            imbalance: 0.02,
            random_tag: u64::MAX,
            deterministic_tag: u64::MAX,
        };
        let infeasible = PartitioningResult {
            algorithm: FlatAlgorithm::Bfs,
            objective: 5,
            imbalance: 0.5,
            random_tag: u64::MAX,
            deterministic_tag: u64::MAX,
        };
        assert!(infeasible.is_other_better(&feasible, 0.03));
        assert!(!feasible.is_other_better(&infeasible, 0.03));
    }

    #[test]
    fn test_selection_rule_is_antisymmetric() {
        // Invariant: is_other_better(a, b) and is_other_better(b, a) never
        // both hold.
        let mut rng = SmallRng::seed_from_u64(99);
        let sample = |rng: &mut SmallRng| PartitioningResult {
            algorithm: FlatAlgorithm::Random,
            objective: rng.gen_range(0..4),
            imbalance: [0.0, 0.02, 0.1][rng.gen_range(0..3)],
            random_tag: rng.gen_range(0..3),
            deterministic_tag: rng.gen_range(0..3),
        };
        for _ in 0..1000 {
            let a = sample(&mut rng);
            let b = sample(&mut rng);
            assert!(
                !(a.is_other_better(&b, 0.03) && b.is_other_better(&a, 0.03)),
                "both directions better: {a:?} vs {b:?}"
            );
        }
    }

    #[test]
    fn test_deterministic_initial_partitioning_is_reproducible() {
        let hg = toy();
        let mut ctx = Context::from_preset(Preset::Deterministic, 2, 0.03);
        ctx.seed = 3;
        ctx.initial_partitioning.runs = 4;

        let a = partition_coarsest(&hg, &ctx);
        let b = partition_coarsest(&hg, &ctx);
        assert_eq!(a, b);
    }
}
