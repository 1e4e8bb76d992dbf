use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::context::{Context, FlowAlgorithm};
use crate::partitioned::{km1_delta, PartitionedHypergraph};
use crate::refinement::max_flow::{FlowNetwork, INF};
use crate::refinement::quotient::{BlockPair, QuotientGraph};
use crate::{BlockId, EdgeId, Gain, NodeId, Weight};

// Average running time of completed searches; feeds the per-search time
// limit. Searches that hit their limit do not contribute.
struct SearchTimer {
    inner: Mutex<(f64, u64)>,
}

impl SearchTimer {
    fn new() -> Self {
        SearchTimer { inner: Mutex::new((0.0, 0)) }
    }

    fn limit(&self, factor: f64) -> Option<Duration> {
        let (average, n) = *self.inner.lock();
        if n == 0 {
            None
        } else {
            Some(Duration::from_secs_f64((factor * average).max(0.001)))
        }
    }

    fn record(&self, elapsed: Duration) {
        let mut inner = self.inner.lock();
        let (average, n) = *inner;
        *inner = (
            (elapsed.as_secs_f64() + n as f64 * average) / (n + 1) as f64,
            n + 1,
        );
    }
}

/// Flow-based refinement: pairs of adjacent blocks are scheduled through
/// the quotient graph; each search extracts a region around the cut, solves
/// a max-flow problem on its Lawler expansion and applies the resulting
/// move sequence if it improves the partition.
pub fn refine(
    phg: &PartitionedHypergraph,
    ctx: &Context,
    max_part_weights: &[Weight],
    is_input_hypergraph: bool,
    deadline: Option<Instant>,
) -> Gain {
    if ctx.refinement.flows.algorithm != FlowAlgorithm::FlowCut || phg.k() < 2 {
        return 0;
    }
    let initial_objective = crate::metrics::km1(phg);
    let qg = QuotientGraph::new(ctx, initial_objective, is_input_hypergraph);
    qg.initialize(phg);

    let num_workers = if ctx.deterministic {
        1
    } else {
        ((ctx.refinement.flows.parallel_searches_multiplier * ctx.num_threads as f64).ceil()
            as usize)
            .clamp(1, qg.num_block_pairs().max(1))
    };

    let total = AtomicI64::new(0);
    let timer = SearchTimer::new();
    let qg_ref = &qg;
    let timer_ref = &timer;
    let total_ref = &total;

    rayon::scope(|scope| {
        for _ in 0..num_workers {
            scope.spawn(|_| loop {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    break;
                }
                let Some((search_id, pair, round)) = qg_ref.request_new_search() else {
                    break;
                };
                let improvement =
                    flow_search(phg, ctx, qg_ref, pair, timer_ref, max_part_weights, deadline);
                total_ref.fetch_add(improvement, Ordering::Relaxed);
                qg_ref.finalize_search(search_id, pair, round, improvement);
            });
        }
    });

    let total = total.load(Ordering::Relaxed);
    debug!(total, "flow refinement finished");
    total
}

fn flow_search(
    phg: &PartitionedHypergraph,
    ctx: &Context,
    qg: &QuotientGraph,
    pair: BlockPair,
    timer: &SearchTimer,
    max_part_weights: &[Weight],
    global_deadline: Option<Instant>,
) -> Gain {
    let start = Instant::now();
    let local_deadline = timer
        .limit(ctx.refinement.flows.time_limit_factor)
        .map(|limit| start + limit);
    let deadline = match (local_deadline, global_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };

    // Cut hyperedges may be stale after earlier searches.
    let mut cut_hes: Vec<EdgeId> = qg
        .edge(pair.i, pair.j)
        .cut_hes
        .lock()
        .iter()
        .copied()
        .filter(|&e| {
            phg.hypergraph().edge_is_enabled(e)
                && phg.pin_count_in_part(e, pair.i) > 0
                && phg.pin_count_in_part(e, pair.j) > 0
        })
        .collect();
    cut_hes.sort_unstable();
    cut_hes.dedup();
    if cut_hes.is_empty() {
        return 0;
    }

    let hg = phg.hypergraph();
    let total_weight = hg.total_weight();
    let perfect = ctx.perfect_part_weight(total_weight);
    let scaled = ((1.0 + ctx.refinement.flows.alpha * ctx.epsilon) * perfect as f64) as Weight;
    let cap_i = scaled - phg.part_weight(pair.j);
    let cap_j = scaled - phg.part_weight(pair.i);

    let region_i = grow_region(phg, ctx, &cut_hes, pair.i, cap_i);
    let region_j = grow_region(phg, ctx, &cut_hes, pair.j, cap_j);
    if region_i.is_empty() && region_j.is_empty() {
        return 0;
    }

    let Some(sequence) = solve_region(
        phg,
        ctx,
        pair,
        &region_i,
        &region_j,
        max_part_weights,
        deadline,
    ) else {
        // Timed out: do not pollute the running-time average.
        return 0;
    };

    let improvement = apply_move_sequence(phg, qg, pair, &sequence, max_part_weights);
    timer.record(start.elapsed());
    improvement
}

// Breadth-first region around the cut inside one block, bounded by the
// bfs distance, the pin budget and the weight cap.
fn grow_region(
    phg: &PartitionedHypergraph,
    ctx: &Context,
    cut_hes: &[EdgeId],
    block: BlockId,
    weight_cap: Weight,
) -> Vec<NodeId> {
    if weight_cap <= 0 {
        return Vec::new();
    }
    let hg = phg.hypergraph();
    let mut region: Vec<NodeId> = Vec::new();
    let mut in_region: FxHashSet<NodeId> = FxHashSet::default();
    let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
    let mut weight = 0;
    let mut visited_pins = 0usize;

    let try_add = |u: NodeId,
                       distance: usize,
                       region: &mut Vec<NodeId>,
                       in_region: &mut FxHashSet<NodeId>,
                       queue: &mut VecDeque<(NodeId, usize)>,
                       weight: &mut Weight|
     -> bool {
        if phg.part_id(u) != block || in_region.contains(&u) {
            return true;
        }
        if *weight + hg.node_weight(u) > weight_cap {
            return false;
        }
        *weight += hg.node_weight(u);
        in_region.insert(u);
        region.push(u);
        queue.push_back((u, distance));
        true
    };

    let mut capped = false;
    'grow: for &e in cut_hes {
        for &p in hg.pins(e) {
            if !try_add(p, 0, &mut region, &mut in_region, &mut queue, &mut weight) {
                capped = true;
                break 'grow;
            }
        }
    }

    if !capped {
        'bfs: while let Some((u, distance)) = queue.pop_front() {
            if distance >= ctx.refinement.flows.max_bfs_distance {
                continue;
            }
            for e in hg.incident_edges(u) {
                visited_pins += hg.edge_size(e);
                if visited_pins > ctx.refinement.flows.max_num_pins {
                    break 'bfs;
                }
                for &p in hg.pins(e) {
                    if !try_add(p, distance + 1, &mut region, &mut in_region, &mut queue, &mut weight)
                    {
                        break 'bfs;
                    }
                }
            }
        }
    }

    // The flow problem needs an anchor outside the region: if the region
    // swallowed the whole block, the min cut would degenerate and move the
    // block wholesale. Leave the node farthest from the cut behind.
    let block_size = hg.nodes().filter(|&u| phg.part_id(u) == block).count();
    if region.len() == block_size {
        region.pop();
    }
    region
}

// The move of one vertex decided by the min cut.
struct RegionMove {
    node: NodeId,
    from: BlockId,
    to: BlockId,
}

// Builds the Lawler network over the region, solves it and extracts the
// most balanced feasible min-cut assignment. `None` on timeout.
fn solve_region(
    phg: &PartitionedHypergraph,
    ctx: &Context,
    pair: BlockPair,
    region_i: &[NodeId],
    region_j: &[NodeId],
    max_part_weights: &[Weight],
    deadline: Option<Instant>,
) -> Option<Vec<RegionMove>> {
    let hg = phg.hypergraph();

    let mut node_ids: FxHashMap<NodeId, u32> = FxHashMap::default();
    // source = 0, sink = 1, region nodes follow
    let mut network = FlowNetwork::new(2);
    let source = 0u32;
    let sink = 1u32;
    for &u in region_i.iter().chain(region_j) {
        let id = network.add_node();
        node_ids.insert(u, id);
    }

    let mut handled: FxHashSet<EdgeId> = FxHashSet::default();
    for &u in region_i.iter().chain(region_j) {
        for e in hg.incident_edges(u) {
            if !handled.insert(e) {
                continue;
            }
            let mut pins_in_region: Vec<u32> = Vec::new();
            let mut outside_i = false;
            let mut outside_j = false;
            for &p in hg.pins(e) {
                if let Some(&id) = node_ids.get(&p) {
                    pins_in_region.push(id);
                } else {
                    let b = phg.part_id(p);
                    outside_i |= b == pair.i;
                    outside_j |= b == pair.j;
                }
            }
            if pins_in_region.is_empty() {
                continue;
            }

            let e_in = network.add_node();
            let e_out = network.add_node();
            network.add_arc(e_in, e_out, hg.edge_weight(e));
            if outside_i {
                network.add_arc(source, e_in, INF);
            }
            if outside_j {
                network.add_arc(e_out, sink, INF);
            }
            for &pin in &pins_in_region {
                network.add_arc(pin, e_in, INF);
                network.add_arc(e_out, pin, INF);
            }
        }
    }

    network.max_flow(source, sink, deadline)?;

    // Candidate assignments: the source side of the min cut keeps block i;
    // optionally also the (usually different) sink-side variant.
    let mut candidates: Vec<Vec<bool>> = vec![network.source_side(source)];
    if ctx.refinement.flows.find_most_balanced_cut {
        let sink_side = network.sink_side(sink);
        // "on source side" = not on sink side
        candidates.push(sink_side.iter().map(|&s| !s).collect());
    }

    let mut best: Option<(Weight, Vec<RegionMove>)> = None;
    for assignment in candidates {
        let mut moves = Vec::new();
        let mut weight_i = phg.part_weight(pair.i);
        let mut weight_j = phg.part_weight(pair.j);
        for &u in region_i.iter().chain(region_j) {
            let id = node_ids[&u];
            let target = if assignment[id as usize] { pair.i } else { pair.j };
            let current = phg.part_id(u);
            if target != current {
                let w = hg.node_weight(u);
                if current == pair.i {
                    weight_i -= w;
                    weight_j += w;
                } else {
                    weight_j -= w;
                    weight_i += w;
                }
                moves.push(RegionMove { node: u, from: current, to: target });
            }
        }
        let feasible = weight_i <= max_part_weights[pair.i as usize]
            && weight_j <= max_part_weights[pair.j as usize];
        if !feasible || moves.is_empty() {
            continue;
        }
        let heaviest = weight_i.max(weight_j);
        if best.as_ref().map_or(true, |(h, _)| heaviest < *h) {
            best = Some((heaviest, moves));
        }
    }

    Some(best.map(|(_, moves)| moves).unwrap_or_default())
}

// Applies the sequence move by move, alternating directions to avoid
// transient overweight, and reverts everything if the sequence fails or
// does not improve the objective. Hyperedges entering the cut are reported
// back to the quotient graph.
fn apply_move_sequence(
    phg: &PartitionedHypergraph,
    qg: &QuotientGraph,
    pair: BlockPair,
    sequence: &[RegionMove],
    max_part_weights: &[Weight],
) -> Gain {
    if sequence.is_empty() {
        return 0;
    }
    let mut to_j: Vec<&RegionMove> = sequence.iter().filter(|m| m.to == pair.j).collect();
    let mut to_i: Vec<&RegionMove> = sequence.iter().filter(|m| m.to == pair.i).collect();
    let mut ordered: Vec<&RegionMove> = Vec::with_capacity(sequence.len());
    while !to_i.is_empty() || !to_j.is_empty() {
        if let Some(m) = to_i.pop() {
            ordered.push(m);
        }
        if let Some(m) = to_j.pop() {
            ordered.push(m);
        }
    }

    let mut applied: Vec<&RegionMove> = Vec::with_capacity(ordered.len());
    let mut new_cut_hes: Vec<(EdgeId, BlockId)> = Vec::new();
    let mut attributed: Gain = 0;
    let mut failed = false;
    for m in ordered {
        let moved = phg.change_node_part(
            m.node,
            m.from,
            m.to,
            max_part_weights[m.to as usize],
            || {},
            |e, we, _, pcf, pct| {
                attributed += km1_delta(we, pcf, pct);
                if pct == 1 {
                    new_cut_hes.push((e, m.to));
                }
            },
        );
        if !moved {
            failed = true;
            break;
        }
        applied.push(m);
    }

    let improvement = -attributed;
    if failed || improvement <= 0 {
        for m in applied.iter().rev() {
            let undone =
                phg.change_node_part(m.node, m.to, m.from, Weight::MAX, || {}, |_, _, _, _, _| {});
            debug_assert!(undone);
        }
        return 0;
    }
    for (he, block) in new_cut_hes {
        if phg.connectivity(he) > 1 && phg.pin_count_in_part(he, block) > 0 {
            qg.add_new_cut_hyperedge(phg, he, block);
        }
    }
    improvement
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Preset;
    use crate::hypergraph::Hypergraph;
    use crate::metrics::km1;

    fn flow_context(k: i32) -> Context {
        let mut ctx = Context::from_preset(Preset::Speed, k, 0.1);
        ctx.refinement.flows.algorithm = FlowAlgorithm::FlowCut;
        ctx.refinement.flows.skip_small_cuts = false;
        ctx.num_threads = 2;
        ctx
    }

    // Two dense clusters connected by a thin bridge; the initial bisection
    // splits one cluster apart.
    fn bridge_hypergraph() -> Hypergraph {
        Hypergraph::new(
            8,
            vec![
                vec![0, 1], vec![1, 2], vec![2, 3], vec![0, 3], vec![0, 2],
                vec![4, 5], vec![5, 6], vec![6, 7], vec![4, 7], vec![4, 6],
                vec![3, 4],
            ],
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_flow_refinement_finds_the_bridge_cut() {
        let hg = bridge_hypergraph();
        let phg = PartitionedHypergraph::new(&hg, 2);
        // Bad split: cluster {4..7} is cut apart.
        phg.apply_partition(&[0, 0, 0, 0, 0, 1, 1, 1]);
        let before = km1(&phg);
        assert!(before > 1);

        let ctx = flow_context(2);
        let improvement = refine(&phg, &ctx, &[5, 5], true, None);

        assert_eq!(km1(&phg), before - improvement);
        assert_eq!(km1(&phg), 1, "the bridge is the unique min cut");
        assert!(phg.part_weight(0) <= 5 && phg.part_weight(1) <= 5);
    }

    #[test]
    fn test_flow_refinement_keeps_optimal_partition() {
        let hg = bridge_hypergraph();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 0, 0, 1, 1, 1, 1]);
        assert_eq!(km1(&phg), 1);

        let ctx = flow_context(2);
        let improvement = refine(&phg, &ctx, &[5, 5], true, None);

        assert_eq!(improvement, 0);
        assert_eq!(km1(&phg), 1);
    }

    #[test]
    fn test_flow_refinement_respects_balance() {
        let hg = bridge_hypergraph();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 0, 0, 0, 1, 1, 1]);
        let before = km1(&phg);

        let ctx = flow_context(2);
        let improvement = refine(&phg, &ctx, &[3, 4], true, None);

        // The 4|4 bridge split violates the weight bound of block 0, so
        // the search must leave everything untouched.
        assert_eq!(improvement, 0);
        assert_eq!(km1(&phg), before);
        assert_eq!(phg.part_weight(0), 5);
        assert_eq!(phg.part_weight(1), 3);
    }

    #[test]
    fn test_disabled_flow_algorithm_is_a_no_op() {
        let hg = bridge_hypergraph();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 0, 0, 0, 1, 1, 1]);
        let mut ctx = flow_context(2);
        ctx.refinement.flows.algorithm = FlowAlgorithm::DoNothing;

        assert_eq!(refine(&phg, &ctx, &[5, 5], true, None), 0);
    }
}
