use parking_lot::Mutex;
use rayon::prelude::*;

use crate::context::Context;
use crate::partitioned::{km1_delta, PartitionedHypergraph};
use crate::refinement::RefinementStats;
use crate::{BlockId, Gain, NodeId, Weight};

/// Size-constrained label propagation: active vertices move to the block
/// with the highest positive km1 gain, then activate their neighborhood.
/// Hyperedges above the size activation threshold do not spread activity.
pub fn refine(
    phg: &PartitionedHypergraph,
    ctx: &Context,
    max_part_weights: &[Weight],
    sequential: bool,
) -> RefinementStats {
    let hg = phg.hypergraph();
    let params = &ctx.refinement.label_propagation;
    let mut stats = RefinementStats::default();

    let mut active: Vec<NodeId> = hg.nodes().filter(|&u| phg.is_border_node(u)).collect();

    for _ in 0..params.maximum_iterations {
        if active.is_empty() {
            break;
        }
        let next_active: Mutex<Vec<NodeId>> = Mutex::new(Vec::new());
        let moved_and_gain: Vec<(usize, Gain)> = if sequential || ctx.deterministic {
            active
                .iter()
                .map(|&u| process_node(phg, ctx, u, max_part_weights, &next_active))
                .collect()
        } else {
            active
                .par_iter()
                .map(|&u| process_node(phg, ctx, u, max_part_weights, &next_active))
                .collect()
        };

        let moves: usize = moved_and_gain.iter().map(|&(m, _)| m).sum();
        let improvement: Gain = moved_and_gain.iter().map(|&(_, g)| g).sum();
        stats.moves += moves;
        stats.improvement += improvement;
        if moves == 0 {
            break;
        }

        active = next_active.into_inner();
        active.sort_unstable();
        active.dedup();
    }

    stats
}

fn process_node(
    phg: &PartitionedHypergraph,
    ctx: &Context,
    u: NodeId,
    max_part_weights: &[Weight],
    next_active: &Mutex<Vec<NodeId>>,
) -> (usize, Gain) {
    let hg = phg.hypergraph();
    let from = phg.part_id(u);

    let mut best_to = from;
    let mut best_gain = 0;
    for to in 0..phg.k() {
        if to == from {
            continue;
        }
        if phg.part_weight(to) + hg.node_weight(u) > max_part_weights[to as usize] {
            continue;
        }
        let gain = phg.compute_gain(u, to);
        if gain > best_gain || (gain == best_gain && best_to != from && to < best_to) {
            best_gain = gain;
            best_to = to;
        }
    }
    if best_to == from {
        return (0, 0);
    }

    let threshold = ctx.refinement.label_propagation.hyperedge_size_activation_threshold;
    let mut activated: Vec<NodeId> = Vec::new();
    let mut attributed = 0;
    let moved = phg.change_node_part(
        u,
        from,
        best_to,
        max_part_weights[best_to as usize],
        || {},
        |e, we, size, pcf, pct| {
            attributed += km1_delta(we, pcf, pct);
            // Gains in the neighborhood only change on these transitions.
            if (pcf == 0 || pcf == 1 || pct == 1 || pct == 2) && size <= threshold {
                activated.extend(hg.pins(e).iter().copied());
            }
        },
    );
    if !moved {
        return (0, 0);
    }

    if !activated.is_empty() {
        next_active.lock().extend(activated);
    }
    (1, -attributed)
}

/// Chooses the block for a still unassigned vertex: highest attraction
/// among the blocks it can fit into, minimum weight block as fallback.
pub fn assign_unassigned_vertex(
    phg: &PartitionedHypergraph,
    u: NodeId,
    max_part_weights: &[Weight],
) -> BlockId {
    let hg = phg.hypergraph();
    let mut best: Option<(Gain, BlockId)> = None;
    for b in 0..phg.k() {
        if phg.part_weight(b) + hg.node_weight(u) > max_part_weights[b as usize] {
            continue;
        }
        let attraction: Gain = hg
            .incident_edges(u)
            .filter(|&e| phg.pin_count_in_part(e, b) > 0)
            .map(|e| hg.edge_weight(e))
            .sum();
        if best.map_or(true, |(g, _)| attraction > g) {
            best = Some((attraction, b));
        }
    }
    match best {
        Some((_, b)) => b,
        None => {
            // No block fits: fall back to the lightest one.
            (0..phg.k()).min_by_key(|&b| phg.part_weight(b)).unwrap()
        }
    }
}
