use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::context::{AcceptancePolicy, Context, HeavyNodePenalty, RatingFunction};
use crate::hypergraph::{Hypergraph, RemovedNets};
use crate::{BlockId, NodeId, Weight};

/// One coarsening step: the contraction pairs in application order and the
/// single-pin nets removed afterwards.
pub struct Level {
    pub contractions: Vec<(NodeId, NodeId)>,
    pub removed_nets: Vec<RemovedNets>,
}

/// Stack of coarsening levels. Uncontraction walks it in reverse.
pub struct Hierarchy {
    pub levels: Vec<Level>,
}

fn penalty(policy: HeavyNodePenalty, weight_u: Weight, weight_v: Weight) -> f64 {
    match policy {
        HeavyNodePenalty::Multiplicative => (weight_u * weight_v) as f64,
        HeavyNodePenalty::Additive => (weight_u + weight_v) as f64,
        HeavyNodePenalty::None => 1.0,
    }
}

/// Repeatedly matches vertices by heavy-edge rating and contracts, until the
/// contraction limit is reached or a pass shrinks the hypergraph by less
/// than `minimum_shrink_factor`. Matching never crosses community
/// boundaries and respects the maximum allowed node weight.
pub fn coarsen(hg: &mut Hypergraph, communities: &[NodeId], ctx: &Context) -> Hierarchy {
    let target = ctx.contraction_limit();
    let max_node_weight = ctx.max_allowed_node_weight(hg.total_weight());
    let mut rng = SmallRng::seed_from_u64(ctx.seed.wrapping_add(0x9e37_79b9));
    let mut levels = Vec::new();

    loop {
        let before = hg.current_num_nodes();
        if before <= target {
            break;
        }

        let pairs = match_vertices(hg, communities, ctx, max_node_weight, target, &mut rng);
        if pairs.is_empty() {
            break;
        }

        for &(u, v) in &pairs {
            hg.contract(u, v);
        }
        let removed_nets = hg.remove_single_pin_nets();
        let after = hg.current_num_nodes();
        debug!(before, after, removed = removed_nets.len(), "coarsening pass");
        levels.push(Level { contractions: pairs, removed_nets });

        if (before as f64 / after as f64) < ctx.coarsening.minimum_shrink_factor {
            break;
        }
    }

    Hierarchy { levels }
}

/// Undoes one coarsening level and projects the partition downwards: every
/// vertex contracted into a representative inherits its block.
pub fn uncontract_level(hg: &mut Hypergraph, level: &Level, partition: &mut [BlockId]) {
    hg.restore_single_pin_nets(&level.removed_nets);
    for &(u, v) in level.contractions.iter().rev() {
        hg.uncontract(u, v);
        partition[v as usize] = partition[u as usize];
    }
}

// Greedy matching over a shuffled vertex sweep. For each unmatched vertex
// the contraction partner with the highest heavy-edge rating
// sum(w(e) / (|e| - 1)) is chosen, scaled down by the heavy-node penalty.
fn match_vertices(
    hg: &Hypergraph,
    communities: &[NodeId],
    ctx: &Context,
    max_node_weight: Weight,
    target: usize,
    rng: &mut SmallRng,
) -> Vec<(NodeId, NodeId)> {
    let before = hg.current_num_nodes();
    // maximum_shrink_factor caps how aggressively one pass may shrink.
    let min_after = (before as f64 / ctx.coarsening.maximum_shrink_factor).ceil() as usize;
    let max_pairs = before.saturating_sub(min_after.max(target));

    let mut order: Vec<NodeId> = hg.nodes().collect();
    order.shuffle(rng);

    let mut matched = vec![false; hg.initial_num_nodes()];
    let mut pairs = Vec::new();
    let mut ratings = vec![0.0f64; hg.initial_num_nodes()];
    let mut candidates: Vec<NodeId> = Vec::new();

    for u in order {
        if matched[u as usize] || pairs.len() >= max_pairs {
            if pairs.len() >= max_pairs {
                break;
            }
            continue;
        }

        let weight_u = hg.node_weight(u);
        for e in hg.incident_edges(u) {
            let size = hg.edge_size(e);
            if size < 2 {
                continue;
            }
            let score = match ctx.coarsening.rating.rating_function {
                RatingFunction::HeavyEdge => hg.edge_weight(e) as f64 / (size as f64 - 1.0),
            };
            for &v in hg.pins(e) {
                if v == u || matched[v as usize] {
                    continue;
                }
                if communities[v as usize] != communities[u as usize] {
                    continue;
                }
                if weight_u + hg.node_weight(v) > max_node_weight {
                    continue;
                }
                if ratings[v as usize] == 0.0 {
                    candidates.push(v);
                }
                ratings[v as usize] += score;
            }
        }

        let mut best: Option<NodeId> = None;
        let mut best_rating = 0.0;
        for &v in &candidates {
            let rating = ratings[v as usize]
                / penalty(ctx.coarsening.rating.heavy_node_penalty, weight_u, hg.node_weight(v));
            let accept = match best {
                None => true,
                Some(current) => {
                    rating > best_rating
                        || (rating == best_rating && tie_break(ctx, rng, v, current))
                }
            };
            if accept {
                best = Some(v);
                best_rating = rating;
            }
        }
        for &v in &candidates {
            ratings[v as usize] = 0.0;
        }
        candidates.clear();

        matched[u as usize] = true;
        if let Some(v) = best {
            matched[v as usize] = true;
            pairs.push((u, v));
        }
    }

    pairs
}

fn tie_break(ctx: &Context, rng: &mut SmallRng, challenger: NodeId, incumbent: NodeId) -> bool {
    match ctx.coarsening.rating.acceptance_policy {
        // All rated candidates are unmatched at this point, so both
        // policies only differ in how they break exact rating ties.
        AcceptancePolicy::BestRating => {
            if ctx.deterministic {
                challenger < incumbent
            } else {
                rng.gen_bool(0.5)
            }
        }
        AcceptancePolicy::BestRatingPreferUnmatched => challenger < incumbent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, Preset};

    fn toy_hypergraph() -> Hypergraph {
        Hypergraph::new(
            7,
            vec![vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
            None,
            None,
        )
        .unwrap()
    }

    fn small_limit_context() -> Context {
        let mut ctx = Context::from_preset(Preset::Speed, 2, 0.03);
        ctx.coarsening.contraction_limit_multiplier = 1;
        ctx.deterministic = true;
        ctx
    }

    #[test]
    fn test_coarsen_respects_contraction_limit() {
        let mut hg = toy_hypergraph();
        let ctx = small_limit_context();
        let communities = vec![0; 7];

        let hierarchy = coarsen(&mut hg, &communities, &ctx);

        assert!(!hierarchy.levels.is_empty());
        assert!(hg.current_num_nodes() < 7);
        assert_eq!(hg.total_weight(), 7);
        let node_weight_sum: Weight = hg.nodes().map(|u| hg.node_weight(u)).sum();
        assert_eq!(node_weight_sum, 7);
    }

    #[test]
    fn test_matching_respects_communities() {
        let mut hg = toy_hypergraph();
        let ctx = small_limit_context();
        // Vertices 0..4 and 5..7 must never be merged.
        let communities = vec![0, 0, 0, 0, 0, 1, 1];

        let hierarchy = coarsen(&mut hg, &communities, &ctx);
        for level in &hierarchy.levels {
            for &(u, v) in &level.contractions {
                assert_eq!(communities[u as usize], communities[v as usize]);
            }
        }
    }

    #[test]
    fn test_matching_respects_max_node_weight() {
        let mut hg = Hypergraph::new(
            4,
            vec![vec![0, 1], vec![1, 2], vec![2, 3]],
            None,
            Some(vec![5, 1, 1, 5]),
        )
        .unwrap();
        let mut ctx = small_limit_context();
        ctx.coarsening.max_allowed_weight_multiplier = 0.5;
        // max allowed node weight: 0.5 * 12 / 2 = 3
        let communities = vec![0; 4];

        let hierarchy = coarsen(&mut hg, &communities, &ctx);
        let cap = ctx.max_allowed_node_weight(12);
        for level in &hierarchy.levels {
            for &(u, _) in &level.contractions {
                assert!(hg.node_weight(u) <= cap);
            }
        }
    }

    #[test]
    fn test_uncontract_level_projects_partition() {
        let mut hg = toy_hypergraph();
        let ctx = small_limit_context();
        let communities = vec![0; 7];

        let hierarchy = coarsen(&mut hg, &communities, &ctx);
        let mut partition: Vec<BlockId> = vec![-1; 7];
        for (i, u) in hg.nodes().enumerate() {
            partition[u as usize] = (i % 2) as BlockId;
        }

        for level in hierarchy.levels.iter().rev() {
            uncontract_level(&mut hg, level, &mut partition);
        }

        assert_eq!(hg.current_num_nodes(), 7);
        for u in 0..7 {
            assert_ne!(partition[u], -1, "vertex {u} was not assigned during projection");
        }
        // Pairs that were contracted share a block.
        for level in &hierarchy.levels {
            for &(u, v) in &level.contractions {
                assert_eq!(partition[u as usize], partition[v as usize]);
            }
        }
    }
}
