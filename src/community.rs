use atomic_float::AtomicF64;
use rand::seq::SliceRandom;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::context::Context;
use crate::graph::Graph;
use crate::hypergraph::Hypergraph;
use crate::NodeId;

/// Runs modularity-maximizing local moving on the clustering graph derived
/// from the hypergraph and returns a community id per hypergraph vertex.
/// The communities later restrict coarsening: contraction partners must
/// share a community.
pub fn detect_communities(hg: &Hypergraph, ctx: &Context) -> Vec<NodeId> {
    let graph = Graph::from_hypergraph(hg, ctx.community_detection.edge_weight_function);
    let communities = louvain(graph, ctx);
    // For the bipartite construction only the vertex side matters.
    communities[..hg.initial_num_nodes()].to_vec()
}

/// Parallel Louvain: local moving until fewer than
/// `min_vertex_move_fraction * |V|` nodes move, contraction between passes.
pub fn louvain(graph: Graph, ctx: &Context) -> Vec<NodeId> {
    let initial_num_nodes = graph.num_nodes();
    let mut communities: Vec<NodeId> = (0..initial_num_nodes as NodeId).collect();
    let mut current = graph;
    let mut pass = 0;

    loop {
        let mut clustering: Vec<NodeId> = (0..current.num_nodes() as NodeId).collect();
        let moved = local_moving(&current, &mut clustering, ctx, ctx.seed.wrapping_add(pass));
        pass += 1;

        if moved == 0 {
            break;
        }

        let coarse = current.contract(&mut clustering, ctx.community_detection.low_memory_contraction);
        for c in communities.iter_mut() {
            *c = clustering[*c as usize];
        }
        let converged = coarse.num_nodes() == current.num_nodes();
        current = coarse;
        if converged {
            break;
        }
    }

    communities
}

/// One local-moving phase. Iterates rounds over all nodes in randomized
/// order; a node joins the neighboring cluster with the highest modularity
/// gain. Stops after `max_pass_iterations` rounds or when a round moves
/// fewer than the configured fraction of nodes. Returns the total number of
/// moves.
pub fn local_moving(graph: &Graph, clustering: &mut [NodeId], ctx: &Context, seed: u64) -> usize {
    let n = graph.num_nodes();
    if n == 0 {
        return 0;
    }
    let params = &ctx.community_detection;
    let min_moves = ((params.min_vertex_move_fraction * n as f64).ceil() as usize).max(1);

    let cluster_volumes: Vec<AtomicF64> =
        (0..n).map(|u| AtomicF64::new(graph.node_volume(u))).collect();
    let shared_clustering: Vec<AtomicU32> =
        clustering.iter().map(|&c| AtomicU32::new(c)).collect();

    let mut total_moved = 0;
    for round in 0..params.max_pass_iterations {
        let mut order: Vec<NodeId> = (0..n as NodeId).collect();
        let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(round as u64));
        order.shuffle(&mut rng);

        let round_moved = if ctx.deterministic {
            deterministic_round(graph, &shared_clustering, &cluster_volumes, &order, ctx)
        } else {
            parallel_round(graph, &shared_clustering, &cluster_volumes, &order, ctx)
        };

        total_moved += round_moved;
        if round_moved < min_moves {
            break;
        }
    }

    for (slot, shared) in clustering.iter_mut().zip(&shared_clustering) {
        *slot = shared.load(Ordering::Relaxed);
    }
    total_moved
}

// Every node decides and moves concurrently; volume updates are atomic and
// neighbors may observe intermediate states.
fn parallel_round(
    graph: &Graph,
    clustering: &[AtomicU32],
    cluster_volumes: &[AtomicF64],
    order: &[NodeId],
    ctx: &Context,
) -> usize {
    let moved = AtomicUsize::new(0);
    order.par_iter().for_each_init(
        || RatingMap::new(graph.num_nodes()),
        |ratings, &u| {
            let current = clustering[u as usize].load(Ordering::Relaxed);
            let target = compute_max_gain_cluster(graph, clustering, cluster_volumes, u, ctx, ratings);
            if target != current {
                let volume = graph.node_volume(u as usize);
                cluster_volumes[current as usize].fetch_sub(volume, Ordering::Relaxed);
                cluster_volumes[target as usize].fetch_add(volume, Ordering::Relaxed);
                clustering[u as usize].store(target, Ordering::Relaxed);
                moved.fetch_add(1, Ordering::Relaxed);
            }
        },
    );
    moved.load(Ordering::Relaxed)
}

// Deterministic mode: the node order is split into sub-rounds. Desired moves
// are computed in parallel without being applied, then applied in a fixed
// order with the gain recomputed against the already applied prefix.
fn deterministic_round(
    graph: &Graph,
    clustering: &[AtomicU32],
    cluster_volumes: &[AtomicF64],
    order: &[NodeId],
    ctx: &Context,
) -> usize {
    let num_sub_rounds = ctx.community_detection.num_sub_rounds_deterministic.max(1);
    let chunk_size = (order.len() + num_sub_rounds - 1) / num_sub_rounds;
    let mut moved = 0;

    for chunk in order.chunks(chunk_size.max(1)) {
        let proposals: Vec<(NodeId, NodeId)> = chunk
            .par_iter()
            .map_init(
                || RatingMap::new(graph.num_nodes()),
                |ratings, &u| {
                    (u, compute_max_gain_cluster(graph, clustering, cluster_volumes, u, ctx, ratings))
                },
            )
            .collect();

        let mut ratings = RatingMap::new(graph.num_nodes());
        for (u, proposed) in proposals {
            let current = clustering[u as usize].load(Ordering::Relaxed);
            if proposed == current {
                continue;
            }
            // Conflicts with already applied moves of this sub-round are
            // resolved by recomputing the decision.
            let target = compute_max_gain_cluster(graph, clustering, cluster_volumes, u, ctx, &mut ratings);
            if target != current {
                let volume = graph.node_volume(u as usize);
                cluster_volumes[current as usize].fetch_sub(volume, Ordering::Relaxed);
                cluster_volumes[target as usize].fetch_add(volume, Ordering::Relaxed);
                clustering[u as usize].store(target, Ordering::Relaxed);
                moved += 1;
            }
        }
    }
    moved
}

// Modularity gain of moving u from its cluster C to C':
//   delta = wIC(u, C') - wIC(u, C \ {u})
//         - vol(C') * vol(u) / totalVol
//         + (vol(C) - vol(u)) * vol(u) / totalVol
// The best cluster is picked with ties broken towards the smallest id; u
// stays put unless the gain is strictly positive.
fn compute_max_gain_cluster(
    graph: &Graph,
    clustering: &[AtomicU32],
    cluster_volumes: &[AtomicF64],
    u: NodeId,
    ctx: &Context,
    ratings: &mut RatingMap,
) -> NodeId {
    let current = clustering[u as usize].load(Ordering::Relaxed);
    let arcs = graph.arcs_of(u as usize);
    let sampling_threshold = ctx.community_detection.vertex_degree_sampling_threshold;
    let sampled = if arcs.len() > sampling_threshold {
        &arcs[..sampling_threshold]
    } else {
        arcs
    };

    for arc in sampled {
        let c = clustering[arc.head as usize].load(Ordering::Relaxed);
        ratings.add(c, arc.weight);
    }

    let total_volume = graph.total_volume();
    let volume_u = graph.node_volume(u as usize);
    let volume_from = cluster_volumes[current as usize].load(Ordering::Relaxed) - volume_u;
    let weight_from = ratings.get(current);
    let baseline = weight_from - volume_from * volume_u / total_volume;

    let mut best = current;
    let mut best_gain = 0.0;
    for &c in &ratings.used {
        if c == current {
            continue;
        }
        let volume_to = cluster_volumes[c as usize].load(Ordering::Relaxed);
        let gain = ratings.get(c) - volume_to * volume_u / total_volume - baseline;
        if gain > best_gain || (gain == best_gain && best != current && c < best) {
            best_gain = gain;
            best = c;
        }
    }

    ratings.reset();
    best
}

// Incident-cluster-weight scratch, cleared between nodes.
struct RatingMap {
    values: Vec<f64>,
    used: Vec<NodeId>,
}

impl RatingMap {
    fn new(n: usize) -> Self {
        RatingMap { values: vec![0.0; n], used: Vec::new() }
    }

    fn add(&mut self, key: NodeId, weight: f64) {
        if self.values[key as usize] == 0.0 {
            self.used.push(key);
        }
        self.values[key as usize] += weight;
    }

    fn get(&self, key: NodeId) -> f64 {
        self.values[key as usize]
    }

    fn reset(&mut self) {
        for &key in &self.used {
            self.values[key as usize] = 0.0;
        }
        self.used.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, EdgeWeightFunction, Preset};
    use crate::metrics::modularity;

    // Zachary's karate club: 34 vertices, 78 edges.
    pub(crate) const KARATE_CLUB_EDGES: [(NodeId, NodeId); 78] = [
        (0, 1), (0, 2), (0, 3), (0, 4), (0, 5), (0, 6), (0, 7), (0, 8), (0, 10), (0, 11),
        (0, 12), (0, 13), (0, 17), (0, 19), (0, 21), (0, 31), (1, 2), (1, 3), (1, 7), (1, 13),
        (1, 17), (1, 19), (1, 21), (1, 30), (2, 3), (2, 7), (2, 8), (2, 9), (2, 13), (2, 27),
        (2, 28), (2, 32), (3, 7), (3, 12), (3, 13), (4, 6), (4, 10), (5, 6), (5, 10), (5, 16),
        (6, 16), (8, 30), (8, 32), (8, 33), (9, 33), (13, 33), (14, 32), (14, 33), (15, 32),
        (15, 33), (18, 32), (18, 33), (19, 33), (20, 32), (20, 33), (22, 32), (22, 33),
        (23, 25), (23, 27), (23, 29), (23, 32), (23, 33), (24, 25), (24, 27), (24, 31),
        (25, 31), (26, 29), (26, 33), (27, 33), (28, 31), (28, 33), (29, 32), (29, 33),
        (30, 32), (30, 33), (31, 32), (31, 33), (32, 33),
    ];

    pub(crate) fn karate_club_hypergraph() -> Hypergraph {
        let edges = KARATE_CLUB_EDGES.iter().map(|&(a, b)| vec![a, b]).collect();
        Hypergraph::new(34, edges, None, None).unwrap()
    }

    fn karate_context() -> Context {
        let mut ctx = Context::from_preset(Preset::Speed, 2, 0.03);
        ctx.community_detection.edge_weight_function = EdgeWeightFunction::Uniform;
        ctx.community_detection.max_pass_iterations = 100;
        ctx.community_detection.min_vertex_move_fraction = 0.0001;
        ctx
    }

    #[test]
    fn test_karate_club_communities() {
        let hg = karate_club_hypergraph();
        let ctx = karate_context();
        let communities = detect_communities(&hg, &ctx);

        assert_eq!(communities.len(), 34);
        let num_communities = communities.iter().map(|&c| c as usize + 1).max().unwrap();
        assert!(
            (2..=8).contains(&num_communities),
            "unexpected community count {num_communities}"
        );

        let graph = Graph::from_hypergraph(&hg, EdgeWeightFunction::Uniform);
        let q = modularity(&graph, &communities);
        assert!(q > 0.3, "modularity too low: {q}");
    }

    #[test]
    fn test_deterministic_mode_is_reproducible() {
        let hg = karate_club_hypergraph();
        let mut ctx = karate_context();
        ctx.deterministic = true;
        ctx.seed = 42;

        let a = detect_communities(&hg, &ctx);
        let b = detect_communities(&hg, &ctx);
        assert_eq!(a, b);
    }

    #[test]
    fn test_local_moving_groups_a_clique() {
        // Two triangles joined by one edge: local moving should put each
        // triangle into one cluster.
        let hg = Hypergraph::new(
            6,
            vec![
                vec![0, 1], vec![1, 2], vec![0, 2],
                vec![3, 4], vec![4, 5], vec![3, 5],
                vec![2, 3],
            ],
            None,
            None,
        )
        .unwrap();
        let mut ctx = karate_context();
        ctx.deterministic = true;

        let communities = detect_communities(&hg, &ctx);
        assert_eq!(communities[0], communities[1]);
        assert_eq!(communities[1], communities[2]);
        assert_eq!(communities[3], communities[4]);
        assert_eq!(communities[4], communities[5]);
        assert_ne!(communities[0], communities[3]);
    }

    #[test]
    fn test_modularity_of_known_clustering() {
        let hg = karate_club_hypergraph();
        let graph = Graph::from_hypergraph(&hg, EdgeWeightFunction::Uniform);
        // The reference clustering of the karate club instance.
        let reference: Vec<NodeId> = vec![
            1, 1, 1, 1, 0, 0, 0, 1, 3, 1, 0, 1, 1, 1, 3, 3, 0, 1, 3, 1, 3, 1, 3, 2, 2, 2, 3,
            2, 2, 3, 3, 2, 3, 3,
        ];
        let q = modularity(&graph, &reference);
        assert!((q - 0.4188).abs() < 0.001, "karate reference modularity was {q}");
    }
}
