use rayon::prelude::*;

use crate::context::EdgeWeightFunction;
use crate::hypergraph::Hypergraph;
use crate::NodeId;

/// Weighted arc of the clustering graph.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Arc {
    pub head: NodeId,
    pub weight: f64,
}

/// Size of the blocks used for the deterministic volume reduction. Double
/// addition is order sensitive, so the total volume is accumulated per fixed
/// block and the block sums are combined in index order, independent of the
/// number of threads.
const VOLUME_BLOCK_SIZE: usize = 1024;

/// Plain weighted graph in CSR form, derived from a hypergraph for community
/// detection. If every hyperedge has exactly two pins the graph is built
/// directly; otherwise a bipartite graph on V + E is used.
#[derive(Debug, Clone)]
pub struct Graph {
    num_nodes: usize,
    num_arcs: usize,
    total_volume: f64,
    max_degree: usize,
    indices: Vec<usize>,
    arcs: Vec<Arc>,
    node_volumes: Vec<f64>,
}

impl Graph {
    pub fn from_hypergraph(hg: &Hypergraph, weight_fn: EdgeWeightFunction) -> Self {
        let arc_weight = |edge_weight: f64, edge_size: f64, node_degree: f64| -> f64 {
            match weight_fn {
                EdgeWeightFunction::Uniform => edge_weight,
                EdgeWeightFunction::NonUniform => edge_weight / edge_size,
                EdgeWeightFunction::Degree => edge_weight * node_degree / edge_size,
            }
        };

        let mut graph = if hg.is_graph() {
            Self::construct_from_graph(hg, arc_weight)
        } else {
            Self::construct_bipartite(hg, arc_weight)
        };
        graph.compute_volumes();
        graph
    }

    fn construct_from_graph(hg: &Hypergraph, arc_weight: impl Fn(f64, f64, f64) -> f64) -> Self {
        let n = hg.initial_num_nodes();
        let mut indices = vec![0usize; n + 1];
        for u in hg.nodes() {
            indices[u as usize + 1] = hg.node_degree(u) as usize;
        }
        for i in 1..=n {
            indices[i] += indices[i - 1];
        }

        let num_arcs = indices[n];
        let mut arcs = vec![Arc { head: 0, weight: 0.0 }; num_arcs];
        let mut max_degree = 0;
        for u in hg.nodes() {
            let degree = hg.node_degree(u) as usize;
            max_degree = max_degree.max(degree);
            let mut pos = indices[u as usize];
            for e in hg.incident_edges(u) {
                let head = *hg
                    .pins(e)
                    .iter()
                    .find(|&&p| p != u)
                    .expect("two-pin edge with a single distinct pin");
                let weight = arc_weight(hg.edge_weight(e) as f64, 2.0, degree as f64);
                arcs[pos] = Arc { head, weight };
                pos += 1;
            }
        }

        Graph {
            num_nodes: n,
            num_arcs,
            total_volume: 0.0,
            max_degree,
            indices,
            arcs,
            node_volumes: vec![0.0; n],
        }
    }

    fn construct_bipartite(hg: &Hypergraph, arc_weight: impl Fn(f64, f64, f64) -> f64) -> Self {
        let n = hg.initial_num_nodes();
        let m = hg.initial_num_edges();
        let num_nodes = n + m;
        let mut indices = vec![0usize; num_nodes + 1];
        for u in hg.nodes() {
            indices[u as usize + 1] = hg.node_degree(u) as usize;
        }
        for e in hg.edges() {
            indices[n + e as usize + 1] = hg.edge_size(e);
        }
        for i in 1..=num_nodes {
            indices[i] += indices[i - 1];
        }

        let num_arcs = indices[num_nodes];
        let mut arcs = vec![Arc { head: 0, weight: 0.0 }; num_arcs];
        let mut max_degree = 0;
        for u in hg.nodes() {
            let degree = hg.node_degree(u) as usize;
            max_degree = max_degree.max(degree);
            let mut pos = indices[u as usize];
            for e in hg.incident_edges(u) {
                let weight = arc_weight(
                    hg.edge_weight(e) as f64,
                    hg.edge_size(e) as f64,
                    degree as f64,
                );
                arcs[pos] = Arc { head: (n + e as usize) as NodeId, weight };
                pos += 1;
            }
        }
        for e in hg.edges() {
            let size = hg.edge_size(e);
            max_degree = max_degree.max(size);
            let mut pos = indices[n + e as usize];
            for &pin in hg.pins(e) {
                let weight = arc_weight(
                    hg.edge_weight(e) as f64,
                    size as f64,
                    hg.node_degree(pin) as f64,
                );
                arcs[pos] = Arc { head: pin, weight };
                pos += 1;
            }
        }

        Graph {
            num_nodes,
            num_arcs,
            total_volume: 0.0,
            max_degree,
            indices,
            arcs,
            node_volumes: vec![0.0; num_nodes],
        }
    }

    fn compute_volumes(&mut self) {
        let indices = &self.indices;
        let arcs = &self.arcs;
        self.node_volumes
            .par_iter_mut()
            .enumerate()
            .for_each(|(u, volume)| {
                *volume = arcs[indices[u]..indices[u + 1]]
                    .iter()
                    .map(|a| a.weight)
                    .sum();
            });
        self.total_volume = Self::deterministic_sum(&self.node_volumes);
    }

    // Fixed-block summation: block sums are computed independently and
    // combined in index order, so the result does not depend on the number
    // of threads.
    fn deterministic_sum(values: &[f64]) -> f64 {
        values
            .par_chunks(VOLUME_BLOCK_SIZE)
            .map(|chunk| chunk.iter().sum::<f64>())
            .collect::<Vec<f64>>()
            .into_iter()
            .sum()
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_arcs(&self) -> usize {
        self.num_arcs
    }

    pub fn total_volume(&self) -> f64 {
        self.total_volume
    }

    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    pub fn degree(&self, u: usize) -> usize {
        self.indices[u + 1] - self.indices[u]
    }

    pub fn node_volume(&self, u: usize) -> f64 {
        self.node_volumes[u]
    }

    pub fn arcs_of(&self, u: usize) -> &[Arc] {
        &self.arcs[self.indices[u]..self.indices[u + 1]]
    }

    /// Contracts the graph along the given clustering. Cluster ids are
    /// remapped to the consecutive range 0..C in place. Self loops are never
    /// emitted; multi-arcs are merged with their weights accumulated in
    /// (head, weight) order, which keeps the result identical across thread
    /// counts.
    pub fn contract(&self, communities: &mut [NodeId], low_memory: bool) -> Graph {
        debug_assert_eq!(communities.len(), self.num_nodes);
        let num_coarse_nodes = Self::remap_communities(self.num_nodes, communities);
        if low_memory {
            self.contract_clear_list(communities, num_coarse_nodes)
        } else {
            self.contract_two_phase(communities, num_coarse_nodes)
        }
    }

    // 0/1 indicator over used cluster ids, prefix summed; the value at c is
    // the remapped id plus one.
    fn remap_communities(num_nodes: usize, communities: &mut [NodeId]) -> usize {
        let mut mapping = vec![0u32; num_nodes];
        for &c in communities.iter() {
            mapping[c as usize] = 1;
        }
        let mut sum = 0;
        for slot in mapping.iter_mut() {
            sum += *slot;
            *slot = sum;
        }
        for c in communities.iter_mut() {
            *c = mapping[*c as usize] - 1;
        }
        sum as usize
    }

    // Stable counting sort of nodes by cluster id.
    fn sort_by_cluster(&self, communities: &[NodeId], num_coarse_nodes: usize) -> (Vec<usize>, Vec<NodeId>) {
        let mut bounds = vec![0usize; num_coarse_nodes + 1];
        for &c in communities {
            bounds[c as usize + 1] += 1;
        }
        for i in 1..=num_coarse_nodes {
            bounds[i] += bounds[i - 1];
        }
        let mut sorted = vec![0 as NodeId; self.num_nodes];
        let mut pos = bounds.clone();
        for u in 0..self.num_nodes {
            let c = communities[u] as usize;
            sorted[pos[c]] = u as NodeId;
            pos[c] += 1;
        }
        (bounds, sorted)
    }

    // Memory-frugal variant: one clear list per worker, two passes over the
    // coarse nodes. Deterministic regardless of thread count because every
    // coarse node is processed independently in member order.
    fn contract_clear_list(&self, communities: &[NodeId], num_coarse_nodes: usize) -> Graph {
        let (bounds, sorted) = self.sort_by_cluster(communities, num_coarse_nodes);

        // First pass: coarse degrees and volumes.
        let mut degrees_volumes: Vec<(usize, f64)> = Vec::with_capacity(num_coarse_nodes);
        (0..num_coarse_nodes)
            .into_par_iter()
            .map_init(
                || ClearList::new(num_coarse_nodes),
                |clear_list, cu| {
                    let mut volume = 0.0;
                    for &fu in &sorted[bounds[cu]..bounds[cu + 1]] {
                        volume += self.node_volume(fu as usize);
                        for arc in self.arcs_of(fu as usize) {
                            let cv = communities[arc.head as usize];
                            if cv as usize != cu {
                                clear_list.add(cv, arc.weight);
                            }
                        }
                    }
                    let degree = clear_list.used.len();
                    clear_list.reset();
                    (degree, volume)
                },
            )
            .collect_into_vec(&mut degrees_volumes);

        let mut indices = vec![0usize; num_coarse_nodes + 1];
        for cu in 0..num_coarse_nodes {
            indices[cu + 1] = indices[cu] + degrees_volumes[cu].0;
        }
        let num_arcs = indices[num_coarse_nodes];
        let node_volumes: Vec<f64> = degrees_volumes.iter().map(|&(_, v)| v).collect();
        let max_degree = degrees_volumes.iter().map(|&(d, _)| d).max().unwrap_or(0);

        // Second pass: accumulate and emit the coarse arcs, sorted by head.
        let mut arcs = vec![Arc { head: 0, weight: 0.0 }; num_arcs];
        let arc_chunks: Vec<(usize, Vec<Arc>)> = (0..num_coarse_nodes)
            .into_par_iter()
            .map_init(
                || ClearList::new(num_coarse_nodes),
                |clear_list, cu| {
                    for &fu in &sorted[bounds[cu]..bounds[cu + 1]] {
                        for arc in self.arcs_of(fu as usize) {
                            let cv = communities[arc.head as usize];
                            if cv as usize != cu {
                                clear_list.add(cv, arc.weight);
                            }
                        }
                    }
                    clear_list.used.sort_unstable();
                    let emitted: Vec<Arc> = clear_list
                        .used
                        .iter()
                        .map(|&cv| Arc { head: cv, weight: clear_list.values[cv as usize] })
                        .collect();
                    clear_list.reset();
                    (indices[cu], emitted)
                },
            )
            .collect();
        for (start, emitted) in arc_chunks {
            arcs[start..start + emitted.len()].copy_from_slice(&emitted);
        }

        Graph {
            num_nodes: num_coarse_nodes,
            num_arcs,
            total_volume: self.total_volume,
            max_degree,
            indices,
            arcs,
            node_volumes,
        }
    }

    // Default variant: all cross-cluster arcs are written to a temporary
    // array grouped by coarse node, then each group is sorted by
    // (head, weight) and merged. The sort makes the weight accumulation
    // order stable.
    fn contract_two_phase(&self, communities: &[NodeId], num_coarse_nodes: usize) -> Graph {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // Count cross-cluster arcs per coarse node.
        let counts: Vec<AtomicUsize> = (0..num_coarse_nodes).map(|_| AtomicUsize::new(0)).collect();
        (0..self.num_nodes).into_par_iter().for_each(|u| {
            let cu = communities[u];
            let mut local = 0;
            for arc in self.arcs_of(u) {
                if communities[arc.head as usize] != cu {
                    local += 1;
                }
            }
            if local > 0 {
                counts[cu as usize].fetch_add(local, Ordering::Relaxed);
            }
        });

        let mut tmp_indices = vec![0usize; num_coarse_nodes + 1];
        for cu in 0..num_coarse_nodes {
            tmp_indices[cu + 1] = tmp_indices[cu] + counts[cu].load(Ordering::Relaxed);
        }
        let tmp_num_arcs = tmp_indices[num_coarse_nodes];

        // Scatter the arcs into their group.
        let tmp_pos: Vec<AtomicUsize> = (0..num_coarse_nodes).map(|_| AtomicUsize::new(0)).collect();
        let tmp_arcs: Vec<std::sync::atomic::AtomicU64> =
            (0..tmp_num_arcs * 2).map(|_| std::sync::atomic::AtomicU64::new(0)).collect();
        (0..self.num_nodes).into_par_iter().for_each(|u| {
            let cu = communities[u];
            for arc in self.arcs_of(u) {
                let cv = communities[arc.head as usize];
                if cv != cu {
                    let slot = tmp_indices[cu as usize]
                        + tmp_pos[cu as usize].fetch_add(1, Ordering::Relaxed);
                    tmp_arcs[2 * slot].store(cv as u64, Ordering::Relaxed);
                    tmp_arcs[2 * slot + 1].store(arc.weight.to_bits(), Ordering::Relaxed);
                }
            }
        });

        // Coarse volumes in fine-node order.
        let mut node_volumes = vec![0.0f64; num_coarse_nodes];
        for u in 0..self.num_nodes {
            node_volumes[communities[u] as usize] += self.node_volume(u);
        }

        // Sort each group, merge multi-arcs and emit.
        let merged: Vec<Vec<Arc>> = (0..num_coarse_nodes)
            .into_par_iter()
            .map(|cu| {
                let mut group: Vec<Arc> = (tmp_indices[cu]..tmp_indices[cu + 1])
                    .map(|slot| Arc {
                        head: tmp_arcs[2 * slot].load(Ordering::Relaxed) as NodeId,
                        weight: f64::from_bits(tmp_arcs[2 * slot + 1].load(Ordering::Relaxed)),
                    })
                    .collect();
                group.sort_unstable_by(|a, b| {
                    a.head.cmp(&b.head).then(a.weight.total_cmp(&b.weight))
                });
                let mut out: Vec<Arc> = Vec::with_capacity(group.len());
                for arc in group {
                    match out.last_mut() {
                        Some(last) if last.head == arc.head => last.weight += arc.weight,
                        _ => out.push(arc),
                    }
                }
                out
            })
            .collect();

        let mut indices = vec![0usize; num_coarse_nodes + 1];
        for cu in 0..num_coarse_nodes {
            indices[cu + 1] = indices[cu] + merged[cu].len();
        }
        let num_arcs = indices[num_coarse_nodes];
        let max_degree = merged.iter().map(Vec::len).max().unwrap_or(0);
        let mut arcs = Vec::with_capacity(num_arcs);
        for group in merged {
            arcs.extend(group);
        }

        Graph {
            num_nodes: num_coarse_nodes,
            num_arcs,
            total_volume: self.total_volume,
            max_degree,
            indices,
            arcs,
            node_volumes,
        }
    }
}

// Dedup-by-sentinel scratch keyed by coarse node id.
struct ClearList {
    values: Vec<f64>,
    used: Vec<NodeId>,
}

impl ClearList {
    fn new(n: usize) -> Self {
        ClearList { values: vec![0.0; n], used: Vec::new() }
    }

    fn add(&mut self, key: NodeId, weight: f64) {
        if self.values[key as usize] == 0.0 {
            self.used.push(key);
        }
        self.values[key as usize] += weight;
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
    use crate::context::EdgeWeightFunction;
    use crate::hypergraph::Hypergraph;

    fn toy_hypergraph() -> Hypergraph {
        Hypergraph::new(
            7,
            vec![vec![0, 2], vec![0, 1, 3, 4], vec![3, 4, 6], vec![2, 5, 6]],
            None,
            None,
        )
        .unwrap()
    }

    fn two_uniform() -> Hypergraph {
        // A 4-cycle as a 2-uniform hypergraph.
        Hypergraph::new(4, vec![vec![0, 1], vec![1, 2], vec![2, 3], vec![3, 0]], None, None)
            .unwrap()
    }

    #[test]
    fn test_two_uniform_hypergraph_builds_direct_graph() {
        let hg = two_uniform();
        let g = Graph::from_hypergraph(&hg, EdgeWeightFunction::Uniform);
        // No bipartite auxiliary nodes, one arc per (edge, direction).
        assert_eq!(g.num_nodes(), 4);
        assert_eq!(g.num_arcs(), 2 * hg.initial_num_edges());
        assert_eq!(g.degree(0), 2);
        let volume_sum: f64 = (0..g.num_nodes()).map(|u| g.node_volume(u)).sum();
        assert!((volume_sum - g.total_volume()).abs() <= 1e-12 * g.total_volume());
    }

    #[test]
    fn test_general_hypergraph_builds_bipartite_graph() {
        let hg = toy_hypergraph();
        let g = Graph::from_hypergraph(&hg, EdgeWeightFunction::Uniform);
        assert_eq!(g.num_nodes(), 7 + 4);
        assert_eq!(g.num_arcs(), 2 * hg.initial_num_pins());
        // Vertex 0 is incident to e0 and e1.
        let heads: Vec<NodeId> = g.arcs_of(0).iter().map(|a| a.head).collect();
        assert_eq!(heads, vec![7, 8]);
    }

    #[test]
    fn test_edge_weight_functions() {
        let hg = toy_hypergraph();
        let uniform = Graph::from_hypergraph(&hg, EdgeWeightFunction::Uniform);
        let non_uniform = Graph::from_hypergraph(&hg, EdgeWeightFunction::NonUniform);
        // e1 has four pins, so its non-uniform arcs carry weight 1/4.
        assert_eq!(uniform.arcs_of(1)[0].weight, 1.0);
        assert_eq!(non_uniform.arcs_of(1)[0].weight, 0.25);
    }

    #[test]
    fn test_contract_merges_arcs_and_volumes() {
        let hg = two_uniform();
        let g = Graph::from_hypergraph(&hg, EdgeWeightFunction::Uniform);
        // Clusters {0, 1} and {2, 3}: two cut edges between them.
        let mut communities = vec![0, 0, 1, 1];
        let coarse = g.contract(&mut communities, false);

        assert_eq!(coarse.num_nodes(), 2);
        assert_eq!(coarse.num_arcs(), 2);
        assert_eq!(coarse.arcs_of(0), &[Arc { head: 1, weight: 2.0 }]);
        assert_eq!(coarse.arcs_of(1), &[Arc { head: 0, weight: 2.0 }]);
        assert_eq!(coarse.node_volume(0), 4.0);
        assert_eq!(coarse.total_volume(), g.total_volume());
    }

    #[test]
    fn test_contract_variants_agree() {
        let hg = toy_hypergraph();
        let g = Graph::from_hypergraph(&hg, EdgeWeightFunction::Uniform);
        let mut communities_a: Vec<NodeId> = vec![5, 5, 9, 9, 9, 5, 2, 2, 9, 5, 2];
        let mut communities_b = communities_a.clone();

        let a = g.contract(&mut communities_a, false);
        let b = g.contract(&mut communities_b, true);

        assert_eq!(communities_a, communities_b);
        assert_eq!(a.num_nodes(), b.num_nodes());
        assert_eq!(a.num_arcs(), b.num_arcs());
        for u in 0..a.num_nodes() {
            assert_eq!(a.arcs_of(u), b.arcs_of(u), "node {u}");
            assert!((a.node_volume(u) - b.node_volume(u)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_remap_produces_consecutive_ids() {
        let mut communities = vec![4, 4, 7, 2, 7];
        let count = Graph::remap_communities(5, &mut communities);
        assert_eq!(count, 3);
        assert_eq!(communities, vec![1, 1, 2, 0, 2]);
    }

    #[test]
    fn test_self_loops_are_never_emitted() {
        let hg = two_uniform();
        let g = Graph::from_hypergraph(&hg, EdgeWeightFunction::Uniform);
        let mut communities = vec![0, 0, 0, 1];
        let coarse = g.contract(&mut communities, true);
        for u in 0..coarse.num_nodes() {
            for arc in coarse.arcs_of(u) {
                assert_ne!(arc.head as usize, u);
            }
        }
    }
}
