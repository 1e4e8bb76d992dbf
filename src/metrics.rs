use num_traits::FromPrimitive;
use num_traits::ToPrimitive;
use num_traits::Zero;
use std::iter::Sum;
use std::ops::AddAssign;
use std::ops::Div;
use std::ops::Sub;

use crate::context::Objective;
use crate::graph::Graph;
use crate::partitioned::PartitionedHypergraph;
use crate::{BlockId, Weight};

// Calculates the total weight for each block of a given partition.
pub fn compute_parts_load<W>(partition: &[BlockId], num_parts: usize, weights: W) -> Vec<W::Item>
where
    W: IntoIterator,
    W::Item: Zero + Clone + AddAssign,
{
    let mut loads = vec![W::Item::zero(); num_parts];

    for (&part, w) in partition.iter().zip(weights.into_iter()) {
        if part >= 0 && (part as usize) < num_parts {
            loads[part as usize] += w;
        }
    }

    loads
}

/// Compute the imbalance of the given partition.
///
/// The imbalance is `max_b W[b] / ceil(W(V) / k) - 1`; a perfectly balanced
/// partition has imbalance 0.
pub fn imbalance<W>(num_parts: usize, partition: &[BlockId], weights: W) -> f64
where
    W: IntoIterator,
    W::Item: Clone + PartialOrd + PartialEq,
    W::Item: Zero + FromPrimitive + ToPrimitive,
    W::Item: AddAssign + Div<Output = W::Item> + Sub<Output = W::Item> + Sum,
{
    if num_parts == 0 {
        return 0.0;
    }

    let part_loads = compute_parts_load(partition, num_parts, weights);

    let total_weight: W::Item = part_loads.iter().cloned().sum();
    let total_weight = total_weight.to_f64().unwrap_or(0.0);
    let ideal_part_weight = (total_weight / num_parts as f64).ceil();
    if ideal_part_weight == 0.0 {
        return 0.0;
    }

    part_loads
        .into_iter()
        .map(|part_weight| {
            let part_weight: f64 = part_weight.to_f64().unwrap_or(0.0);
            part_weight / ideal_part_weight - 1.0
        })
        .fold(0.0f64, |acc, dev| acc.max(dev))
}

/// Imbalance of a partitioned hypergraph, read from its block weights.
pub fn imbalance_of(phg: &PartitionedHypergraph) -> f64 {
    let k = phg.k() as usize;
    let total: Weight = (0..k as BlockId).map(|b| phg.part_weight(b)).sum();
    let ideal = ((total as f64) / k as f64).ceil();
    if ideal == 0.0 {
        return 0.0;
    }
    (0..k as BlockId)
        .map(|b| phg.part_weight(b) as f64 / ideal - 1.0)
        .fold(0.0f64, f64::max)
}

/// Recomputes the connectivity metric km1 from scratch.
pub fn km1(phg: &PartitionedHypergraph) -> Weight {
    let mut sum = 0;
    for e in phg.hypergraph().edges() {
        let connectivity = phg.connectivity(e) as Weight;
        if connectivity > 1 {
            sum += phg.hypergraph().edge_weight(e) * (connectivity - 1);
        }
    }
    sum
}

/// Recomputes the cut metric from scratch.
pub fn cut(phg: &PartitionedHypergraph) -> Weight {
    let mut sum = 0;
    for e in phg.hypergraph().edges() {
        if phg.connectivity(e) > 1 {
            sum += phg.hypergraph().edge_weight(e);
        }
    }
    sum
}

pub fn objective(phg: &PartitionedHypergraph, obj: Objective) -> Weight {
    match obj {
        Objective::Cut => cut(phg),
        Objective::Km1 => km1(phg),
    }
}

/// Modularity of a clustering of the given graph.
pub fn modularity(graph: &Graph, clustering: &[u32]) -> f64 {
    debug_assert_eq!(graph.num_nodes(), clustering.len());
    let num_clusters = clustering.iter().map(|&c| c as usize + 1).max().unwrap_or(0);
    let mut internal = vec![0.0f64; num_clusters];
    let mut volume = vec![0.0f64; num_clusters];

    for u in 0..graph.num_nodes() {
        let cu = clustering[u] as usize;
        volume[cu] += graph.node_volume(u);
        for arc in graph.arcs_of(u) {
            if clustering[arc.head as usize] as usize == cu {
                internal[cu] += arc.weight;
            }
        }
    }

    let total = graph.total_volume();
    (0..num_clusters)
        .map(|c| internal[c] / total - (volume[c] / total) * (volume[c] / total))
        .sum()
}

#[cfg(test)]
mod tests {
    use approx::assert_ulps_eq;
    use itertools::assert_equal;

    use super::*;

    #[test]
    fn test_compute_parts_load() {
        // Arrange
        let partition = [0, 0, 1, 1];
        let vtx_weights = [4i64, 7, 5, 2];
        let num_parts = 2;

        // Act
        let partition_weights = compute_parts_load(&partition, num_parts, vtx_weights);

        // Assert
        assert_equal(partition_weights, [11, 7]);
    }

    #[test]
    fn test_unassigned_vertices_are_skipped() {
        let partition = [0, -1, 1];
        let weights = [3i64, 100, 4];
        let loads = compute_parts_load(&partition, 2, weights);
        assert_equal(loads, [3, 4]);
    }

    #[test]
    fn test_imbalance() {
        // Arrange
        let partition = [0, 0, 1, 1];
        let vtx_weights = [3.0, 3.0, 2.0, 2.0];
        let num_parts = 2;

        // Act
        let imb = imbalance(num_parts, &partition, vtx_weights);

        // Assert
        assert_ulps_eq!(imb, 0.2);
    }

    #[test]
    fn test_imbalance_of_balanced_partition_is_zero() {
        let partition = [0, 1, 0, 1];
        let weights = [1.0, 1.0, 1.0, 1.0];
        assert_ulps_eq!(imbalance(2, &partition, weights), 0.0);
    }

    #[test]
    fn test_single_pin_and_internal_edges_do_not_count() {
        use crate::hypergraph::Hypergraph;
        use crate::partitioned::PartitionedHypergraph;

        // e0 has one pin, e1 lies fully in block 0, e2 is cut.
        let hg = Hypergraph::new(4, vec![vec![0], vec![0, 1], vec![1, 2, 3]], None, None).unwrap();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 1, 1]);

        assert_eq!(km1(&phg), 1);
        assert_eq!(cut(&phg), 1);
    }
}
