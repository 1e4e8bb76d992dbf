use crate::partitioned::{km1_delta, PartitionedHypergraph};
use crate::refinement::pq::IndexedMaxHeap;
use crate::refinement::Move;
use crate::{Gain, NodeId, Weight};

/// Sequential 2-way FM used to polish bisections. Each pass moves vertices
/// in best-gain order (every vertex at most once), tracks the best seen
/// prefix and rolls the tail back. Passes repeat until one of them fails to
/// improve or `rounds` is exhausted. Returns the total improvement.
pub fn refine(
    phg: &PartitionedHypergraph,
    max_part_weights: &[Weight],
    rounds: usize,
) -> Gain {
    debug_assert_eq!(phg.k(), 2);
    let mut total_improvement = 0;
    for _ in 0..rounds {
        let improvement = single_pass(phg, max_part_weights);
        total_improvement += improvement;
        if improvement <= 0 {
            break;
        }
    }
    total_improvement
}

fn single_pass(phg: &PartitionedHypergraph, max_part_weights: &[Weight]) -> Gain {
    let hg = phg.hypergraph();
    let mut pqs = [IndexedMaxHeap::new(), IndexedMaxHeap::new()];
    for u in hg.nodes() {
        let from = phg.part_id(u);
        let to = 1 - from;
        pqs[to as usize].push(u, phg.compute_gain(u, to));
    }

    let mut moves: Vec<Move> = Vec::new();
    let mut cumulative = 0;
    let mut best_improvement = 0;
    let mut best_prefix = 0;
    let mut best_heaviest = phg.heaviest_part_and_weight().1;
    // Moves whose target block is full right now; retried once weights move.
    let mut deferred: Vec<(NodeId, i32)> = Vec::new();

    loop {
        let Some((node, to, gain)) = extract_best(phg, &mut pqs, max_part_weights, &mut deferred)
        else {
            break;
        };
        let from = phg.part_id(node);

        let mut attributed = 0;
        let moved = phg.change_node_part(
            node,
            from,
            to,
            max_part_weights[to as usize],
            || {},
            |_, we, _, pcf, pct| attributed += km1_delta(we, pcf, pct),
        );
        if !moved {
            continue;
        }
        debug_assert_eq!(-attributed, gain);
        for (n, t) in deferred.drain(..) {
            pqs[t as usize].push(n, phg.compute_gain(n, t));
        }

        cumulative += -attributed;
        moves.push(Move { node, from, to, gain: -attributed });
        let heaviest = phg.heaviest_part_and_weight().1;
        if cumulative > best_improvement
            || (cumulative == best_improvement && heaviest < best_heaviest)
        {
            best_improvement = cumulative;
            best_prefix = moves.len();
            best_heaviest = heaviest;
        }

        // Gains of the neighborhood may have changed.
        for e in hg.incident_edges(node) {
            for &p in hg.pins(e) {
                let p_from = phg.part_id(p);
                let p_to = 1 - p_from;
                if pqs[p_to as usize].contains(p) {
                    pqs[p_to as usize].update_key(p, phg.compute_gain(p, p_to));
                }
            }
        }
    }

    // Roll back to the best prefix.
    for m in moves[best_prefix..].iter().rev() {
        let undone = phg.change_node_part(m.node, m.to, m.from, Weight::MAX, || {}, |_, _, _, _, _| {});
        debug_assert!(undone);
    }

    best_improvement
}

// Highest-gain move over both priority queues whose target block can take
// the vertex. Stale keys are refreshed on extraction; moves that do not fit
// are parked in `deferred` until the next applied move frees up weight.
fn extract_best(
    phg: &PartitionedHypergraph,
    pqs: &mut [IndexedMaxHeap; 2],
    max_part_weights: &[Weight],
    deferred: &mut Vec<(NodeId, i32)>,
) -> Option<(NodeId, i32, Gain)> {
    loop {
        let mut best: Option<(usize, NodeId, Gain)> = None;
        for (to, pq) in pqs.iter().enumerate() {
            if let Some((node, gain)) = pq.top() {
                if best.map_or(true, |(_, _, g)| gain > g) {
                    best = Some((to, node, gain));
                }
            }
        }
        let (to, node, gain) = best?;

        let fresh = phg.compute_gain(node, to as i32);
        if fresh != gain {
            pqs[to].update_key(node, fresh);
            continue;
        }
        pqs[to].remove(node);
        let weight = phg.hypergraph().node_weight(node);
        if phg.part_weight(to as i32) + weight > max_part_weights[to] {
            deferred.push((node, to as i32));
            continue;
        }
        return Some((node, to as i32, gain));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypergraph::Hypergraph;
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
    fn test_pass_improves_bad_bisection() {
        let hg = toy();
        let phg = PartitionedHypergraph::new(&hg, 2);
        // Deliberately poor split: km1 = 3.
        phg.apply_partition(&[0, 1, 0, 1, 0, 1, 0]);
        let before = km1(&phg);
        assert_eq!(before, 3);

        let improvement = refine(&phg, &[4, 4], 5);

        let after = km1(&phg);
        assert_eq!(before - improvement, after);
        assert_eq!(after, 2);
        assert!(phg.part_weight(0) <= 4 && phg.part_weight(1) <= 4);
    }

    #[test]
    fn test_no_improvement_round_is_a_no_op() {
        let hg = toy();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[0, 0, 1, 0, 0, 1, 1]);
        assert_eq!(km1(&phg), 2);
        let parts_before: Vec<_> = (0..7).map(|u| phg.part_id(u)).collect();
        let weights_before = [phg.part_weight(0), phg.part_weight(1)];

        let improvement = refine(&phg, &[4, 4], 3);

        assert_eq!(improvement, 0);
        let parts_after: Vec<_> = (0..7).map(|u| phg.part_id(u)).collect();
        assert_eq!(parts_before, parts_after);
        assert_eq!(weights_before, [phg.part_weight(0), phg.part_weight(1)]);
        for e in hg.edges() {
            let total: u32 = (0..2).map(|b| phg.pin_count_in_part(e, b)).sum();
            assert_eq!(total as usize, hg.edge_size(e));
        }
    }

    #[test]
    fn test_improvement_never_negative() {
        let hg = toy();
        let phg = PartitionedHypergraph::new(&hg, 2);
        phg.apply_partition(&[1, 0, 1, 0, 1, 0, 1]);
        let before = km1(&phg);

        let improvement = refine(&phg, &[4, 4], 5);

        assert!(improvement >= 0);
        assert!(km1(&phg) <= before);
    }
}
