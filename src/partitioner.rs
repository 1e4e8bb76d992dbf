use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::coarsening::{self, Hierarchy};
use crate::community;
use crate::context::{Context, FlowAlgorithm, FmAlgorithm, LabelPropagationAlgorithm};
use crate::error::Error;
use crate::hypergraph::Hypergraph;
use crate::initial_partitioning;
use crate::metrics;
use crate::partitioned::PartitionedHypergraph;
use crate::refinement::{flow, fm, label_propagation};
use crate::{BlockId, NodeId, Partition, Weight};

/// Summary of a finished partitioning run.
#[derive(Debug, Clone)]
pub struct PartitionOutput {
    pub objective: Weight,
    pub imbalance: f64,
    pub part_weights: Vec<Weight>,
    /// Set when the wall-clock budget expired; the partition is the last
    /// committed one.
    pub timed_out: bool,
}

/// Multilevel k-way hypergraph partitioner: community detection guides
/// coarsening, a pool of flat partitioners seeds the coarsest level, and
/// label propagation, FM and flows refine every level on the way back up.
///
/// # Example
///
/// ```rust
/// use hypercut::context::{Context, Preset};
/// use hypercut::hypergraph::Hypergraph;
/// use hypercut::partitioner::MultilevelPartitioner;
/// use hypercut::Partition;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut hg = Hypergraph::new(
///         4,
///         vec![vec![0, 1], vec![1, 2], vec![2, 3]],
///         None,
///         None,
///     )?;
///     let ctx = Context::from_preset(Preset::Speed, 2, 0.1);
///     let mut partition = vec![-1; 4];
///
///     let output = MultilevelPartitioner { ctx }.partition(&mut partition, &mut hg)?;
///     assert!(output.imbalance <= 0.1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MultilevelPartitioner {
    pub ctx: Context,
}

impl<'a> Partition<&'a mut Hypergraph> for MultilevelPartitioner {
    type Metadata = PartitionOutput;
    type Error = Error;

    fn partition(
        &mut self,
        part_ids: &mut [BlockId],
        hypergraph: &'a mut Hypergraph,
    ) -> Result<Self::Metadata, Self::Error> {
        partition_hypergraph(hypergraph, &self.ctx, part_ids)
    }
}

pub fn partition_hypergraph(
    hg: &mut Hypergraph,
    ctx: &Context,
    partition: &mut [BlockId],
) -> Result<PartitionOutput, Error> {
    ctx.validate()?;
    if partition.len() != hg.initial_num_nodes() {
        return Err(Error::InputLenMismatch {
            expected: hg.initial_num_nodes(),
            actual: partition.len(),
        });
    }

    let total_weight = hg.total_weight();
    let max_part_weight = ctx.max_part_weight(total_weight);
    let max_node_weight = hg.max_node_weight();
    if max_node_weight > max_part_weight {
        return Err(Error::Infeasible { max_node_weight, max_part_weight });
    }
    let max_part_weights = vec![max_part_weight; ctx.k as usize];
    let deadline = (ctx.time_limit > 0.0)
        .then(|| Instant::now() + Duration::from_secs_f64(ctx.time_limit));
    let start = Instant::now();

    // Preprocessing: communities confine the coarsener.
    let communities = community::detect_communities(hg, ctx);
    debug!(elapsed = ?start.elapsed(), "community detection done");

    let mut current: Vec<BlockId> = vec![crate::INVALID_BLOCK; hg.initial_num_nodes()];
    let mut timed_out = false;

    for cycle in 0..=ctx.num_vcycles {
        // Later cycles coarsen inside the current blocks instead of the
        // communities, so projection keeps the partition intact.
        let cycle_communities: Vec<NodeId> = if cycle == 0 {
            communities.clone()
        } else {
            current.iter().map(|&b| b as NodeId).collect()
        };

        let hierarchy = coarsening::coarsen(hg, &cycle_communities, ctx);
        info!(
            cycle,
            levels = hierarchy.levels.len(),
            coarse_nodes = hg.current_num_nodes(),
            "coarsening done"
        );

        if cycle == 0 {
            current = initial_partitioning::partition_coarsest(hg, ctx);
        }

        timed_out |= uncoarsen_and_refine(
            hg,
            ctx,
            &hierarchy,
            &mut current,
            &max_part_weights,
            deadline,
        );

        if timed_out {
            break;
        }
    }

    partition.copy_from_slice(&current);
    let phg = PartitionedHypergraph::new(hg, ctx.k);
    phg.apply_partition(partition);
    let output = PartitionOutput {
        objective: metrics::objective(&phg, ctx.objective),
        imbalance: metrics::imbalance_of(&phg),
        part_weights: (0..ctx.k).map(|b| phg.part_weight(b)).collect(),
        timed_out,
    };
    info!(
        objective = output.objective,
        imbalance = output.imbalance,
        elapsed = ?start.elapsed(),
        "partitioning finished"
    );
    Ok(output)
}

// Refines the coarsest level, then walks the hierarchy upwards: project the
// partition one level down, refine, repeat. On timeout the remaining levels
// are still projected so the hypergraph and partition end up consistent.
fn uncoarsen_and_refine(
    hg: &mut Hypergraph,
    ctx: &Context,
    hierarchy: &Hierarchy,
    current: &mut Vec<BlockId>,
    max_part_weights: &[Weight],
    deadline: Option<Instant>,
) -> bool {
    let mut timed_out = deadline.is_some_and(|d| Instant::now() >= d);
    if !timed_out {
        refine_level(hg, ctx, current, max_part_weights, hierarchy.levels.is_empty(), deadline);
    }

    for (index, level) in hierarchy.levels.iter().enumerate().rev() {
        coarsening::uncontract_level(hg, level, current);
        timed_out |= deadline.is_some_and(|d| Instant::now() >= d);
        if timed_out {
            continue;
        }
        let is_input_level = index == 0;
        refine_level(hg, ctx, current, max_part_weights, is_input_level, deadline);
    }
    timed_out
}

fn refine_level(
    hg: &Hypergraph,
    ctx: &Context,
    current: &mut [BlockId],
    max_part_weights: &[Weight],
    is_input_level: bool,
    deadline: Option<Instant>,
) {
    let mut phg = PartitionedHypergraph::new(hg, ctx.k);
    phg.apply_partition(current);

    if ctx.refinement.label_propagation.algorithm != LabelPropagationAlgorithm::DoNothing {
        let stats = label_propagation::refine(&phg, ctx, max_part_weights, ctx.deterministic);
        debug!(moves = stats.moves, improvement = stats.improvement, "label propagation");
    }
    if ctx.refinement.fm.algorithm != FmAlgorithm::DoNothing {
        fm::refine(&mut phg, ctx, max_part_weights, deadline);
    }
    if ctx.refinement.flows.algorithm != FlowAlgorithm::DoNothing {
        flow::refine(&phg, ctx, max_part_weights, is_input_level, deadline);
    }

    phg.extract_partition(current);
}
