use crate::error::Error;
use crate::Weight;

/// Objective function minimized by the partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Objective {
    /// Total weight of hyperedges spanning at least two blocks.
    Cut,
    /// Connectivity metric: sum of w(e) * (|connectivity(e)| - 1).
    Km1,
}

/// Tuning presets. `Deterministic` additionally guarantees bit-identical
/// results for the same input, seed and thread count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Speed,
    HighQuality,
    Deterministic,
}

/// Arc weight assigned when deriving the clustering graph from a hypergraph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeWeightFunction {
    /// w(e)
    Uniform,
    /// w(e) / |e|
    NonUniform,
    /// w(e) * deg(v) / |e|
    Degree,
}

/// Score of a potential contraction partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingFunction {
    /// sum over shared nets of w(e) / (|e| - 1)
    HeavyEdge,
}

/// Penalty applied to the coarsening rating of a heavy vertex pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeavyNodePenalty {
    Multiplicative,
    Additive,
    None,
}

/// How the coarsener picks among equally rated contraction partners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptancePolicy {
    /// Highest rating wins, ties broken randomly.
    BestRating,
    /// Highest rating wins, but unmatched partners are preferred.
    BestRatingPreferUnmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelPropagationAlgorithm {
    LabelPropagationKm1,
    DoNothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FmAlgorithm {
    MultiTryKwayFm,
    DoNothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAlgorithm {
    FlowCut,
    DoNothing,
}

#[derive(Debug, Clone)]
pub struct CommunityDetectionParams {
    pub edge_weight_function: EdgeWeightFunction,
    pub max_pass_iterations: usize,
    pub min_vertex_move_fraction: f64,
    pub vertex_degree_sampling_threshold: usize,
    pub num_sub_rounds_deterministic: usize,
    pub low_memory_contraction: bool,
}

#[derive(Debug, Clone)]
pub struct RatingParams {
    pub rating_function: RatingFunction,
    pub heavy_node_penalty: HeavyNodePenalty,
    pub acceptance_policy: AcceptancePolicy,
}

#[derive(Debug, Clone)]
pub struct CoarseningParams {
    pub contraction_limit_multiplier: usize,
    pub max_allowed_weight_multiplier: f64,
    pub minimum_shrink_factor: f64,
    pub maximum_shrink_factor: f64,
    pub rating: RatingParams,
}

#[derive(Debug, Clone)]
pub struct InitialPartitioningParams {
    pub runs: usize,
    pub use_adaptive_ip_runs: bool,
    pub min_adaptive_ip_runs: usize,
    pub perform_refinement_on_best_partitions: bool,
    pub fm_refinement_rounds: usize,
    pub population_size: usize,
}

#[derive(Debug, Clone)]
pub struct LabelPropagationParams {
    pub algorithm: LabelPropagationAlgorithm,
    pub maximum_iterations: usize,
    pub hyperedge_size_activation_threshold: usize,
}

#[derive(Debug, Clone)]
pub struct FmParams {
    pub algorithm: FmAlgorithm,
    pub multitry_rounds: usize,
    pub num_seed_nodes: usize,
    pub rollback_balance_violation_factor: f64,
    pub min_improvement: f64,
    pub time_limit_factor: f64,
    pub perform_moves_global: bool,
    pub rollback_parallel: bool,
    pub obey_minimal_parallelism: bool,
    pub release_nodes: bool,
}

#[derive(Debug, Clone)]
pub struct FlowParams {
    pub algorithm: FlowAlgorithm,
    pub alpha: f64,
    pub max_num_pins: usize,
    pub find_most_balanced_cut: bool,
    pub parallel_searches_multiplier: f64,
    pub num_threads_per_search: usize,
    pub max_bfs_distance: usize,
    pub min_relative_improvement_per_round: f64,
    pub time_limit_factor: f64,
    pub skip_small_cuts: bool,
    pub skip_unpromising_blocks: bool,
    pub pierce_in_bulk: bool,
}

#[derive(Debug, Clone)]
pub struct RefinementParams {
    pub label_propagation: LabelPropagationParams,
    pub fm: FmParams,
    pub flows: FlowParams,
}

/// Complete configuration of a partitioning run, threaded through all
/// components instead of global state.
#[derive(Debug, Clone)]
pub struct Context {
    pub k: i32,
    pub epsilon: f64,
    pub objective: Objective,
    pub seed: u64,
    pub num_vcycles: usize,
    pub num_threads: usize,
    pub deterministic: bool,
    /// Wall-clock budget in seconds. `0.0` disables the budget.
    pub time_limit: f64,
    pub community_detection: CommunityDetectionParams,
    pub coarsening: CoarseningParams,
    pub initial_partitioning: InitialPartitioningParams,
    pub refinement: RefinementParams,
}

impl Context {
    pub fn from_preset(preset: Preset, k: i32, epsilon: f64) -> Self {
        let mut ctx = Context {
            k,
            epsilon,
            objective: Objective::Km1,
            seed: 0,
            num_vcycles: 0,
            num_threads: rayon::current_num_threads(),
            deterministic: false,
            time_limit: 0.0,
            community_detection: CommunityDetectionParams {
                edge_weight_function: EdgeWeightFunction::Uniform,
                max_pass_iterations: 5,
                min_vertex_move_fraction: 0.01,
                vertex_degree_sampling_threshold: 200_000,
                num_sub_rounds_deterministic: 16,
                low_memory_contraction: false,
            },
            coarsening: CoarseningParams {
                contraction_limit_multiplier: 160,
                max_allowed_weight_multiplier: 1.0,
                minimum_shrink_factor: 1.01,
                maximum_shrink_factor: 2.5,
                rating: RatingParams {
                    rating_function: RatingFunction::HeavyEdge,
                    heavy_node_penalty: HeavyNodePenalty::None,
                    acceptance_policy: AcceptancePolicy::BestRatingPreferUnmatched,
                },
            },
            initial_partitioning: InitialPartitioningParams {
                runs: 5,
                use_adaptive_ip_runs: true,
                min_adaptive_ip_runs: 5,
                perform_refinement_on_best_partitions: true,
                fm_refinement_rounds: 3,
                population_size: 16,
            },
            refinement: RefinementParams {
                label_propagation: LabelPropagationParams {
                    algorithm: LabelPropagationAlgorithm::LabelPropagationKm1,
                    maximum_iterations: 5,
                    hyperedge_size_activation_threshold: 100,
                },
                fm: FmParams {
                    algorithm: FmAlgorithm::MultiTryKwayFm,
                    multitry_rounds: 10,
                    num_seed_nodes: 25,
                    rollback_balance_violation_factor: 0.0,
                    min_improvement: 0.001,
                    time_limit_factor: 0.25,
                    perform_moves_global: false,
                    rollback_parallel: true,
                    obey_minimal_parallelism: true,
                    release_nodes: true,
                },
                flows: FlowParams {
                    algorithm: FlowAlgorithm::DoNothing,
                    alpha: 16.0,
                    max_num_pins: 4_000_000,
                    find_most_balanced_cut: true,
                    parallel_searches_multiplier: 1.0,
                    num_threads_per_search: 1,
                    max_bfs_distance: 2,
                    min_relative_improvement_per_round: 0.001,
                    time_limit_factor: 8.0,
                    skip_small_cuts: true,
                    skip_unpromising_blocks: true,
                    pierce_in_bulk: true,
                },
            },
        };

        match preset {
            Preset::Speed => {}
            Preset::HighQuality => {
                ctx.initial_partitioning.runs = 20;
                ctx.refinement.flows.algorithm = FlowAlgorithm::FlowCut;
                ctx.coarsening.rating.heavy_node_penalty = HeavyNodePenalty::Multiplicative;
            }
            Preset::Deterministic => {
                ctx.deterministic = true;
                ctx.initial_partitioning.use_adaptive_ip_runs = false;
                ctx.refinement.fm.perform_moves_global = true;
            }
        }
        ctx
    }

    pub fn parse_preset(name: &str) -> Result<Preset, Error> {
        match name {
            "speed" => Ok(Preset::Speed),
            "high_quality" => Ok(Preset::HighQuality),
            "deterministic" => Ok(Preset::Deterministic),
            other => Err(Error::InvalidInput(format!("unknown preset '{other}'"))),
        }
    }

    pub fn parse_objective(name: &str) -> Result<Objective, Error> {
        match name {
            "cut" => Ok(Objective::Cut),
            "km1" => Ok(Objective::Km1),
            other => Err(Error::InvalidInput(format!("unknown objective '{other}'"))),
        }
    }

    /// Validates the static part of the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.k < 2 {
            return Err(Error::InvalidInput(format!("k must be >= 2, got {}", self.k)));
        }
        if self.epsilon <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "epsilon must be > 0, got {}", self.epsilon
            )));
        }
        if self.num_threads < 1 {
            return Err(Error::InvalidInput("num_threads must be >= 1".to_string()));
        }
        Ok(())
    }

    /// Perfect block weight: ceil(total / k).
    pub fn perfect_part_weight(&self, total_weight: Weight) -> Weight {
        (total_weight + self.k as Weight - 1) / self.k as Weight
    }

    /// Maximum admissible block weight: (1 + epsilon) * ceil(total / k).
    pub fn max_part_weight(&self, total_weight: Weight) -> Weight {
        ((1.0 + self.epsilon) * self.perfect_part_weight(total_weight) as f64).floor() as Weight
    }

    /// Coarsening stops below this many vertices.
    pub fn contraction_limit(&self) -> usize {
        self.k as usize * self.coarsening.contraction_limit_multiplier
    }

    /// Heaviest vertex the coarsener may form.
    pub fn max_allowed_node_weight(&self, total_weight: Weight) -> Weight {
        let limit = self.contraction_limit().max(1) as f64;
        (self.coarsening.max_allowed_weight_multiplier * total_weight as f64 / limit)
            .ceil()
            .max(1.0) as Weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_parsing() {
        assert_eq!(Context::parse_preset("speed").unwrap(), Preset::Speed);
        assert_eq!(
            Context::parse_preset("deterministic").unwrap(),
            Preset::Deterministic
        );
        assert!(Context::parse_preset("warp").is_err());
    }

    #[test]
    fn test_validation_rejects_bad_k_and_epsilon() {
        let mut ctx = Context::from_preset(Preset::Speed, 2, 0.03);
        assert!(ctx.validate().is_ok());
        ctx.k = 1;
        assert!(ctx.validate().is_err());
        ctx.k = 4;
        ctx.epsilon = 0.0;
        assert!(ctx.validate().is_err());
    }

    #[test]
    fn test_part_weight_bounds() {
        let ctx = Context::from_preset(Preset::Speed, 2, 0.03);
        // total weight 7, k = 2: perfect = 4, max = floor(4.12) = 4
        assert_eq!(ctx.perfect_part_weight(7), 4);
        assert_eq!(ctx.max_part_weight(7), 4);
    }
}
