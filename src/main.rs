use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;

use hypercut::context::Context;
use hypercut::io;
use hypercut::partitioner::MultilevelPartitioner;
use hypercut::Partition;

/// Shared-memory multilevel k-way hypergraph partitioner.
#[derive(Parser, Debug)]
#[command(name = "hypercut", version, about)]
struct Args {
    /// Input hypergraph (hMETIS format) or graph (METIS format).
    hypergraph: PathBuf,

    /// Number of blocks.
    #[arg(short, long)]
    k: i32,

    /// Allowed imbalance, e.g. 0.03.
    #[arg(short, long, default_value_t = 0.03)]
    epsilon: f64,

    /// Objective function: cut or km1.
    #[arg(short, long, default_value = "km1")]
    objective: String,

    /// Preset: speed, high_quality or deterministic.
    #[arg(short, long, default_value = "speed")]
    preset: String,

    /// Random seed.
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Number of worker threads (defaults to all cores).
    #[arg(short = 't', long)]
    threads: Option<usize>,

    /// Number of v-cycles after the first multilevel cycle.
    #[arg(long, default_value_t = 0)]
    vcycles: usize,

    /// Wall-clock budget in seconds (0 disables it).
    #[arg(long, default_value_t = 0.0)]
    time_limit: f64,

    /// Parse the input as a METIS graph file instead of hMETIS.
    #[arg(long)]
    graph_input: bool,

    /// Write the partition to this file, one block id per line.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::from_default_env(),
    ).init();
    let args = Args::parse();

    let preset = Context::parse_preset(&args.preset)?;
    let mut ctx = Context::from_preset(preset, args.k, args.epsilon);
    ctx.objective = Context::parse_objective(&args.objective)?;
    ctx.seed = args.seed;
    ctx.num_vcycles = args.vcycles;
    ctx.time_limit = args.time_limit;
    if let Some(threads) = args.threads {
        ctx.num_threads = threads;
        rayon::ThreadPoolBuilder::new().num_threads(threads).build_global()?;
    }

    let is_graph = args.graph_input
        || matches!(
            args.hypergraph.extension().and_then(|e| e.to_str()),
            Some("graph" | "metis")
        );
    let mut hypergraph = if is_graph {
        io::read_metis_file(&args.hypergraph)?
    } else {
        io::read_hmetis_file(&args.hypergraph)?
    };

    let mut partition = vec![-1; hypergraph.initial_num_nodes()];
    let start = Instant::now();
    let output = MultilevelPartitioner { ctx }.partition(&mut partition, &mut hypergraph)?;
    let elapsed = start.elapsed();

    println!("Objective      {}", output.objective);
    println!("Imbalance      {:.6}", output.imbalance);
    println!("Block weights  {:?}", output.part_weights);
    println!("Execution time {elapsed:?}");
    if output.timed_out {
        println!("Time limit hit; returned the last committed partition");
    }

    if let Some(path) = args.output {
        io::write_partition(&path, &partition)?;
    }
    Ok(())
}
