use std::any::Any;
use std::path::PathBuf;

use ark_bn254::Fr;
use ark_std::UniformRand;
use clap::{Args, Parser, Subcommand, ValueEnum};
use eyre::{bail, Result, WrapErr};
use rand::{rngs::StdRng, SeedableRng};
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::{fmt::format::FmtSpan, prelude::*, EnvFilter};

use lazy_core::{
    persist::{
        shard::{check_coverage, discover_shards},
        system::{load_lazy_r1cs, read_header, write_lazy_r1cs},
        CONSTRAINT_STEM,
    },
    utils::profiling::log_memory_usage,
    CircuitBuilder, CompiledR1CS, LazyR1CS, StorageConfig,
};

/// Compacts permutation-heavy constraint systems and moves them to and from
/// sharded storage.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output formats for tracing
    #[clap(short, long, value_enum, global = true)]
    format: Option<Vec<Format>>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a hash-chain circuit, compact it and write it to disk
    Compact(CompactArgs),
    /// Load a compacted session and rebuild every constraint
    Load(LoadArgs),
    /// Check the shard files of a session without loading them
    Inspect(StorageArgs),
}

#[derive(Args, Debug, Clone)]
struct StorageArgs {
    /// Directory holding the session files
    #[clap(long, default_value = ".")]
    dir: PathBuf,

    /// File name prefix of the session
    #[clap(long, default_value = "session")]
    session: String,

    /// Rows per constraint shard
    #[clap(long, default_value_t = lazy_core::config::DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Loader threads; defaults to the available parallelism
    #[clap(long)]
    parallelism: Option<usize>,
}

impl StorageArgs {
    fn config(&self) -> StorageConfig {
        let config = StorageConfig::new(&self.dir, &self.session).with_batch_size(self.batch_size);
        match self.parallelism {
            Some(parallelism) => config.with_parallelism(parallelism),
            None => config,
        }
    }
}

#[derive(Args, Debug)]
struct CompactArgs {
    #[clap(flatten)]
    storage: StorageArgs,

    /// Gadget the circuit is built from
    #[clap(long, value_enum, default_value_t = Gadget::Poseidon)]
    gadget: Gadget,

    /// Number of chained hash calls
    #[clap(short, long, default_value_t = 1000)]
    blocks: usize,

    /// Inputs per Poseidon call (permutation width minus one)
    #[clap(long, default_value_t = 2)]
    arity: usize,

    /// Seed for the random circuit inputs
    #[clap(long, default_value_t = 0)]
    seed: u64,

    /// Compare every rebuilt constraint with the expanded system
    #[clap(long)]
    verify: bool,
}

#[derive(Args, Debug)]
struct LoadArgs {
    #[clap(flatten)]
    storage: StorageArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
enum Gadget {
    Mimc,
    Poseidon,
}

#[derive(Debug, Clone, ValueEnum, PartialEq)]
enum Format {
    Default,
    Chrome,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guards = init_tracing(cli.format.as_deref());
    match cli.command {
        Commands::Compact(args) => compact(args),
        Commands::Load(args) => load(args),
        Commands::Inspect(args) => inspect(args),
    }
}

fn init_tracing(format: Option<&[Format]>) -> Vec<Box<dyn Any>> {
    let mut layers = Vec::new();
    let log_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_filter(log_filter)
        .boxed();
    layers.push(log_layer);

    let mut guards: Vec<Box<dyn Any>> = vec![];
    if let Some(format) = format {
        if format.contains(&Format::Default) {
            let collector_layer = tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .compact()
                .with_target(false)
                .boxed();
            layers.push(collector_layer);
        }
        if format.contains(&Format::Chrome) {
            let (chrome_layer, guard) = ChromeLayerBuilder::new().include_args(true).build();
            layers.push(chrome_layer.boxed());
            guards.push(Box::new(guard));
        }
    }

    tracing_subscriber::registry().with(layers).init();
    guards
}

fn build_circuit(args: &CompactArgs) -> Result<CompiledR1CS<Fr>> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut builder = CircuitBuilder::<Fr>::new();
    let digest = match args.gadget {
        Gadget::Mimc => {
            let blocks = (0..args.blocks)
                .map(|_| builder.secret_input(Fr::rand(&mut rng)))
                .collect::<Result<Vec<_>, _>>()?;
            builder.mimc_hash(&blocks)?
        }
        Gadget::Poseidon => {
            let mut state = builder.secret_input(Fr::rand(&mut rng))?;
            for _ in 0..args.blocks {
                let mut inputs = vec![state];
                for _ in 1..args.arity {
                    inputs.push(builder.secret_input(Fr::rand(&mut rng))?);
                }
                state = builder.poseidon_hash(&inputs)?;
            }
            state
        }
    };
    let value = builder.value_of(&digest)?;
    let exposed = builder.public_input(value)?;
    builder.assert_equal(&exposed, &digest)?;
    Ok(builder.finish())
}

fn compact(args: CompactArgs) -> Result<()> {
    let config = args.storage.config();
    config.validate()?;

    let compiled = build_circuit(&args).wrap_err("failed to build the circuit")?;
    log_memory_usage("after building the expanded system");
    let expanded = args.verify.then(|| compiled.constraints.clone());
    let witness = compiled.witness.clone();

    let lazy = LazyR1CS::lazify(compiled)?;
    log_memory_usage("after lazification");
    if let Some(first) = lazy.is_satisfied(&witness)? {
        bail!("witness violates constraint {first}");
    }
    if let Some(expanded) = expanded {
        lazy.verify_against(&expanded)?;
        tracing::info!("all {} constraints rebuild exactly", expanded.len());
    }

    let shards = write_lazy_r1cs(&lazy, &config)?;
    println!(
        "{} constraints ({} direct, {} lazy via {} templates of {} rows total) in {} constraint shards",
        lazy.total_constraint_count(),
        lazy.direct_constraint_count(),
        lazy.lazy_constraint_count(),
        lazy.shape_count(),
        lazy.expanded_lazy_constraint_count(),
        shards.len()
    );
    Ok(())
}

fn load(args: LoadArgs) -> Result<()> {
    let config = args.storage.config();
    let lazy = load_lazy_r1cs::<Fr>(&config)
        .wrap_err_with(|| format!("failed to load session {}", config.session))?;
    let rows = lazy.par_expand()?;
    log_memory_usage("after expanding every constraint");
    println!(
        "loaded {} constraints from {} instances of {} shapes",
        rows.len(),
        lazy.instance_count(),
        lazy.shape_count()
    );
    Ok(())
}

fn inspect(args: StorageArgs) -> Result<()> {
    let config = args.config();
    let header = read_header::<Fr>(&config)?;
    let shards = discover_shards(&config.dir, &config.session, CONSTRAINT_STEM)?;
    check_coverage(&shards, header.direct_constraints)?;
    if shards.iter().any(|s| s.len() > header.batch_size) {
        bail!("a shard exceeds the recorded batch size {}", header.batch_size);
    }
    println!(
        "session {}: {} constraints, {} stored directly in {} shards of up to {} rows",
        config.session,
        header.total_constraints,
        header.direct_constraints,
        shards.len(),
        header.batch_size
    );
    Ok(())
}
