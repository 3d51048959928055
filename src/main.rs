//! Infinite Listener CLI
//!
//! Command-line interface for initializing, training and inspecting codebooks.

use clap::{Args, Parser, Subcommand};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use infinite_listener::storage::checkpoint;
use infinite_listener::training::install_interrupt_handler;
use infinite_listener::{
    evaluate, CheckpointStore, Checkpoint, Codebook, DataSource, ListenerError, MatFilesOracle, Model,
    ModelKind, PatternSpec, Quantizer, Result, RunParameters, Trainer,
};
use log::{error, info};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "listener")]
#[command(version)]
#[command(about = "Online vector quantization of chroma patterns", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// How songs are cut into patterns.
#[derive(Args, Clone)]
struct PatternArgs {
    /// Beats per pattern
    #[arg(long, default_value = "8")]
    pattern_size: usize,

    /// Bars per pattern (0 = fixed beat windows)
    #[arg(long, default_value = "2")]
    bars: usize,

    /// Disable per-pattern key invariance
    #[arg(long)]
    no_key_inv: bool,

    /// Rotate whole songs instead of single patterns
    #[arg(long)]
    song_key_inv: bool,

    /// Keep negative values
    #[arg(long)]
    not_positive: bool,

    /// Pad or crop patterns instead of resampling them
    #[arg(long)]
    dont_resample: bool,
}

impl From<PatternArgs> for PatternSpec {
    fn from(args: PatternArgs) -> Self {
        PatternSpec {
            pattern_size: args.pattern_size,
            bars: args.bars,
            key_invariance: !args.no_key_inv,
            song_key_invariance: args.song_key_inv,
            positive: !args.not_positive,
            resample: !args.dont_resample,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Build a random codebook from feature files
    Init {
        /// Output codebook file
        output: PathBuf,

        /// Directory of feature files
        #[arg(long)]
        oracle_dir: PathBuf,

        /// Number of codewords
        #[arg(short = 'n', long)]
        codes: usize,

        #[command(flatten)]
        patterns: PatternArgs,

        /// Random seed for reproducibility
        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Train a codebook, from scratch or from a checkpoint
    Train {
        /// Experiment directory receiving checkpoints
        exp_dir: PathBuf,

        /// Codebook file to start from
        #[arg(long, conflicts_with = "resume", required_unless_present = "resume")]
        codebook: Option<PathBuf>,

        /// Checkpoint directory to resume from
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Directory of feature files (overrides the checkpoint's on resume)
        #[arg(long, required_unless_present = "resume")]
        oracle_dir: Option<PathBuf>,

        /// Data source
        #[arg(long, default_value = "mat")]
        oracle: DataSource,

        #[command(flatten)]
        patterns: PatternArgs,

        /// Learning rate
        #[arg(long, default_value = "1e-5")]
        lrate: f64,

        /// Total iteration budget over the checkpoint chain
        #[arg(long)]
        max_iter: Option<u64>,

        /// Oracle threads
        #[arg(short = 'j', long, default_value = "4")]
        threads: usize,

        /// Model variant (vq, vqfilt)
        #[arg(long, default_value = "vq")]
        model: ModelKind,

        /// Random seed
        #[arg(short, long)]
        seed: Option<u64>,
    },

    /// Show the chain, totals and parameters of a checkpoint
    Analyze {
        /// Checkpoint directory
        checkpoint: PathBuf,
    },

    /// Delete redundant checkpoints next to the most recent one
    Trim {
        /// Most recent checkpoint of the experiment
        latest: PathBuf,

        /// Only print what would be removed
        #[arg(long)]
        dry_run: bool,

        /// Also remove checkpoints interrupted mid-save
        #[arg(long)]
        purge_incomplete: bool,
    },

    /// Score a checkpoint on one pass over feature files
    Evaluate {
        /// Checkpoint directory
        checkpoint: PathBuf,

        /// Directory of feature files
        data_dir: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    }

    let result = match cli.command {
        Commands::Init {
            output,
            oracle_dir,
            codes,
            patterns,
            seed,
        } => init_codebook(output, oracle_dir, codes, patterns.into(), seed).map(|_| 0),

        Commands::Train {
            exp_dir,
            codebook,
            resume,
            oracle_dir,
            oracle,
            patterns,
            lrate,
            max_iter,
            threads,
            model,
            seed,
        } => {
            let store = CheckpointStore::new(exp_dir);
            match (resume, codebook, oracle_dir) {
                (Some(dir), _, data_dir) => Trainer::resume(store, dir, data_dir),
                (None, Some(file), Some(data_dir)) => {
                    let params = RunParameters {
                        patterns: patterns.into(),
                        lrate,
                        n_threads: threads,
                        data_source: oracle,
                        data_dir,
                        max_iterations: max_iter,
                        model,
                        seed,
                        codebook: Some(file.clone()),
                        predecessor: None,
                    };
                    Codebook::load(&file)
                        .and_then(|cb| Trainer::new(store, Model::new(model, cb, seed), params))
                }
                (None, None, _) => Err(ListenerError::Config(
                    "either --codebook or --resume is required".to_string(),
                )),
                (None, Some(_), None) => Err(ListenerError::Config(
                    "--oracle-dir is required when starting from a codebook".to_string(),
                )),
            }
            .and_then(train)
        }

        Commands::Analyze { checkpoint } => analyze(checkpoint).map(|_| 0),

        Commands::Trim {
            latest,
            dry_run,
            purge_incomplete,
        } => trim(latest, dry_run, purge_incomplete).map(|_| 0),

        Commands::Evaluate {
            checkpoint,
            data_dir,
        } => evaluate_checkpoint(checkpoint, data_dir).map(|_| 0),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{msg}\n{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) ETA: {eta}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓▒░  ")
}

fn init_codebook(
    output: PathBuf,
    oracle_dir: PathBuf,
    codes: usize,
    spec: PatternSpec,
    seed: Option<u64>,
) -> Result<()> {
    let start_time = Instant::now();
    let dim = spec.dimension();
    let mut oracle = MatFilesOracle::new(&oracle_dir, spec, seed)?;
    let mut rng = match seed {
        Some(s) => ChaCha8Rng::seed_from_u64(s),
        None => ChaCha8Rng::from_entropy(),
    };

    let pb = ProgressBar::new(codes as u64);
    pb.set_style(bar_style());
    pb.set_message(format!("Drawing {} codewords from {} files...", codes, oracle.len()));

    let codebook = Codebook::init_random(&mut oracle, codes, dim, &mut rng, Some(&pb))?;
    pb.finish_and_clear();

    codebook.save(&output)?;
    println!("✓ Saved codebook to {}", output.display());
    println!("   Codewords: {} x {}", codebook.n_codes(), codebook.dim());
    println!("   Done in {}", HumanDuration(start_time.elapsed()));
    Ok(())
}

fn train(mut trainer: Trainer) -> Result<i32> {
    let start_time = Instant::now();
    install_interrupt_handler(trainer.interrupt_flag())?;

    let params = trainer.params().clone();
    info!(
        "Training {} model, lrate {}, {} threads, data from {}",
        params.model,
        params.lrate,
        params.n_threads,
        params.data_dir.display()
    );
    let mut oracle = infinite_listener::oracle::from_params(&params)?;

    let termination = trainer.run(&mut oracle);

    println!();
    println!("Training stopped ({}) after {}", termination, HumanDuration(start_time.elapsed()));
    println!("   Iterations: {} ({} this run)", trainer.global_iterations(), trainer.stats().n_iterations);
    println!("   Patterns this run: {}", trainer.stats().n_patterns);
    if let Some(d) = trainer.recent_distortion() {
        println!("   Recent distortion: {:.6}", d);
    }
    if let Some(path) = trainer.last_checkpoint() {
        println!("   Last checkpoint: {}", path.display());
    }

    Ok(termination.exit_code())
}

fn analyze(dir: PathBuf) -> Result<()> {
    let saved = Checkpoint::load(&dir)?;
    let chain = checkpoint::traceback(&dir)?;
    let totals = checkpoint::load_chain_stats(&dir)?;

    println!("Checkpoint: {}", dir.display());
    println!("  Traceback:");
    for link in &chain {
        println!("    {}", link.display());
    }
    println!("  Total iterations: {}", totals.iterations);
    println!("  Total patterns: {}", totals.patterns);
    println!("  Total wall time: {}", HumanDuration(totals.wall_time));
    println!(
        "  Model: {} ({} codewords of dimension {})",
        saved.model.kind(),
        saved.model.codebook().n_codes(),
        saved.model.codebook().dim()
    );
    if let Some((received, used)) = saved.model.filter_counts() {
        println!("  Filter: kept {} of {} patterns", used, received);
    }
    println!("  Parameters: {:#?}", saved.params);
    Ok(())
}

fn trim(latest: PathBuf, dry_run: bool, purge_incomplete: bool) -> Result<()> {
    let root = latest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let store = CheckpointStore::new(root);

    if purge_incomplete {
        let broken = store.incomplete()?;
        for dir in &broken {
            println!("incomplete: {}", dir.display());
        }
        if !dry_run {
            store.purge_incomplete()?;
        }
    }

    let plan = store.plan_trim(&latest)?;
    for dir in &plan {
        println!("remove: {}", dir.display());
    }
    if dry_run {
        println!("Dry run, {} checkpoints would be removed", plan.len());
    } else {
        store.remove(&plan)?;
        println!("✓ Removed {} checkpoints", plan.len());
    }
    Ok(())
}

fn evaluate_checkpoint(dir: PathBuf, data_dir: PathBuf) -> Result<()> {
    let saved = Checkpoint::load(&dir)?;
    let totals = checkpoint::load_chain_stats(&dir)?;
    let mut oracle = MatFilesOracle::new(&data_dir, saved.params.patterns.clone(), None)?.one_pass();

    let pb = ProgressBar::new(oracle.len() as u64);
    pb.set_style(bar_style());
    pb.set_message(format!("Scoring {} files...", oracle.len()));
    let eval = evaluate(&saved.model, &mut oracle, Some(&pb))?;
    pb.finish_and_clear();

    println!("Checkpoint: {}", dir.display());
    println!("  Trained for {} iterations on {} patterns", totals.iterations, totals.patterns);
    println!("  Tracks scored: {}", eval.tracks);
    println!("  Patterns scored: {}", eval.patterns);
    match eval.mean_distortion {
        Some(d) => println!("  Mean distortion: {:.6}", d),
        None => println!("  Mean distortion: n/a (no patterns)"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fresh_training_needs_data_dir() {
        assert!(Cli::try_parse_from(["listener", "train", "exp", "--codebook", "cb.matrix"]).is_err());
        assert!(Cli::try_parse_from([
            "listener",
            "train",
            "exp",
            "--codebook",
            "cb.matrix",
            "--oracle-dir",
            "features",
        ])
        .is_ok());
        assert!(Cli::try_parse_from(["listener", "train", "exp", "--resume", "exp/exp_1"]).is_ok());
    }
}
