//! 摘要模型命令行
//!
//! ```bash
//! summarizer build --config cfg.json --vocab-size 30000 [--train-from model.bin] [--save out.bin]
//! summarizer migrate --input legacy.bin --output model.bin
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use abstractive_summarizer::{build_optim, Checkpoint, Module, Summarizer, SummarizerConfig};

#[derive(Parser, Debug)]
#[command(name = "summarizer")]
#[command(about = "Assemble the abstractive summarization model and manage its checkpoints", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build the model (fresh or from a checkpoint) together with its optimizer
    Build(BuildArgs),

    /// Rewrite legacy layer-norm parameter names in a checkpoint
    Migrate(MigrateArgs),
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// JSON configuration file; defaults are used when omitted
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Checkpoint to resume from (overrides `train_from` in the config)
    #[arg(long, value_name = "PATH")]
    train_from: Option<PathBuf>,

    /// Vocabulary size shared by source and target
    #[arg(long)]
    vocab_size: usize,

    /// Padding token id
    #[arg(long, default_value_t = 0)]
    padding_idx: usize,

    /// Where to write the assembled checkpoint
    #[arg(long, value_name = "PATH")]
    save: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct MigrateArgs {
    #[arg(long, value_name = "PATH")]
    input: PathBuf,

    #[arg(long, value_name = "PATH")]
    output: PathBuf,
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}

fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let checkpoint = if is_json(path) {
        Checkpoint::load_json(path)
    } else {
        Checkpoint::load(path)
    };
    checkpoint.with_context(|| format!("failed to load checkpoint {}", path.display()))
}

fn save_checkpoint(checkpoint: &Checkpoint, path: &Path) -> Result<()> {
    let saved = if is_json(path) {
        checkpoint.save_json(path)
    } else {
        checkpoint.save(path)
    };
    saved.with_context(|| format!("failed to save checkpoint {}", path.display()))
}

fn run_build(args: BuildArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => SummarizerConfig::load_json(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SummarizerConfig::default(),
    };
    if let Some(path) = &args.train_from {
        config.train_from = path.display().to_string();
    }

    let checkpoint = if config.is_resuming() {
        Some(load_checkpoint(Path::new(&config.train_from))?)
    } else {
        None
    };

    let model = Summarizer::new(
        &config,
        args.padding_idx,
        args.vocab_size,
        config.device(),
        checkpoint.as_ref(),
    )
    .context("failed to build summarizer")?;
    let optim = build_optim(&config, &model, checkpoint.as_ref()).context("failed to build optimizer")?;

    info!(
        encoder = %model.encoder_kind(),
        parameters = model.num_parameters(),
        tensors = model.named_params("").len(),
        optim = %optim.method(),
        step = optim.step_count(),
        "model assembled"
    );

    if let Some(path) = &args.save {
        save_checkpoint(&model.checkpoint(Some(&optim)), path)?;
    }
    Ok(())
}

fn run_migrate(args: MigrateArgs) -> Result<()> {
    let checkpoint = load_checkpoint(&args.input)?.migrated();
    save_checkpoint(&checkpoint, &args.output)?;
    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        "migrated checkpoint"
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("abstractive_summarizer=info".parse()?))
        .init();

    match Cli::parse().command {
        Commands::Build(args) => run_build(args),
        Commands::Migrate(args) => run_migrate(args),
    }
}
