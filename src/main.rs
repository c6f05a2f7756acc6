//! Command-line entry point: trains and evaluates a prompt classifier.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use prompt_peft::data::DatasetSource;
use prompt_peft::io::load_config;
use prompt_peft::{run, AdapterConfig, PipelineConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "prompt-peft",
    about = "Prompt-based LoRA fine-tuning of T5 on SuperGLUE CB"
)]
struct Cli {
    /// JSON pipeline config; defaults are used for missing sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Device to run on: cpu, cuda[:N] or metal[:N].
    #[arg(long)]
    device: Option<String>,

    /// Directory holding train.jsonl, val.jsonl and test.jsonl.
    #[arg(long)]
    dataset_dir: Option<PathBuf>,

    /// Number of training epochs.
    #[arg(long)]
    epochs: Option<usize>,

    /// Log filter, overrides RUST_LOG (e.g. "debug", "prompt_peft=trace").
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: Option<&str>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("invalid log level '{level}'"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stdout)
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    let mut config: PipelineConfig = match &cli.config {
        Some(path) => load_config(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(dir) = cli.dataset_dir {
        config.dataset.source = DatasetSource::Disk { dir };
    }
    if let Some(epochs) = cli.epochs {
        config.training.num_epochs = epochs;
    }
    config.validate().context("invalid configuration")?;

    let report = run(&config).context("pipeline failed")?;
    tracing::info!(accuracy = report.accuracy, "done");
    Ok(())
}
