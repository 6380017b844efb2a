use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod artifact;
mod batch;
mod config;
mod convert;
mod params;
mod pipeline;
mod provision;
mod session;

use config::BatchConfig;
use convert::OutputFormat;
use pipeline::{RecordingState, CONVERSION_STEP};

#[derive(Parser, Debug)]
#[command(name = "sglx-pipeline", version, about = "Batch spike sorting for SpikeGLX recordings")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write every configuration artifact, then run the modules per recording
    Run(BatchArgs),
    /// Write configuration artifacts only
    Prepare(BatchArgs),
    /// Convert a spike time file from sample indices to seconds
    Convert {
        /// spike_times.npy or a whitespace separated text file of indices
        path: PathBuf,
        /// Sample rate in Hz; 0 reads params.py next to the input
        #[arg(long, default_value_t = 0.0)]
        sample_rate: f64,
        #[arg(long, value_enum, default_value_t = OutputFormat::Npy)]
        format: OutputFormat,
    },
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Batch file
    #[arg(long, env = "SGLX_BATCH")]
    config: PathBuf,
    /// Overrides `log_path` from the batch file
    #[arg(long, env = "SGLX_PIPELINE_LOG")]
    log: Option<PathBuf>,
    /// Overrides `json_dir` from the batch file
    #[arg(long, env = "SGLX_JSON_DIR")]
    json_dir: Option<PathBuf>,
}

impl BatchArgs {
    fn load(&self) -> anyhow::Result<BatchConfig> {
        let mut config = BatchConfig::load(&self.config)
            .with_context(|| format!("Failed to load batch {:?}", self.config))?;
        if let Some(log) = &self.log {
            config.log_path = log.clone();
        }
        if let Some(json_dir) = &self.json_dir {
            config.json_dir = json_dir.clone();
        }
        Ok(config)
    }
}

fn prepare(args: &BatchArgs) -> anyhow::Result<(BatchConfig, Vec<batch::PreparedRecording>)> {
    let config = args.load()?;

    if batch::remove_stale_tool_log(std::path::Path::new(".")).context("Failed to remove stale tool log")? {
        info!("Removed stale {}", batch::WAVEFORM_TOOL_LOG);
    }

    let prepared = batch::prepare_batch(&config).context("Configuration pass failed")?;
    Ok((config, prepared))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Prepare(args) => {
            let (_, prepared) = prepare(&args)?;
            for p in &prepared {
                info!(
                    "{} -> {:?} (modules: {:?}, keep sorter copy: {})",
                    p.context.label(),
                    p.artifact_path,
                    p.artifact.modules,
                    p.artifact.kilosort_helper_params.ks_make_copy
                );
            }
        }
        Command::Run(args) => {
            let (config, prepared) = prepare(&args)?;
            let report = batch::run_batch(&prepared, &config, &config.runner).await;

            for failed in report.failed() {
                match &failed.outcome.state {
                    RecordingState::Failed { module, reason } => {
                        error!("{} failed at {}: {}", failed.label, module, reason)
                    }
                    RecordingState::ConversionFailed { reason } => {
                        error!("{} failed at {}: {}", failed.label, CONVERSION_STEP, reason)
                    }
                    _ => {}
                }
                if let Err(e) = &failed.logged {
                    error!("{} has no run log row: {}", failed.label, e);
                }
            }

            let failed = report.failed_count();
            if failed > 0 {
                anyhow::bail!("{} of {} recordings failed", failed, report.recordings.len());
            }
            info!("All {} recordings completed; log at {:?}", report.recordings.len(), config.log_path);
        }
        Command::Convert {
            path,
            sample_rate,
            format,
        } => {
            let outcome = convert::convert(&path, sample_rate, format)
                .with_context(|| format!("Failed to convert {:?}", path))?;
            if let Some(reason) = outcome.fallback() {
                warn!("Used fallback sample rate: {}", reason);
            }
            info!("{} spike times written to {:?}", outcome.count, outcome.output_path);
        }
    }

    Ok(())
}
