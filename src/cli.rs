use crate::{Config, ConfigError, CounterKind, Pipeline};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "image-color-counter")]
#[command(about = "Finds the three most frequent colors of images listed in a file")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable debug logging")]
    pub debug: bool,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        env = "IMAGE_COLOR_COUNTER_METRICS_LISTEN",
        help = "Serve Prometheus metrics on this address"
    )]
    pub metrics_listen: Option<SocketAddr>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Process every URL in the input file
    Start(StartArgs),

    /// Validate a configuration file and print the effective settings
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct StartArgs {
    #[arg(long, env = "IMAGE_COLOR_COUNTER_DWORKERS", help = "Number of download workers")]
    pub dworkers: Option<usize>,

    #[arg(long, env = "IMAGE_COLOR_COUNTER_PWORKERS", help = "Number of processing workers")]
    pub pworkers: Option<usize>,

    #[arg(short, long, env = "IMAGE_COLOR_COUNTER_INPUT", help = "Input file with one URL per line")]
    pub input: Option<PathBuf>,

    #[arg(short, long, env = "IMAGE_COLOR_COUNTER_OUTPUT", help = "Result CSV file")]
    pub output: Option<PathBuf>,

    #[arg(
        long,
        env = "IMAGE_COLOR_COUNTER_MAX_CONNS_PER_HOST",
        help = "Maximum concurrent connections to one host"
    )]
    pub max_conns_per_host: Option<usize>,

    #[arg(
        long,
        env = "IMAGE_COLOR_COUNTER_READ_TIMEOUT",
        help = "Per-request timeout in seconds"
    )]
    pub read_timeout: Option<u64>,

    #[arg(
        long,
        env = "IMAGE_COLOR_COUNTER_OUTPUT_BUFFER",
        help = "Lines buffered before the output is flushed"
    )]
    pub output_buffer: Option<usize>,

    #[arg(
        long,
        env = "IMAGE_COLOR_COUNTER_COUNTER",
        help = "Counting strategy (raw, walk)"
    )]
    pub counter: Option<CounterKind>,
}

impl StartArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(workers) = self.dworkers {
            config.download_workers = workers;
        }
        if let Some(workers) = self.pworkers {
            config.processing_workers = workers;
        }
        if let Some(input) = &self.input {
            config.input_path = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_path = output.clone();
        }
        if let Some(max) = self.max_conns_per_host {
            config.max_conns_per_host = max;
        }
        if let Some(timeout) = self.read_timeout {
            config.read_timeout = Duration::from_secs(timeout);
        }
        if let Some(size) = self.output_buffer {
            config.output_buffer_size = size;
        }
        if let Some(counter) = self.counter {
            config.counter = counter;
        }
    }
}

pub struct CliRunner {
    pub config: Config,
}

impl CliRunner {
    /// Loads the optional config file and applies command-line overrides.
    pub async fn new(args: &Cli) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => load_config(path).await?,
            None => Config::default(),
        };

        if let Commands::Start(start) = &args.command {
            start.apply(&mut config);
        }
        config.debug |= args.debug;

        Ok(Self { config })
    }

    pub async fn run(&self, command: Commands, token: CancellationToken) -> anyhow::Result<()> {
        match command {
            Commands::Start(_) => self.run_start(token).await,
            Commands::Validate { config } => self.validate_config(config).await,
        }
    }

    pub async fn run_start(&self, token: CancellationToken) -> anyhow::Result<()> {
        let config = &self.config;
        info!("Input: {}", config.input_path.display());
        info!("Output: {}", config.output_path.display());
        info!(
            "Workers: {} download, {} processing",
            config.download_workers, config.processing_workers
        );
        info!("Max connections per host: {}", config.max_conns_per_host);
        info!("Read timeout: {:?}", config.read_timeout);

        let summary = Pipeline::new(config.clone())
            .run(token)
            .await
            .context("pipeline failed")?;

        if summary.cancelled {
            warn!("Pipeline was interrupted before the input was exhausted");
        }
        Ok(())
    }

    pub async fn validate_config(&self, config_path: PathBuf) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = load_config(&config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Download workers: {}", config.download_workers);
        println!("  Processing workers: {}", config.processing_workers);
        println!("  Input: {}", config.input_path.display());
        println!("  Output: {}", config.output_path.display());
        println!("  Max connections per host: {}", config.max_conns_per_host);
        println!("  Read timeout: {:?}", config.read_timeout);
        println!("  Output buffer: {}", config.effective_output_buffer_size());
        println!("  Counter: {:?}", config.counter);

        Ok(())
    }
}

pub async fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
    Config::from_json(&content)
}

pub fn setup_logging(debug: bool) -> anyhow::Result<()> {
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    Ok(())
}
