//! Configuration management with serde serialization/deserialization
//!
//! Every knob the pipeline exposes lives in [`Config`]. The binary fills it
//! from an optional JSON file and command-line overrides; the library only
//! consumes it.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default maximum number of parallel connections to a single host.
pub const DEFAULT_MAX_CONNS_PER_HOST: usize = 32;

/// Default limit for reading a full response, body included.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(8);

/// Default number of records buffered before the output is flushed.
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 10;

/// Main configuration structure for the color counter
///
/// # Examples
///
/// ```rust
/// use image_color_counter::Config;
///
/// let config = Config {
///     download_workers: 8,
///     max_conns_per_host: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Number of parallel download workers (default: CPU count)
    pub download_workers: usize,

    /// Number of parallel color counting workers (default: CPU count)
    ///
    /// Counting is CPU bound, so more workers than cores rarely helps.
    pub processing_workers: usize,

    /// Plain text file with one image URL per line (default: input.txt)
    pub input_path: PathBuf,

    /// CSV destination, created or appended to (default: result.csv)
    pub output_path: PathBuf,

    /// Enables debug level logging
    pub debug: bool,

    /// Maximum simultaneous connections to a single host (default: 32)
    pub max_conns_per_host: usize,

    /// Limit for the whole request, body included (default: 8 seconds)
    pub read_timeout: Duration,

    /// Responses with larger bodies are rejected (default: 16 MiB)
    pub max_response_body_size: usize,

    /// Initial capacity reserved for a body, and the largest buffer kept
    /// for reuse (default: 6 MiB)
    pub read_buffer_size: usize,

    /// Records buffered before a flush (default: 10, values below 2 use 10)
    pub output_buffer_size: usize,

    /// Poll interval while every connection to a host is busy (default: 25ms)
    pub retry_poll_interval: Duration,

    /// Capacity of the URL channel between the input and the downloaders
    pub url_channel_capacity: usize,

    /// Capacity of the image channel between downloaders and processors
    pub image_channel_capacity: usize,

    /// Maximum number of idle body buffers retained for reuse
    pub buffer_pool_size: usize,

    /// Each processing worker reports throughput after this many images
    pub stats_every: usize,

    /// Counting strategy
    pub counter: CounterKind,

    /// Honor HTTP(S)_PROXY environment variables
    pub use_system_proxy: bool,
}

impl Default for Config {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            download_workers: cpus,
            processing_workers: cpus,
            input_path: PathBuf::from("input.txt"),
            output_path: PathBuf::from("result.csv"),
            debug: false,
            max_conns_per_host: DEFAULT_MAX_CONNS_PER_HOST,
            read_timeout: DEFAULT_READ_TIMEOUT,
            max_response_body_size: 16 * 1024 * 1024, // 16MiB
            read_buffer_size: 6 * 1024 * 1024,        // 6MiB
            output_buffer_size: DEFAULT_OUTPUT_BUFFER_SIZE,
            retry_poll_interval: Duration::from_millis(25),
            url_channel_capacity: 1,
            image_channel_capacity: 10,
            buffer_pool_size: 64,
            stats_every: 100,
            counter: CounterKind::default(),
            use_system_proxy: true,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.download_workers == 0 {
            return Err(ConfigError::Invalid(
                "download workers must be greater than 0".to_string(),
            ));
        }

        if self.processing_workers == 0 {
            return Err(ConfigError::Invalid(
                "processing workers must be greater than 0".to_string(),
            ));
        }

        if self.max_conns_per_host == 0 {
            return Err(ConfigError::Invalid(
                "max connections per host must be greater than 0".to_string(),
            ));
        }

        if self.read_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "read timeout must be greater than 0".to_string(),
            ));
        }

        if self.retry_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "retry poll interval must be greater than 0".to_string(),
            ));
        }

        if self.max_response_body_size == 0 {
            return Err(ConfigError::Invalid(
                "max response body size must be greater than 0".to_string(),
            ));
        }

        if self.url_channel_capacity == 0 || self.image_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "channel capacities must be greater than 0".to_string(),
            ));
        }

        if self.stats_every == 0 {
            return Err(ConfigError::Invalid(
                "stats interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Output buffer capacity with the small-value fallback applied.
    pub fn effective_output_buffer_size(&self) -> usize {
        if self.output_buffer_size < 2 {
            DEFAULT_OUTPUT_BUFFER_SIZE
        } else {
            self.output_buffer_size
        }
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }
}

/// Color counting strategy
///
/// Both produce identical histograms for the same input:
/// - RawBuffer: converts to an interleaved RGB buffer and walks it linearly
/// - PixelWalk: visits the decoded image pixel by pixel in its native layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    #[default]
    RawBuffer,
    PixelWalk,
}

impl std::str::FromStr for CounterKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" | "raw_buffer" => Ok(CounterKind::RawBuffer),
            "walk" | "pixel_walk" => Ok(CounterKind::PixelWalk),
            other => Err(ConfigError::Invalid(format!("unknown counter: {other}"))),
        }
    }
}
