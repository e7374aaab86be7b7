//! # Image Color Counter
//!
//! A batch pipeline that reads image URLs from a text file, downloads each
//! image, finds its three most frequent colors and appends one CSV record
//! per image to a result file.
//!
//! ## Pipeline
//!
//! | Stage | Workers | Input | Output |
//! |-------|---------|-------|--------|
//! | **Input** | 1 | text file, one URL per line | URL stream |
//! | **Downloader** | `download_workers` | URL stream | image stream |
//! | **Processor** | `processing_workers` | image stream | result records |
//! | **Output** | shared | result records | `result.csv` |
//!
//! Stages are connected by bounded channels, so a slow stage throttles the
//! ones upstream of it. A single cancellation token stops every stage; each
//! one finishes the item it holds and exits without blocking.
//!
//! ## Features
//!
//! - **Per-host connection cap**: at most `max_conns_per_host` requests in
//!   flight to one `host:port`; busy hosts are polled every 25ms
//! - **Pooled read buffers**: response bodies reuse a bounded set of buffers
//! - **Two counting strategies**: raw RGB buffer walk or per-pixel walk
//! - **Buffered output**: records are flushed every `output_buffer_size` lines
//! - **Prometheus metrics**: optional scrape endpoint for diagnostics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use image_color_counter::{Config, Pipeline};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         input_path: "input.txt".into(),
//!         output_path: "result.csv".into(),
//!         ..Default::default()
//!     };
//!
//!     let summary = Pipeline::new(config).run(CancellationToken::new()).await?;
//!     println!("Processed {} images", summary.processing.processed());
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! image-color-counter start -i input.txt -o result.csv --dworkers 16 --pworkers 8
//! ```

/// Configuration and settings for the pipeline
pub mod config;

/// Error types for every stage
pub mod error;

/// Color values and result records
pub mod color;

/// Plain text URL source
pub mod input;

/// HTTP image downloader with per-host connection limiting
pub mod downloader;

/// Top-3 color counting strategies
pub mod counter;

/// Processing workers driving counting and output
pub mod processor;

/// Buffered CSV output
pub mod output;

/// End-to-end pipeline wiring
pub mod pipeline;

/// Worker pools and shared channels
pub mod worker;

/// Reusable body buffers
pub mod buffer_pool;

/// Per-host connection slots
pub mod connection_pool;

/// Command-line interface implementation
pub mod cli;

/// Performance metrics collection
pub mod metrics;

/// Utility functions and helpers
pub mod utils;


pub use buffer_pool::*;
pub use cli::*;
pub use color::*;
pub use config::*;
pub use connection_pool::*;
pub use counter::*;
pub use downloader::*;
pub use error::*;
pub use input::*;
pub use self::metrics::*;
pub use output::*;
pub use pipeline::*;
pub use processor::*;
pub use utils::*;
pub use worker::*;
