//! End-to-end wiring: input -> downloader -> processor -> output.

use crate::{
    counter_for, format_duration, BufferedCsv, Config, ImageProcessor,
    MediaDownloader, Metrics, Outputer, PipelineError, PlainTextInput, ProcessingSummary,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSummary {
    pub urls_read: usize,
    pub processing: ProcessingSummary,
    pub duration: Duration,
    pub cancelled: bool,
}

pub struct Pipeline {
    config: Config,
    metrics: Arc<Metrics>,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Runs every stage to completion or until `cancel` fires.
    ///
    /// Failing to open the output or the input file is fatal. Per-URL
    /// failures are only logged. The output is closed in every case once the
    /// processors have stopped, and a close failure is returned as an error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PipelineSummary, PipelineError> {
        let config = &self.config;
        config.validate()?;
        let token = cancel.child_token();

        let started = Instant::now();
        let span = tracing::info_span!("pipeline");

        let output = Arc::new(BufferedCsv::new(config.effective_output_buffer_size()));
        output.open(&config.output_path).await?;

        let input = PlainTextInput::new(config.url_channel_capacity, self.metrics.clone(), &span);
        let reader = match input.start(token.clone(), &config.input_path).await {
            Ok(reader) => reader,
            Err(e) => {
                let _ = output.close().await;
                return Err(e.into());
            }
        };

        let downloader = match MediaDownloader::new(config, input.next(), self.metrics.clone(), &span)
        {
            Ok(downloader) => Arc::new(downloader),
            Err(e) => {
                token.cancel();
                let _ = output.close().await;
                return Err(PipelineError::HttpClient(e.to_string()));
            }
        };
        let downloads = downloader.start(token.clone(), config.download_workers);

        let processor = Arc::new(ImageProcessor::new(
            downloader.next(),
            output.clone() as Arc<dyn Outputer>,
            counter_for(config.counter),
            self.metrics.clone(),
            config.stats_every,
            &span,
        ));
        let processing = processor.start(token.clone(), config.processing_workers).await;

        if let Err(e) = downloads.await {
            warn!(parent: &span, "Download stage did not shut down cleanly: {}", e);
        }
        let urls_read = reader.await.unwrap_or_else(|e| {
            warn!(parent: &span, "Input reader did not shut down cleanly: {}", e);
            0
        });

        if let Err(e) = output.close().await {
            error!(parent: &span, "Closing output failed: {}", e);
            return Err(e.into());
        }

        let summary = PipelineSummary {
            urls_read,
            processing,
            duration: started.elapsed(),
            cancelled: cancel.is_cancelled(),
        };
        info!(
            parent: &span,
            urls = summary.urls_read,
            count = summary.processing.processed(),
            failed = summary.processing.failed(),
            max_image_size = summary.processing.max_image_size(),
            total_bytes = summary.processing.total_bytes(),
            "Pipeline finished in {}",
            format_duration(summary.duration)
        );
        Ok(summary)
    }
}
