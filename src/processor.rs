//! Image processing stage
//!
//! Runners pull downloaded images, count colors on the blocking pool and
//! hand results to the output. Count and save failures are logged per image
//! and never stop a runner.

use crate::{
    format_duration, throughput, ColorResult, CountError, Counter, DownloadedImage,
    ImageStream, Metrics, Outputer, WorkerStage,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};

/// Per-runner counters, logged periodically and when the runner exits.
#[derive(Debug, Clone)]
pub struct RunnerStats {
    pub runner: usize,
    pub processed: usize,
    pub failed: usize,
    pub total_bytes: usize,
    pub max_image_size: usize,
    pub elapsed: Duration,
    window_bytes: usize,
    window_started: Instant,
    started: Instant,
}

impl RunnerStats {
    fn new(runner: usize) -> Self {
        let now = Instant::now();
        Self {
            runner,
            processed: 0,
            failed: 0,
            total_bytes: 0,
            max_image_size: 0,
            elapsed: Duration::ZERO,
            window_bytes: 0,
            window_started: now,
            started: now,
        }
    }

    fn record(&mut self, size: usize) {
        self.processed += 1;
        self.total_bytes += size;
        self.window_bytes += size;
        self.max_image_size = self.max_image_size.max(size);
    }

    fn log_window(&mut self) {
        let window = self.window_started.elapsed();
        info!(
            count = self.processed,
            total_bytes = self.total_bytes,
            window_bytes_per_sec = throughput(self.window_bytes, window),
            bytes_per_sec = throughput(self.total_bytes, self.started.elapsed()),
            max_image_size = self.max_image_size,
            "Processing progress"
        );
        self.window_bytes = 0;
        self.window_started = Instant::now();
    }

    fn finish(mut self, reason: &str) -> Self {
        self.elapsed = self.started.elapsed();
        info!(
            count = self.processed,
            failed = self.failed,
            total_bytes = self.total_bytes,
            bytes_per_sec = throughput(self.total_bytes, self.elapsed),
            max_image_size = self.max_image_size,
            "Runner stopped: {} after {}",
            reason,
            format_duration(self.elapsed)
        );
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessingSummary {
    pub runners: Vec<RunnerStats>,
}

impl ProcessingSummary {
    pub fn processed(&self) -> usize {
        self.runners.iter().map(|r| r.processed).sum()
    }

    pub fn failed(&self) -> usize {
        self.runners.iter().map(|r| r.failed).sum()
    }

    pub fn total_bytes(&self) -> usize {
        self.runners.iter().map(|r| r.total_bytes).sum()
    }

    pub fn max_image_size(&self) -> usize {
        self.runners.iter().map(|r| r.max_image_size).max().unwrap_or(0)
    }
}

pub struct ImageProcessor {
    images: ImageStream,
    output: Arc<dyn Outputer>,
    counter: Arc<dyn Counter>,
    metrics: Arc<Metrics>,
    stats_every: usize,
    span: Span,
}

impl ImageProcessor {
    pub fn new(
        images: ImageStream,
        output: Arc<dyn Outputer>,
        counter: Arc<dyn Counter>,
        metrics: Arc<Metrics>,
        stats_every: usize,
        parent: &Span,
    ) -> Self {
        Self {
            images,
            output,
            counter,
            metrics,
            stats_every,
            span: tracing::info_span!(parent: parent, "processor"),
        }
    }

    /// Runs `workers` runners and returns once all of them have stopped,
    /// either because the image stream ended or the token fired.
    pub async fn start(self: &Arc<Self>, token: CancellationToken, workers: usize) -> ProcessingSummary {
        let mut stage = WorkerStage::new("processor");
        stage.spawn(workers, |id| {
            let processor = self.clone();
            let token = token.clone();
            let span = tracing::debug_span!(parent: &self.span, "runner", runner = id);
            async move { processor.run(id, token).await }.instrument(span)
        });
        self.metrics.set_active_processors(stage.active_workers());
        info!(parent: &self.span, "Started {} processing workers", workers);

        let mut runners = stage.wait().await;
        self.metrics.set_active_processors(0);
        runners.sort_by_key(|stats| stats.runner);

        let summary = ProcessingSummary { runners };
        info!(
            parent: &self.span,
            processed = summary.processed(),
            failed = summary.failed(),
            total_bytes = summary.total_bytes(),
            "All processing workers finished"
        );
        summary
    }

    async fn run(&self, id: usize, token: CancellationToken) -> RunnerStats {
        let mut stats = RunnerStats::new(id);

        let reason = loop {
            let Some(image) = self.images.recv_or_cancel(&token).await else {
                break if token.is_cancelled() {
                    "interrupted"
                } else {
                    "reached end of stream"
                };
            };

            let url = image.url().to_string();
            let size = image.len();
            let started = Instant::now();

            let result = match self.count(image).await {
                Ok(result) => result,
                Err(e) => {
                    stats.failed += 1;
                    self.metrics.count_failures.increment(1);
                    error!(url = %url, "Image processing failed: {}", e);
                    continue;
                }
            };
            debug!(url = %url, size, duration = ?started.elapsed(), "Counted");

            stats.record(size);
            self.metrics.record_processed(size);
            self.metrics.observe_image_size(size);

            if let Err(e) = self.output.save(&result).await {
                self.metrics.save_failures.increment(1);
                error!(url = %url, "Saving result failed: {}", e);
            }

            if self.stats_every > 0 && stats.processed % self.stats_every == 0 {
                stats.log_window();
            }
        };

        stats.finish(reason)
    }

    /// Counts on the blocking pool. The image buffer is released as soon as
    /// counting is done, before the result is saved.
    async fn count(&self, image: DownloadedImage) -> Result<ColorResult, CountError> {
        let counter = self.counter.clone();
        tokio::task::spawn_blocking(move || {
            let result = counter.count(&image);
            image.release();
            result
        })
        .await
        .map_err(|e| CountError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::MockCounter;
    use crate::{shared_channel, OutputError, PooledBuffer, Rgb};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryOutput {
        saved: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Outputer for MemoryOutput {
        async fn save(&self, result: &ColorResult) -> Result<(), OutputError> {
            if self.fail {
                return Err(OutputError::IoError("disk full".into()));
            }
            self.saved.lock().unwrap().push(result.url().to_string());
            Ok(())
        }

        async fn close(&self) -> Result<(), OutputError> {
            Ok(())
        }
    }

    fn image(n: usize) -> DownloadedImage {
        DownloadedImage::new(
            format!("http://h/{n}.jpeg"),
            PooledBuffer::detached(vec![0u8; n + 1]),
        )
    }

    fn counter_echoing_url() -> MockCounter {
        let mut counter = MockCounter::new();
        counter.expect_count().returning(|image| {
            Ok(ColorResult::new(image.url(), [Rgb::from_packed(0xFF0000); 3]))
        });
        counter
    }

    fn processor(
        images: ImageStream,
        output: Arc<dyn Outputer>,
        counter: MockCounter,
    ) -> Arc<ImageProcessor> {
        Arc::new(ImageProcessor::new(
            images,
            output,
            Arc::new(counter),
            Arc::new(Metrics::new()),
            2,
            &Span::none(),
        ))
    }

    #[tokio::test]
    async fn test_processes_every_image_until_end_of_stream() {
        let (tx, images) = shared_channel(4);
        let output = Arc::new(MemoryOutput::default());
        let processor = processor(images, output.clone(), counter_echoing_url());

        let feeder = tokio::spawn(async move {
            for n in 0..9 {
                tx.send(image(n)).await.unwrap();
            }
        });

        let summary = processor.start(CancellationToken::new(), 3).await;
        feeder.await.unwrap();

        assert_eq!(summary.runners.len(), 3);
        assert_eq!(summary.processed(), 9);
        assert_eq!(summary.failed(), 0);
        assert_eq!(summary.max_image_size(), 9);
        assert_eq!(processor.metrics.max_image_size_seen(), 9);
        assert_eq!(summary.total_bytes(), (1..=9).sum::<usize>());

        let mut saved = output.saved.lock().unwrap().clone();
        saved.sort();
        let mut expected: Vec<String> = (0..9).map(|n| format!("http://h/{n}.jpeg")).collect();
        expected.sort();
        assert_eq!(saved, expected);
    }

    #[tokio::test]
    async fn test_count_failure_skips_image() {
        let (tx, images) = shared_channel(4);
        let output = Arc::new(MemoryOutput::default());

        let mut counter = MockCounter::new();
        counter.expect_count().returning(|image| {
            if image.url().ends_with("/1.jpeg") {
                Err(CountError::Decode("bad huffman table".into()))
            } else {
                Ok(ColorResult::new(image.url(), [Rgb::default(); 3]))
            }
        });
        let processor = processor(images, output.clone(), counter);

        for n in 0..3 {
            tx.send(image(n)).await.unwrap();
        }
        drop(tx);

        let summary = processor.start(CancellationToken::new(), 1).await;
        assert_eq!(summary.processed(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(
            *output.saved.lock().unwrap(),
            vec!["http://h/0.jpeg".to_string(), "http://h/2.jpeg".to_string()]
        );
    }

    #[tokio::test]
    async fn test_save_failure_does_not_stop_runner() {
        let (tx, images) = shared_channel(4);
        let output = Arc::new(MemoryOutput {
            fail: true,
            ..Default::default()
        });
        let processor = processor(images, output, counter_echoing_url());

        for n in 0..4 {
            tx.send(image(n)).await.unwrap();
        }
        drop(tx);

        let summary = processor.start(CancellationToken::new(), 2).await;
        assert_eq!(summary.processed(), 4);
    }

    #[tokio::test]
    async fn test_cancellation_stops_idle_runners() {
        let (_tx, images) = shared_channel::<DownloadedImage>(1);
        let output = Arc::new(MemoryOutput::default());
        let processor = processor(images, output, MockCounter::new());

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let summary = tokio::time::timeout(Duration::from_secs(2), processor.start(token, 4))
            .await
            .expect("runners must stop after cancellation");
        assert_eq!(summary.runners.len(), 4);
        assert_eq!(summary.processed(), 0);
    }
}
