use ::metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::info;

/// Pipeline counters. Without an installed recorder every handle is a no-op.
pub struct Metrics {
    pub urls_read: Counter,
    pub downloads_succeeded: Counter,
    pub downloads_failed: Counter,
    pub download_retries: Counter,
    pub download_duration: Histogram,
    pub download_bytes: Counter,
    pub images_processed: Counter,
    pub count_failures: Counter,
    pub bytes_processed: Counter,
    pub max_image_size: Gauge,
    pub save_failures: Counter,
    pub active_processors: Gauge,
    max_image_seen: AtomicUsize,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            urls_read: register_counter!("color_counter_urls_read_total"),
            downloads_succeeded: register_counter!("color_counter_downloads_succeeded_total"),
            downloads_failed: register_counter!("color_counter_downloads_failed_total"),
            download_retries: register_counter!("color_counter_download_retries_total"),
            download_duration: register_histogram!("color_counter_download_duration_seconds"),
            download_bytes: register_counter!("color_counter_download_bytes_total"),
            images_processed: register_counter!("color_counter_images_processed_total"),
            count_failures: register_counter!("color_counter_count_failures_total"),
            bytes_processed: register_counter!("color_counter_bytes_processed_total"),
            max_image_size: register_gauge!("color_counter_max_image_size_bytes"),
            save_failures: register_counter!("color_counter_save_failures_total"),
            active_processors: register_gauge!("color_counter_active_processors"),
            max_image_seen: AtomicUsize::new(0),
        }
    }

    pub fn record_download(&self, duration: Duration, bytes: usize, success: bool) {
        if success {
            self.downloads_succeeded.increment(1);
            self.download_bytes.increment(bytes as u64);
        } else {
            self.downloads_failed.increment(1);
        }

        self.download_duration.record(duration.as_secs_f64());
    }

    pub fn record_retry(&self) {
        self.download_retries.increment(1);
    }

    pub fn record_processed(&self, bytes: usize) {
        self.images_processed.increment(1);
        self.bytes_processed.increment(bytes as u64);
    }

    /// Raises the process-wide maximum; the gauge never moves down.
    pub fn observe_image_size(&self, bytes: usize) {
        let previous = self.max_image_seen.fetch_max(bytes, Ordering::Relaxed);
        self.max_image_size.set(previous.max(bytes) as f64);
    }

    pub fn max_image_size_seen(&self) -> usize {
        self.max_image_seen.load(Ordering::Relaxed)
    }

    pub fn set_active_processors(&self, count: usize) {
        self.active_processors.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Serves the Prometheus scrape endpoint used for diagnostics.
pub struct PrometheusExporter {
    listen: SocketAddr,
}

impl PrometheusExporter {
    pub fn new(listen: SocketAddr) -> Self {
        Self { listen }
    }

    /// Installs the global recorder and its HTTP listener. Must run inside
    /// a tokio runtime and before [`Metrics::new`] for handles to be live.
    pub fn install(&self) -> Result<(), Box<dyn std::error::Error>> {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(self.listen)
            .install()?;

        info!("Prometheus metrics listening on {}", self.listen);
        Ok(())
    }
}
