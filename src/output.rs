//! Buffered CSV output shared by every processing worker.

use crate::{ColorResult, OutputError, DEFAULT_OUTPUT_BUFFER_SIZE};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Destination for result records.
///
/// `save` may be called concurrently. After `close`, `save` is a silent
/// no-op so results still in flight at shutdown are dropped, not failed.
#[async_trait]
pub trait Outputer: Send + Sync {
    async fn save(&self, result: &ColorResult) -> Result<(), OutputError>;
    async fn close(&self) -> Result<(), OutputError>;
}

struct CsvState {
    lines: Vec<String>,
    file: Option<File>,
    header_pending: bool,
}

/// CSV file with an in-memory write buffer.
///
/// The header is written only into an empty file, so appending to an
/// existing result file keeps a single header.
pub struct BufferedCsv {
    capacity: usize,
    state: Mutex<CsvState>,
}

impl BufferedCsv {
    /// `capacity` below 2 falls back to the default of 10 lines.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity < 2 {
            DEFAULT_OUTPUT_BUFFER_SIZE
        } else {
            capacity
        };

        Self {
            capacity,
            state: Mutex::new(CsvState {
                lines: Vec::with_capacity(capacity),
                file: None,
                header_pending: false,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Creates the file or opens it for appending.
    pub async fn open(&self, path: impl AsRef<Path>) -> Result<(), OutputError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        let existing = file.metadata().await?.len();

        let mut state = self.state.lock().await;
        state.file = Some(file);
        state.header_pending = existing == 0;
        state.lines.clear();

        info!(
            component = "output",
            "Opened {} ({} bytes already present)",
            path.display(),
            existing
        );
        Ok(())
    }

    pub async fn buffered_lines(&self) -> usize {
        self.state.lock().await.lines.len()
    }
}

impl CsvState {
    /// Writes out buffered lines. Lines stay buffered if the write fails so
    /// the next flush retries them.
    async fn flush(&mut self) -> Result<(), OutputError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(());
        };
        if self.lines.is_empty() {
            return Ok(());
        }

        let chunk = self.lines.concat();
        file.write_all(chunk.as_bytes()).await?;
        file.flush().await?;
        debug!(component = "output", "Flushed {} lines", self.lines.len());
        self.lines.clear();
        Ok(())
    }
}

#[async_trait]
impl Outputer for BufferedCsv {
    async fn save(&self, result: &ColorResult) -> Result<(), OutputError> {
        let mut state = self.state.lock().await;

        if state.file.is_none() {
            return Ok(());
        }

        if state.header_pending {
            state.lines.push(ColorResult::HEADER.to_string());
            state.header_pending = false;
        }

        state.lines.push(result.record());
        if state.lines.len() < self.capacity {
            return Ok(());
        }

        state.flush().await
    }

    async fn close(&self) -> Result<(), OutputError> {
        let mut state = self.state.lock().await;

        let flushed = state.flush().await;
        let closed = match state.file.take() {
            Some(mut file) => file.shutdown().await.map_err(OutputError::from),
            None => Ok(()),
        };
        state.lines.clear();

        // A failed flush is the more useful error to report.
        flushed.and(closed)
    }
}
