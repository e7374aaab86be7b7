//! Plain text URL source.
//!
//! Lines are trimmed; anything shorter than `http://x` is skipped.

use crate::{shared_channel, send_or_cancel, InputError, Metrics, SendOutcome, SharedReceiver};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};

/// Length of the shortest plausible URL, `http://x`.
pub const MIN_URL_LEN: usize = 8;

pub type UrlStream = SharedReceiver<String>;

pub struct PlainTextInput {
    sender: Mutex<Option<mpsc::Sender<String>>>,
    urls: UrlStream,
    metrics: Arc<Metrics>,
    span: Span,
}

impl PlainTextInput {
    pub fn new(capacity: usize, metrics: Arc<Metrics>, parent: &Span) -> Self {
        let (sender, urls) = shared_channel(capacity);
        Self {
            sender: Mutex::new(Some(sender)),
            urls,
            metrics,
            span: tracing::info_span!(parent: parent, "input"),
        }
    }

    /// Opens the file and starts reading it in the background. Fails only if
    /// the file cannot be opened.
    pub async fn start(
        &self,
        token: CancellationToken,
        path: impl AsRef<Path>,
    ) -> Result<JoinHandle<usize>, InputError> {
        let path = path.as_ref();
        let file = File::open(path).await.map_err(|e| InputError::Open {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        info!(parent: &self.span, "Reading URLs from {}", path.display());
        self.start_reader(token, file)
    }

    /// Starts reading URLs from any async reader. The stream returned by
    /// [`next`](Self::next) closes when the reader is exhausted, fails, or
    /// the token fires. The task yields the number of URLs passed on.
    pub fn start_reader<R>(
        &self,
        token: CancellationToken,
        reader: R,
    ) -> Result<JoinHandle<usize>, InputError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|mut sender| sender.take())
            .ok_or(InputError::AlreadyStarted)?;
        let metrics = self.metrics.clone();

        Ok(tokio::spawn(
            read_lines(token, reader, sender, metrics).instrument(self.span.clone()),
        ))
    }

    /// The URL stream. Single pass: once closed it stays exhausted.
    pub fn next(&self) -> UrlStream {
        self.urls.clone()
    }
}

async fn read_lines<R>(
    token: CancellationToken,
    reader: R,
    sender: mpsc::Sender<String>,
    metrics: Arc<Metrics>,
) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut passed = 0usize;

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Input reading cancelled");
                break;
            }
            read = reader.read_until(b'\n', &mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                error!("Input scan failed: {}", e);
                break;
            }
        }

        // Bytes that are not UTF-8 are replaced, not rejected; such a URL
        // fails later on its own.
        let line = String::from_utf8_lossy(&buf);
        let url = line.trim();
        if url.len() < MIN_URL_LEN {
            continue;
        }

        match send_or_cancel(&sender, url.to_string(), &token).await {
            SendOutcome::Sent => {
                passed += 1;
                metrics.urls_read.increment(1);
            }
            SendOutcome::Cancelled => {
                debug!("Input reading cancelled while the URL channel was full");
                break;
            }
            SendOutcome::Closed => break,
        }
    }

    info!("Input finished, {} URLs passed", passed);
    passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn input(capacity: usize) -> PlainTextInput {
        PlainTextInput::new(capacity, Arc::new(Metrics::new()), &Span::none())
    }

    #[tokio::test]
    async fn test_short_lines_are_skipped_and_trimmed() {
        let text = "http://a.example/1.jpg\n\nshort\n   http://b.example/2.jpg   \nhttp://x\r\nhttp:/\n";
        let input = input(4);
        let handle = input
            .start_reader(CancellationToken::new(), text.as_bytes())
            .unwrap();

        let urls = input.next();
        let mut got = Vec::new();
        while let Some(url) = urls.recv().await {
            got.push(url);
        }

        assert_eq!(
            got,
            vec!["http://a.example/1.jpg", "http://b.example/2.jpg", "http://x"]
        );
        assert_eq!(handle.await.unwrap(), 3);
        assert_eq!(urls.recv().await, None);
    }

    #[tokio::test]
    async fn test_non_utf8_line_does_not_end_the_stream() {
        let text: &'static [u8] = b"http://a.example/1.jpg\nhttp://b.example/caf\xe9.jpg\nhttp://c.example/3.jpg\nhttp://d.example/4.jpg";
        let input = input(4);
        let handle = input.start_reader(CancellationToken::new(), text).unwrap();

        let urls = input.next();
        let mut got = Vec::new();
        while let Some(url) = urls.recv().await {
            got.push(url);
        }

        assert_eq!(handle.await.unwrap(), 4);
        assert_eq!(got.len(), 4);
        assert_eq!(got[0], "http://a.example/1.jpg");
        assert_eq!(got[1], "http://b.example/caf\u{FFFD}.jpg");
        assert_eq!(got[2], "http://c.example/3.jpg");
        assert_eq!(got[3], "http://d.example/4.jpg");
    }

    #[tokio::test]
    async fn test_cancellation_closes_stream() {
        let text: String = (0..100)
            .map(|i| format!("http://host.example/{i}.jpg\n"))
            .collect();
        let input = input(1);
        let token = CancellationToken::new();
        let handle = input.start_reader(token.clone(), std::io::Cursor::new(text.into_bytes())).unwrap();

        let urls = input.next();
        for _ in 0..10 {
            assert!(urls.recv().await.is_some());
        }
        token.cancel();

        let passed = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reader must stop after cancellation")
            .unwrap();
        assert!(passed < 100);

        let mut drained = 0;
        while urls.recv().await.is_some() {
            drained += 1;
        }
        assert!(drained <= 1);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let input = input(1);
        input.start_reader(CancellationToken::new(), &b""[..]).unwrap();
        assert!(matches!(
            input.start_reader(CancellationToken::new(), &b""[..]),
            Err(InputError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let input = input(1);
        let result = input
            .start(CancellationToken::new(), "/nonexistent/urls.txt")
            .await;
        assert!(matches!(result, Err(InputError::Open { .. })));
    }

    #[tokio::test]
    async fn test_reads_file_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, "http://h/1.jpeg\nhttp://h/2.jpeg\nhttp://h/3.jpeg\n").unwrap();

        let input = input(1);
        input.start(CancellationToken::new(), &path).await.unwrap();

        let urls = input.next();
        assert_eq!(urls.recv().await.as_deref(), Some("http://h/1.jpeg"));
        assert_eq!(urls.recv().await.as_deref(), Some("http://h/2.jpeg"));
        assert_eq!(urls.recv().await.as_deref(), Some("http://h/3.jpeg"));
        assert_eq!(urls.recv().await, None);
    }
}
