//! Concurrent image downloader
//!
//! A pool of workers pulls URLs from the input stream, fetches each body into
//! a pooled buffer and pushes the result downstream. Connections to a single
//! host are capped by [`HostConnectionPool`]; when every slot for a host is
//! busy the worker polls at a fixed interval until a slot frees up or the
//! token fires. All other failures drop the URL.

use crate::{
    host_key, send_or_cancel, shared_channel, BufferPool, Config, DownloadError,
    HostConnectionPool, Metrics, PooledBuffer, SendOutcome, SharedReceiver, UrlStream,
    WorkerStage,
};
use reqwest::StatusCode;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument, Span};

/// An image body held in memory together with the URL it came from.
///
/// The bytes are read-only. Dropping the image, or calling
/// [`release`](Self::release), hands the buffer back to its pool.
#[derive(Debug)]
pub struct DownloadedImage {
    url: String,
    body: PooledBuffer,
}

impl DownloadedImage {
    pub fn new(url: impl Into<String>, body: PooledBuffer) -> Self {
        Self {
            url: url.into(),
            body,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn release(self) {}
}

pub type ImageStream = SharedReceiver<DownloadedImage>;

pub struct MediaDownloader {
    client: reqwest::Client,
    connections: HostConnectionPool,
    buffers: Arc<BufferPool>,
    urls: UrlStream,
    sender: Mutex<Option<mpsc::Sender<DownloadedImage>>>,
    images: ImageStream,
    read_timeout: Duration,
    max_body_size: usize,
    read_buffer_size: usize,
    retry_poll_interval: Duration,
    metrics: Arc<Metrics>,
    span: Span,
}

impl MediaDownloader {
    pub fn new(
        config: &Config,
        urls: UrlStream,
        metrics: Arc<Metrics>,
        parent: &Span,
    ) -> Result<Self, DownloadError> {
        // A redirect is a non-200 answer; following it would also fetch from
        // a host whose connection slot is not held.
        let mut builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.read_timeout)
            .pool_max_idle_per_host(config.max_conns_per_host)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")));
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|e| DownloadError::Transport(e.to_string()))?;

        let (sender, images) = shared_channel(config.image_channel_capacity);

        Ok(Self {
            client,
            connections: HostConnectionPool::new(config.max_conns_per_host),
            buffers: BufferPool::new(config.read_buffer_size, config.buffer_pool_size),
            urls,
            sender: Mutex::new(Some(sender)),
            images,
            read_timeout: config.read_timeout,
            max_body_size: config.max_response_body_size,
            read_buffer_size: config.read_buffer_size,
            retry_poll_interval: config.retry_poll_interval,
            metrics,
            span: tracing::info_span!(parent: parent, "downloader"),
        })
    }

    /// Launches `workers` download workers and returns immediately. The
    /// returned handle resolves once every worker has exited and the image
    /// stream has been closed.
    pub fn start(self: &Arc<Self>, token: CancellationToken, workers: usize) -> JoinHandle<()> {
        let sender = match self.sender.lock().ok().and_then(|mut s| s.take()) {
            Some(sender) => sender,
            None => {
                error!(parent: &self.span, "Downloader already started");
                return tokio::spawn(async {});
            }
        };

        let mut stage = WorkerStage::new("downloader");
        stage.spawn(workers, |id| {
            let downloader = self.clone();
            let token = token.clone();
            let sender = sender.clone();
            let span = tracing::debug_span!(parent: &self.span, "runner", runner = id);
            async move { downloader.run(token, sender).await }.instrument(span)
        });
        info!(parent: &self.span, "Started {} download workers", workers);

        let span = self.span.clone();
        tokio::spawn(
            async move {
                stage.wait_and_close(sender).await;
                debug!("All download workers finished, image stream closed");
            }
            .instrument(span),
        )
    }

    async fn run(&self, token: CancellationToken, sender: mpsc::Sender<DownloadedImage>) {
        while let Some(url) = self.urls.recv_or_cancel(&token).await {
            let started = Instant::now();
            let image = match self.download(&token, &url).await {
                Ok(image) => image,
                Err(DownloadError::Cancelled) => break,
                Err(e) => {
                    self.metrics.record_download(started.elapsed(), 0, false);
                    error!(url = %url, "Image download failed: {}", e);
                    continue;
                }
            };

            let size = image.len();
            self.metrics.record_download(started.elapsed(), size, true);

            match send_or_cancel(&sender, image, &token).await {
                SendOutcome::Sent => {
                    debug!(url = %url, size, duration = ?started.elapsed(), "Downloaded");
                }
                SendOutcome::Cancelled | SendOutcome::Closed => break,
            }
        }
    }

    /// Fetches one image. Retries only while the host's connection slots are
    /// all taken; there is no cap other than the token on how long that lasts.
    pub async fn download(
        &self,
        token: &CancellationToken,
        url: &str,
    ) -> Result<DownloadedImage, DownloadError> {
        let host = host_key(url).ok_or_else(|| DownloadError::InvalidUrl(url.to_string()))?;

        loop {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let attempt = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
                result = self.try_download(&host, url) => result,
            };

            match attempt {
                Err(e) if e.is_retryable() => {
                    self.metrics.record_retry();
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(self.retry_poll_interval) => {}
                    }
                }
                other => return other,
            }
        }
    }

    async fn try_download(&self, host: &str, url: &str) -> Result<DownloadedImage, DownloadError> {
        let _connection = self.connections.try_acquire(host)?;

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(e, self.read_timeout))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(DownloadError::UnexpectedStatus(status.as_u16()));
        }

        let declared = response.content_length();
        if let Some(length) = declared {
            if length > self.max_body_size as u64 {
                return Err(DownloadError::BodyTooLarge {
                    size: length,
                    limit: self.max_body_size,
                });
            }
        }

        let hint = declared
            .map(|length| length as usize)
            .unwrap_or(self.read_buffer_size);
        let mut body = self.buffers.acquire(hint);

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DownloadError::from_reqwest(e, self.read_timeout))?
        {
            if body.len() + chunk.len() > self.max_body_size {
                return Err(DownloadError::BodyTooLarge {
                    size: (body.len() + chunk.len()) as u64,
                    limit: self.max_body_size,
                });
            }
            body.extend_from_slice(&chunk);
        }

        if body.is_empty() {
            return Err(DownloadError::MediaIsEmpty);
        }

        Ok(DownloadedImage::new(url, body))
    }

    /// Stream of downloaded images; closes after every worker has drained.
    pub fn next(&self) -> ImageStream {
        self.images.clone()
    }

    pub fn active_connections(&self) -> usize {
        self.connections.active_count()
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers every connection with the same raw HTTP response.
    async fn serve_raw(response: Vec<u8>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind");
        let addr = listener.local_addr().expect("failed to get addr");

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let response = response.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let _ = socket.write_all(&response).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        addr
    }

    fn loopback_downloader(max_body: usize) -> MediaDownloader {
        let (_tx, urls) = shared_channel::<String>(1);
        let config = Config {
            max_response_body_size: max_body,
            read_timeout: Duration::from_secs(5),
            use_system_proxy: false,
            ..Default::default()
        };
        MediaDownloader::new(&config, urls, Arc::new(Metrics::new()), &Span::none()).unwrap()
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let addr = serve_raw(
            b"HTTP/1.1 302 Found\r\nLocation: /real.jpeg\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                .to_vec(),
        )
        .await;
        let downloader = loopback_downloader(1024);

        let result = downloader
            .download(&CancellationToken::new(), &format!("http://{addr}/moved"))
            .await;
        assert!(
            matches!(result, Err(DownloadError::UnexpectedStatus(302))),
            "got {result:?}"
        );
        assert_eq!(downloader.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_no_content_is_a_failure() {
        let addr = serve_raw(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n".to_vec()).await;
        let downloader = loopback_downloader(1024);

        let result = downloader
            .download(&CancellationToken::new(), &format!("http://{addr}/empty1.jpeg"))
            .await;
        assert!(
            matches!(result, Err(DownloadError::UnexpectedStatus(204))),
            "got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_declared_length_over_limit() {
        let addr = serve_raw(
            b"HTTP/1.1 200 OK\r\nContent-Length: 100000\r\nConnection: close\r\n\r\n".to_vec(),
        )
        .await;
        let downloader = loopback_downloader(1024);

        let result = downloader
            .download(&CancellationToken::new(), &format!("http://{addr}/big.jpeg"))
            .await;
        assert!(
            matches!(
                result,
                Err(DownloadError::BodyTooLarge {
                    size: 100000,
                    limit: 1024
                })
            ),
            "got {result:?}"
        );
    }

    #[tokio::test]
    async fn test_streamed_body_over_limit() {
        let mut response =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n".to_vec();
        for _ in 0..4 {
            response.extend_from_slice(b"200\r\n");
            response.extend_from_slice(&[0xAB; 0x200]);
            response.extend_from_slice(b"\r\n");
        }
        response.extend_from_slice(b"0\r\n\r\n");

        let addr = serve_raw(response).await;
        let downloader = loopback_downloader(1024);

        let result = downloader
            .download(&CancellationToken::new(), &format!("http://{addr}/chunked.jpeg"))
            .await;
        assert!(
            matches!(result, Err(DownloadError::BodyTooLarge { limit: 1024, .. })),
            "got {result:?}"
        );
    }

    #[test]
    fn test_downloaded_image_accessors() {
        let image = DownloadedImage::new("http://h/1.jpeg", PooledBuffer::detached(vec![1, 2, 3]));
        assert_eq!(image.url(), "http://h/1.jpeg");
        assert_eq!(image.bytes(), &[1, 2, 3]);
        assert_eq!(image.len(), 3);
        assert!(!image.is_empty());
    }

    #[test]
    fn test_release_returns_buffer() {
        let pool = BufferPool::new(1024, 4);
        let mut body = pool.acquire(16);
        body.extend_from_slice(b"abc");

        let image = DownloadedImage::new("http://h/1.jpeg", body);
        image.release();

        assert_eq!(pool.get_stats().available_buffers, 1);
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retried() {
        let (_tx, urls) = shared_channel::<String>(1);
        let downloader = MediaDownloader::new(
            &Config::default(),
            urls,
            Arc::new(Metrics::new()),
            &Span::none(),
        )
        .unwrap();

        let result = downloader
            .download(&CancellationToken::new(), "no-scheme-here")
            .await;
        assert!(matches!(result, Err(DownloadError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_exhausted_host_waits_until_cancelled() {
        let (_tx, urls) = shared_channel::<String>(1);
        let config = Config {
            max_conns_per_host: 1,
            ..Default::default()
        };
        let downloader = MediaDownloader::new(&config, urls, Arc::new(Metrics::new()), &Span::none())
            .unwrap();

        let _held = downloader.connections.try_acquire("127.0.0.1:9").unwrap();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = downloader.download(&token, "http://127.0.0.1:9/a.jpeg").await;
        assert!(matches!(result, Err(DownloadError::Cancelled)));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
