use bytes::{Bytes, BytesMut};
use camwatch_common::config::Config;
use camwatch_common::frame::{DecodedFrame, FrameError};
use futures_util::StreamExt;
use reqwest::header::ETAG;
use reqwest::Response;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::denoise::FilterCommand;
use crate::shutdown::Shutdown;
use crate::target::PollTarget;

/// Cap on the body buffer preallocated from `Content-Length`.
const MAX_PREALLOC: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FetcherOptions {
    pub filter: FilterCommand,
    /// Upper bound on one request-filter-decode cycle.
    pub fetch_timeout: Duration,
    pub connect_timeout: Duration,
}

impl FetcherOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            filter: FilterCommand::from_config(&config.filter),
            fetch_timeout: Duration::from_secs(config.poll.fetch_timeout_secs.max(1)),
            ..Self::default()
        }
    }
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            filter: FilterCommand::default(),
            fetch_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one [`FrameFetcher::fetch`] call.
#[derive(Debug)]
pub enum FetchResult {
    /// A newly decoded frame.
    Fresh {
        frame: Arc<DecodedFrame>,
        etag: Option<String>,
    },
    /// The server's validator matched the cached one; reuse the cached frame.
    Unchanged,
    Failed(FetchError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    Decode,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("cannot do GET request: {0}")]
    Request(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("cannot download frame: {0}")]
    Body(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("fetch cancelled")]
    Cancelled,
    #[error("cannot start filter: {0}")]
    FilterSpawn(String),
    #[error("filter pipe error: {0}")]
    FilterIo(String),
    #[error("cannot download frame over filter")]
    FilterFailed { code: Option<i32> },
    #[error("decoder task failed: {0}")]
    DecoderTask(String),
    #[error(transparent)]
    Image(#[from] FrameError),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Request(_)
            | FetchError::Status(_)
            | FetchError::Body(_)
            | FetchError::Timeout(_)
            | FetchError::Cancelled => ErrorKind::Network,
            FetchError::FilterSpawn(_)
            | FetchError::FilterIo(_)
            | FetchError::FilterFailed { .. }
            | FetchError::DecoderTask(_)
            | FetchError::Image(_) => ErrorKind::Decode,
        }
    }
}

/// Last validator and the frame decoded alongside it. Replaced as a whole so
/// the two never disagree.
#[derive(Debug)]
struct CachedFrame {
    etag: Option<String>,
    frame: Arc<DecodedFrame>,
}

/// Performs conditional snapshot downloads for a single poll session.
pub struct FrameFetcher {
    client: reqwest::Client,
    filter: FilterCommand,
    fetch_timeout: Duration,
    cache: Option<CachedFrame>,
}

impl FrameFetcher {
    pub fn new(options: FetcherOptions) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| FetchError::Request(e.to_string()))?;
        Ok(Self {
            client,
            filter: options.filter,
            fetch_timeout: options.fetch_timeout,
            cache: None,
        })
    }

    /// Frame stored with the last validator, if any.
    pub fn cached(&self) -> Option<&Arc<DecodedFrame>> {
        self.cache.as_ref().map(|c| &c.frame)
    }

    pub fn cached_etag(&self) -> Option<&str> {
        self.cache.as_ref().and_then(|c| c.etag.as_deref())
    }

    /// Download, optionally filter, and decode one snapshot.
    ///
    /// Never panics on a bad fetch. A triggered `shutdown` aborts the request
    /// and any running filter and yields [`FetchError::Cancelled`]. Failures
    /// leave the cache as it was.
    pub async fn fetch(&mut self, target: &PollTarget, shutdown: &Shutdown) -> FetchResult {
        if shutdown.is_cancelled() {
            return FetchResult::Failed(FetchError::Cancelled);
        }

        let timeout = self.fetch_timeout;
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(url = %target.url(), "fetch cancelled");
                FetchResult::Failed(FetchError::Cancelled)
            }
            result = tokio::time::timeout(timeout, self.fetch_once(target)) => match result {
                Ok(Ok(fetched)) => fetched,
                Ok(Err(e)) => FetchResult::Failed(e),
                Err(_) => FetchResult::Failed(FetchError::Timeout(timeout)),
            },
        }
    }

    async fn fetch_once(&mut self, target: &PollTarget) -> Result<FetchResult, FetchError> {
        let started = Instant::now();
        let response = self
            .client
            .get(target.url().clone())
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_owned);

        if let (Some(etag), Some(cached)) = (&etag, &self.cache) {
            if cached.etag.as_deref() == Some(etag.as_str()) {
                debug!(etag, "validator unchanged, skipping decode");
                return Ok(FetchResult::Unchanged);
            }
        }

        let encoded = if target.denoise() > 0 {
            let filtered = self
                .filter
                .run(target.denoise(), response.bytes_stream())
                .await?;
            Bytes::from(filtered)
        } else {
            read_body(response).await?
        };

        let frame_etag = etag.clone();
        let frame = tokio::task::spawn_blocking(move || DecodedFrame::decode(&encoded, frame_etag))
            .await
            .map_err(|e| FetchError::DecoderTask(e.to_string()))??;
        let frame = Arc::new(frame);

        debug!(
            bytes = frame.encoded_len,
            width = frame.width(),
            height = frame.height(),
            etag = etag.as_deref().unwrap_or(""),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "decoded frame"
        );

        self.cache = Some(CachedFrame {
            etag: etag.clone(),
            frame: Arc::clone(&frame),
        });

        Ok(FetchResult::Fresh { frame, etag })
    }
}

async fn read_body(response: Response) -> Result<Bytes, FetchError> {
    let capacity = response
        .content_length()
        .map(|len| (len as usize).min(MAX_PREALLOC))
        .unwrap_or(64 * 1024);
    let mut buffer = BytesMut::with_capacity(capacity);
    let mut byte_stream = response.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.map_err(|e| FetchError::Body(e.to_string()))?;
        buffer.extend_from_slice(&chunk);
    }

    Ok(buffer.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_channel;
    use crate::test_support::{png_frame, CameraStub};

    fn fetcher() -> FrameFetcher {
        FrameFetcher::new(FetcherOptions::default()).unwrap()
    }

    fn fetcher_with(filter: FilterCommand) -> FrameFetcher {
        FrameFetcher::new(FetcherOptions {
            filter,
            ..FetcherOptions::default()
        })
        .unwrap()
    }

    fn target(stub: &CameraStub, denoise: u32) -> PollTarget {
        PollTarget::new(&stub.url(), 10, denoise).unwrap()
    }

    fn expect_fresh(result: FetchResult) -> (Arc<DecodedFrame>, Option<String>) {
        match result {
            FetchResult::Fresh { frame, etag } => (frame, etag),
            other => panic!("expected Fresh, got {other:?}"),
        }
    }

    fn expect_failed(result: FetchResult) -> FetchError {
        match result {
            FetchResult::Failed(e) => e,
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchanged_validator_skips_decode() {
        let stub = CameraStub::start().await;
        stub.set_frame(png_frame(10), Some("\"a\""));
        let (_trigger, shutdown) = shutdown_channel();
        let mut fetcher = fetcher();
        let target = target(&stub, 0);

        let (first, etag) = expect_fresh(fetcher.fetch(&target, &shutdown).await);
        assert_eq!(etag.as_deref(), Some("\"a\""));
        let original_pixels = first.image.as_raw().clone();

        // Same validator, undecodable body: only the fast path can succeed.
        stub.set_frame(b"not an image".to_vec(), Some("\"a\""));
        for _ in 0..3 {
            let result = fetcher.fetch(&target, &shutdown).await;
            assert!(matches!(result, FetchResult::Unchanged), "got {result:?}");
        }

        let cached = fetcher.cached().unwrap();
        assert!(Arc::ptr_eq(cached, &first));
        assert_eq!(cached.image.as_raw(), &original_pixels);
        assert_eq!(stub.hits(), 4);
    }

    #[tokio::test]
    async fn changed_validator_replaces_cache() {
        let stub = CameraStub::start().await;
        let (_trigger, shutdown) = shutdown_channel();
        let mut fetcher = fetcher();
        let target = target(&stub, 0);

        stub.set_frame(png_frame(10), Some("\"a\""));
        let (first, _) = expect_fresh(fetcher.fetch(&target, &shutdown).await);

        stub.set_frame(png_frame(200), Some("\"b\""));
        let (second, etag) = expect_fresh(fetcher.fetch(&target, &shutdown).await);
        assert_eq!(etag.as_deref(), Some("\"b\""));
        assert_ne!(first.digest, second.digest);

        assert_eq!(fetcher.cached_etag(), Some("\"b\""));
        assert!(Arc::ptr_eq(fetcher.cached().unwrap(), &second));
    }

    #[tokio::test]
    async fn missing_validator_always_decodes() {
        let stub = CameraStub::start().await;
        stub.set_frame(png_frame(42), None);
        let (_trigger, shutdown) = shutdown_channel();
        let mut fetcher = fetcher();
        let target = target(&stub, 0);

        let (a, _) = expect_fresh(fetcher.fetch(&target, &shutdown).await);
        let (b, etag) = expect_fresh(fetcher.fetch(&target, &shutdown).await);
        assert!(etag.is_none());
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.digest, b.digest);
        assert_eq!(fetcher.cached_etag(), None);
    }

    #[tokio::test]
    async fn http_error_status_is_network_error() {
        let stub = CameraStub::start().await;
        stub.set_frame(png_frame(1), Some("\"a\""));
        let (_trigger, shutdown) = shutdown_channel();
        let mut fetcher = fetcher();
        let target = target(&stub, 0);
        expect_fresh(fetcher.fetch(&target, &shutdown).await);

        stub.set_status(503);
        let err = expect_failed(fetcher.fetch(&target, &shutdown).await);
        assert!(matches!(err, FetchError::Status(503)));
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(fetcher.cached_etag(), Some("\"a\""), "cache untouched on failure");
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_trigger, shutdown) = shutdown_channel();
        let target = PollTarget::new(&format!("http://{addr}/snap.jpg"), 10, 0).unwrap();
        let err = expect_failed(fetcher().fetch(&target, &shutdown).await);
        assert!(matches!(err, FetchError::Request(_)), "got {err:?}");
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn undecodable_body_is_decode_error() {
        let stub = CameraStub::start().await;
        stub.set_frame(b"<html>login required</html>".to_vec(), Some("\"x\""));
        let (_trigger, shutdown) = shutdown_channel();
        let mut fetcher = fetcher();

        let err = expect_failed(fetcher.fetch(&target(&stub, 0), &shutdown).await);
        assert!(matches!(err, FetchError::Image(_)), "got {err:?}");
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert!(fetcher.cached().is_none());
    }

    #[tokio::test]
    async fn slow_server_hits_fetch_timeout() {
        let stub = CameraStub::start().await;
        stub.set_frame(png_frame(1), None);
        stub.set_delay(Duration::from_secs(5));
        let (_trigger, shutdown) = shutdown_channel();
        let mut fetcher = FrameFetcher::new(FetcherOptions {
            fetch_timeout: Duration::from_millis(200),
            ..FetcherOptions::default()
        })
        .unwrap();

        let started = Instant::now();
        let err = expect_failed(fetcher.fetch(&target(&stub, 0), &shutdown).await);
        assert!(matches!(err, FetchError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancel_aborts_in_flight_request() {
        let stub = CameraStub::start().await;
        stub.set_frame(png_frame(1), None);
        stub.set_delay(Duration::from_secs(30));
        let (trigger, shutdown) = shutdown_channel();
        let mut fetcher = fetcher();
        let target = target(&stub, 0);

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.trigger();
        });

        let started = Instant::now();
        let err = expect_failed(fetcher.fetch(&target, &shutdown).await);
        assert!(matches!(err, FetchError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
        cancel.await.unwrap();
    }

    #[tokio::test]
    async fn already_cancelled_does_not_request() {
        let stub = CameraStub::start().await;
        stub.set_frame(png_frame(1), None);
        let (trigger, shutdown) = shutdown_channel();
        trigger.trigger();

        let err = expect_failed(fetcher().fetch(&target(&stub, 0), &shutdown).await);
        assert!(matches!(err, FetchError::Cancelled));
        assert_eq!(stub.hits(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn denoise_decodes_filter_output() {
        let stub = CameraStub::start().await;
        stub.set_frame(b"raw camera bytes".to_vec(), Some("\"a\""));

        // Stand-in filter: discard the input and emit a known PNG.
        let replacement = std::env::temp_dir().join(format!("camwatch-filter-{}.png", std::process::id()));
        std::fs::write(&replacement, png_frame(99)).unwrap();
        let script = format!("cat > /dev/null; test {{strength}} = 50 && cat {}", replacement.display());
        let mut fetcher = fetcher_with(FilterCommand::new("sh", vec!["-c".into(), script]));
        let (_trigger, shutdown) = shutdown_channel();

        let (frame, etag) = expect_fresh(fetcher.fetch(&target(&stub, 50), &shutdown).await);
        assert_eq!(etag.as_deref(), Some("\"a\""));
        assert_eq!(frame.digest, camwatch_common::frame::digest(&png_frame(99)));

        std::fs::remove_file(&replacement).ok();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn denoise_failure_keeps_cache() {
        let stub = CameraStub::start().await;
        stub.set_frame(png_frame(5), Some("\"a\""));
        let (_trigger, shutdown) = shutdown_channel();
        let mut fetcher = fetcher_with(FilterCommand::new("sh", vec!["-c".into(), "exit 1".into()]));

        // Populate the cache without the filter first.
        let (cached, _) = expect_fresh(fetcher.fetch(&target(&stub, 0), &shutdown).await);

        stub.set_frame(png_frame(6), Some("\"b\""));
        let err = expect_failed(fetcher.fetch(&target(&stub, 50), &shutdown).await);
        assert_eq!(err.to_string(), "cannot download frame over filter");
        assert_eq!(err.kind(), ErrorKind::Decode);
        assert_eq!(fetcher.cached_etag(), Some("\"a\""));
        assert!(Arc::ptr_eq(fetcher.cached().unwrap(), &cached));
    }

    /// Running means present in /proc and not yet a zombie.
    #[cfg(target_os = "linux")]
    fn process_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn cancel_terminates_running_filter() {
        let stub = CameraStub::start().await;
        stub.set_frame(png_frame(5), None);
        let (trigger, shutdown) = shutdown_channel();
        let pid_file = std::env::temp_dir().join(format!("camwatch-filter-{}.pid", std::process::id()));
        std::fs::remove_file(&pid_file).ok();
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());
        let mut fetcher = fetcher_with(FilterCommand::new("sh", vec!["-c".into(), script]));

        let watched = pid_file.clone();
        let cancel = tokio::spawn(async move {
            let pid = loop {
                if let Some(pid) = std::fs::read_to_string(&watched)
                    .ok()
                    .and_then(|s| s.trim().parse::<u32>().ok())
                {
                    break pid;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            assert!(process_running(pid));
            trigger.trigger();
            pid
        });

        let started = Instant::now();
        let err = expect_failed(fetcher.fetch(&target(&stub, 10), &shutdown).await);
        assert!(matches!(err, FetchError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));

        let pid = cancel.await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while process_running(pid) {
            assert!(Instant::now() < deadline, "filter {pid} still running after cancel");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        std::fs::remove_file(&pid_file).ok();
    }
}
