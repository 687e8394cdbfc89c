use camwatch_common::frame::{FrameDigest, PublishedFrame};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::fetcher::{FetchError, FetchResult, FetcherOptions, FrameFetcher};
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
use crate::target::PollTarget;

/// Receiver of poll output. Implementations must return quickly: the poll
/// task calls these inline and never waits for rendering.
pub trait FrameSink: Send + 'static {
    fn on_frame(&mut self, frame: PublishedFrame);

    /// Seconds between this image publish and the previous one.
    fn on_latency_sample(&mut self, seconds: f64);
}

/// Queue item for sinks backed by a channel.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Frame(PublishedFrame),
    Latency(f64),
}

impl FrameSink for mpsc::UnboundedSender<PollEvent> {
    fn on_frame(&mut self, frame: PublishedFrame) {
        if self.send(PollEvent::Frame(frame)).is_err() {
            debug!("display queue closed, dropping frame");
        }
    }

    fn on_latency_sample(&mut self, seconds: f64) {
        if self.send(PollEvent::Latency(seconds)).is_err() {
            debug!("display queue closed, dropping latency sample");
        }
    }
}

/// What was last handed to the sink, compared by value.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Published {
    Frame(FrameDigest),
    Error(String),
}

/// One poll session: a fixed-rate fetch loop feeding a [`FrameSink`].
pub struct PollLoop<S> {
    target: PollTarget,
    fetcher: FrameFetcher,
    sink: S,
    last: Option<Published>,
    last_image_at: Option<Instant>,
}

impl<S: FrameSink> PollLoop<S> {
    pub fn new(target: PollTarget, fetcher: FrameFetcher, sink: S) -> Self {
        Self {
            target,
            fetcher,
            sink,
            last: None,
            last_image_at: None,
        }
    }

    /// Tick until `shutdown` fires. At most one fetch is outstanding; ticks
    /// that elapse during a slow fetch are skipped rather than queued.
    pub async fn run(mut self, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.target.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            url = %self.target.url(),
            rate = self.target.rate(),
            denoise = self.target.denoise(),
            "poll loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = self.fetcher.fetch(&self.target, &shutdown).await;
            if matches!(result, FetchResult::Failed(FetchError::Cancelled)) {
                break;
            }
            self.handle(result, Instant::now(), Utc::now());

            // Nothing from this tick is held past this point.
            tokio::task::yield_now().await;
        }

        info!(url = %self.target.url(), "poll loop stopped");
    }

    /// Publish `result` unless it is identical to the last publish. Returns
    /// whether the sink was called.
    fn handle(&mut self, result: FetchResult, now: Instant, observed_at: DateTime<Utc>) -> bool {
        let (identity, frame) = match result {
            FetchResult::Fresh { frame, .. } => (
                Published::Frame(frame.digest),
                PublishedFrame::image(frame, observed_at),
            ),
            FetchResult::Unchanged => match self.fetcher.cached() {
                Some(frame) => (
                    Published::Frame(frame.digest),
                    PublishedFrame::image(Arc::clone(frame), observed_at),
                ),
                None => return false,
            },
            FetchResult::Failed(e) => {
                warn!(error = %e, kind = ?e.kind(), url = %self.target.url(), "fetch failed");
                let message = e.to_string();
                (
                    Published::Error(message.clone()),
                    PublishedFrame::error(message, observed_at),
                )
            }
        };

        if self.last.as_ref() == Some(&identity) {
            debug!("frame unchanged, not publishing");
            return false;
        }

        let has_image = frame.image.is_some();
        self.sink.on_frame(frame);
        self.last = Some(identity);

        if has_image {
            if let Some(previous) = self.last_image_at.replace(now) {
                let interval = now.saturating_duration_since(previous);
                self.sink.on_latency_sample(interval.as_secs_f64());
            }
        }
        true
    }
}

/// A running [`PollLoop`] on its own task.
pub struct PollSession {
    target: PollTarget,
    trigger: ShutdownTrigger,
    handle: JoinHandle<()>,
}

impl PollSession {
    /// Spawn a loop with a brand-new fetcher, so nothing cached by an earlier
    /// session can leak into this one.
    pub fn start<S: FrameSink>(
        target: PollTarget,
        options: FetcherOptions,
        sink: S,
    ) -> Result<Self, FetchError> {
        let fetcher = FrameFetcher::new(options)?;
        let (trigger, shutdown) = shutdown_channel();
        let handle = tokio::spawn(PollLoop::new(target.clone(), fetcher, sink).run(shutdown));
        Ok(Self {
            target,
            trigger,
            handle,
        })
    }

    pub fn target(&self) -> &PollTarget {
        &self.target
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop, including any in-flight fetch, and wait for it.
    pub async fn stop(self) {
        self.trigger.trigger();
        if let Err(e) = self.handle.await {
            error!(error = %e, "poll task ended abnormally");
        }
    }
}

/// Owns at most one [`PollSession`] and swaps it out on reconfiguration.
pub struct Poller<S> {
    options: FetcherOptions,
    sink: S,
    session: Option<PollSession>,
}

impl<S: FrameSink + Clone> Poller<S> {
    pub fn new(options: FetcherOptions, sink: S) -> Self {
        Self {
            options,
            sink,
            session: None,
        }
    }

    pub fn target(&self) -> Option<&PollTarget> {
        self.session.as_ref().map(PollSession::target)
    }

    /// Stop the current session completely, then start one for `target`.
    pub async fn restart(&mut self, target: PollTarget) -> Result<(), FetchError> {
        self.stop().await;
        info!(url = %target.url(), rate = target.rate(), "starting poll session");
        self.session = Some(PollSession::start(
            target,
            self.options.clone(),
            self.sink.clone(),
        )?);
        Ok(())
    }

    pub async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
    }
}
