use camwatch_common::frame::{DecodedFrame, PublishedFrame, Viewport};
use camwatch_common::latency::{header_text, LatencySeries, LatencyTrend};
use camwatch_poller::{FrameSink, PollEvent};
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Everything the display task consumes, in delivery order.
#[derive(Debug)]
pub enum DisplayMsg {
    Poll(PollEvent),
    /// A new session is about to start; forget the old camera.
    Reset,
}

/// The poll loop's sink: hands events to the display task and returns.
#[derive(Debug, Clone)]
pub struct DisplaySink(mpsc::UnboundedSender<DisplayMsg>);

impl DisplaySink {
    pub fn new(tx: mpsc::UnboundedSender<DisplayMsg>) -> Self {
        Self(tx)
    }
}

impl FrameSink for DisplaySink {
    fn on_frame(&mut self, frame: PublishedFrame) {
        if self.0.send(DisplayMsg::Poll(PollEvent::Frame(frame))).is_err() {
            debug!("display task gone, dropping frame");
        }
    }

    fn on_latency_sample(&mut self, seconds: f64) {
        if self.0.send(DisplayMsg::Poll(PollEvent::Latency(seconds))).is_err() {
            debug!("display task gone, dropping latency sample");
        }
    }
}

/// What is currently on screen.
pub struct DisplayState {
    frame: Option<Arc<DecodedFrame>>,
    error: Option<String>,
    observed_at: Option<DateTime<Utc>>,
    previous_at: Option<DateTime<Utc>>,
    latency: LatencySeries,
    time_format: String,
}

impl DisplayState {
    pub fn new(latency_samples: usize, time_format: String) -> Self {
        Self {
            frame: None,
            error: None,
            observed_at: None,
            previous_at: None,
            latency: LatencySeries::new(latency_samples),
            time_format,
        }
    }

    pub fn apply(&mut self, msg: DisplayMsg) {
        match msg {
            DisplayMsg::Poll(PollEvent::Frame(frame)) => self.apply_frame(frame),
            DisplayMsg::Poll(PollEvent::Latency(seconds)) => {
                self.latency
                    .add_sample(Duration::from_secs_f64(seconds.max(0.0)));
            }
            DisplayMsg::Reset => {
                let samples = self.latency.capacity();
                *self = Self::new(samples, std::mem::take(&mut self.time_format));
            }
        }
    }

    /// An image replaces the picture and clears any error; an error keeps
    /// the last good picture underneath it.
    fn apply_frame(&mut self, frame: PublishedFrame) {
        match frame.image {
            Some(image) => {
                self.frame = Some(image);
                self.error = None;
                self.previous_at = self.observed_at.replace(frame.observed_at);
            }
            None => {
                self.error = frame.error;
            }
        }
    }

    pub fn frame(&self) -> Option<Arc<DecodedFrame>> {
        self.frame.clone()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.observed_at
    }

    pub fn header(&self) -> Option<String> {
        self.observed_at
            .map(|at| header_text(at, self.previous_at, &self.time_format))
    }

    pub fn latency(&self) -> LatencyTrend {
        self.latency.render()
    }
}

/// Drain the poll queue into `state` until every sender is gone.
pub async fn run_display(mut rx: mpsc::UnboundedReceiver<DisplayMsg>, state: Arc<RwLock<DisplayState>>) {
    while let Some(msg) = rx.recv().await {
        state.write().await.apply(msg);
    }
    debug!("display queue closed");
}

/// Fit `frame` into `viewport` and encode it as JPEG.
pub fn encode_jpeg(frame: &DecodedFrame, viewport: Viewport) -> Result<Vec<u8>, image::ImageError> {
    let scaled = frame.scaled_to(viewport).into_owned();
    let rgb = DynamicImage::ImageRgba8(scaled).to_rgb8();
    let mut out = Cursor::new(Vec::new());
    rgb.write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}
