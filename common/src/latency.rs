use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// Fixed-capacity series of inter-arrival times between published frames,
/// oldest first. Only feeds the trend graph.
#[derive(Debug, Clone)]
pub struct LatencySeries {
    samples: VecDeque<Duration>,
    max: usize,
}

/// Snapshot of a [`LatencySeries`] in seconds, with the bounds a graph needs
/// to scale its Y axis.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatencyTrend {
    pub samples_secs: Vec<f64>,
    pub min_secs: f64,
    pub max_secs: f64,
}

impl LatencySeries {
    /// A capacity of 0 is bumped to 1.
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            samples: VecDeque::with_capacity(max),
            max,
        }
    }

    pub fn add_sample(&mut self, interval: Duration) {
        if self.samples.len() == self.max {
            self.samples.pop_front();
        }
        self.samples.push_back(interval);
    }

    pub fn samples(&self) -> impl Iterator<Item = Duration> + '_ {
        self.samples.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn latest(&self) -> Option<Duration> {
        self.samples.back().copied()
    }

    /// `(min, max)` over the current samples.
    pub fn range(&self) -> Option<(Duration, Duration)> {
        let min = self.samples.iter().min()?;
        let max = self.samples.iter().max()?;
        Some((*min, *max))
    }

    pub fn render(&self) -> LatencyTrend {
        let (min, max) = self.range().unwrap_or_default();
        LatencyTrend {
            samples_secs: self.samples.iter().map(Duration::as_secs_f64).collect(),
            min_secs: min.as_secs_f64(),
            max_secs: max.as_secs_f64(),
        }
    }
}

/// Compact duration label: `" 250ms"` up to 9999ms, above that seconds to
/// three significant digits with trailing zeros dropped (`"12.3s"`, `"20s"`).
pub fn short_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms <= 9999 {
        return format!("{ms:4}ms");
    }
    let secs = d.as_secs_f64();
    let text = if secs < 100.0 {
        format!("{secs:.1}")
    } else {
        format!("{secs:.0}")
    };
    let text = match text.split_once('.') {
        Some((whole, "0")) => whole.to_owned(),
        _ => text,
    };
    format!("{text}s")
}

/// The timestamp label shown above the frame, in local time, with the gap
/// since the previous frame appended when there is one.
pub fn header_text(
    observed_at: DateTime<Utc>,
    previous: Option<DateTime<Utc>>,
    time_format: &str,
) -> String {
    let mut text = observed_at
        .with_timezone(&Local)
        .format(time_format)
        .to_string();
    if let Some(gap) = previous.and_then(|prev| (observed_at - prev).to_std().ok()) {
        text.push(' ');
        text.push_str(&short_duration(gap));
    }
    text
}
