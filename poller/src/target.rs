use camwatch_common::config::{check_denoise, check_rate, parse_source_url, Config, ConfigError};
use reqwest::Url;
use std::time::Duration;

/// What to poll and how often. Validated on construction and never mutated;
/// reconfiguring means building a new target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTarget {
    url: Url,
    rate: u32,
    denoise: u32,
}

impl PollTarget {
    pub fn new(url: &str, rate: u32, denoise: u32) -> Result<Self, ConfigError> {
        Ok(Self {
            url: parse_source_url(url)?,
            rate: check_rate(rate)?,
            denoise: check_denoise(denoise)?,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Self::new(&config.source.url, config.source.rate, config.filter.denoise)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Fetches per second.
    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Denoise strength, 0 when the filter is disabled.
    pub fn denoise(&self) -> u32 {
        self.denoise
    }

    /// Time between two ticks.
    pub fn period(&self) -> Duration {
        Duration::from_secs(1) / self.rate
    }
}
