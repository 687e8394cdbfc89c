//! Periodic snapshot acquisition: conditional fetch, optional denoise
//! filter, decode, and publication to a display sink.

pub mod denoise;
pub mod fetcher;
pub mod poll;
pub mod shutdown;
pub mod target;

#[cfg(test)]
mod test_support;

pub use fetcher::{ErrorKind, FetchError, FetchResult, FetcherOptions, FrameFetcher};
pub use poll::{FrameSink, PollEvent, PollLoop, PollSession, Poller};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use target::PollTarget;
