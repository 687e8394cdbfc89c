//! Standalone variant: poll a snapshot URL and feed every response body
//! into an ffmpeg | player pipeline, with no decoding of our own.

use clap::Parser;
use futures_util::StreamExt;
use reqwest::Url;
use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipeError {
    #[error("cannot start pipeline: {0}")]
    Spawn(std::io::Error),
    #[error("cannot build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("cannot do GET request: {0}")]
    Request(reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("pipeline closed its input: {0}")]
    Stdin(std::io::Error),
}

/// Command line arguments.
#[derive(Parser, Debug, Clone)]
#[command(about = "Poll a camera snapshot URL and play it as video.")]
pub struct Args {
    /// Snapshot URL (http or https).
    #[arg(value_parser = parse_url)]
    pub url: Url,

    /// Polls per second.
    #[arg(long, default_value_t = 15, value_parser = clap::value_parser!(u32).range(1..=60))]
    pub rate: u32,

    /// Player command; the muxed stream is appended as `-` (stdin).
    #[arg(long, default_value = "mpv --cache=no")]
    pub player: String,
}

fn parse_url(raw: &str) -> Result<Url, String> {
    let url = Url::parse(raw.trim()).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme {other:?}, expected http or https")),
    }
}

fn pipeline_command(rate: u32, player: &str) -> String {
    format!(
        "ffmpeg -loglevel warning -f image2pipe -r {rate} -vcodec mjpeg -i - -f matroska - | {player} -"
    )
}

/// GET `url` and stream its body into `sink` chunk by chunk.
async fn forward_frame<W>(client: &reqwest::Client, url: &Url, sink: &mut W) -> Result<usize, PipeError>
where
    W: AsyncWrite + Unpin,
{
    let resp = client
        .get(url.clone())
        .send()
        .await
        .map_err(PipeError::Request)?;
    if !resp.status().is_success() {
        return Err(PipeError::Status(resp.status().as_u16()));
    }

    let mut written = 0;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(PipeError::Request)?;
        sink.write_all(&chunk).await.map_err(PipeError::Stdin)?;
        written += chunk.len();
    }
    sink.flush().await.map_err(PipeError::Stdin)?;
    Ok(written)
}

/// Forward one snapshot per tick until `stop` resolves or the sink is gone.
async fn run<W, F>(client: &reqwest::Client, url: &Url, rate: u32, sink: &mut W, stop: F) -> u64
where
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(rate)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(stop);
    let mut frames = 0u64;

    loop {
        tokio::select! {
            biased;
            () = &mut stop => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            biased;
            () = &mut stop => break,
            r = forward_frame(client, url, sink) => r,
        };
        match result {
            Ok(bytes) => {
                frames += 1;
                debug!(frames, bytes, "frame forwarded");
            }
            Err(e @ PipeError::Stdin(_)) => {
                warn!(error = %e, "player exited");
                break;
            }
            Err(e) => warn!(error = %e, "failed to fetch camera frame"),
        }
    }
    frames
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let client = match reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", PipeError::Client(e));
            std::process::exit(1);
        }
    };

    let pipeline = pipeline_command(args.rate, &args.player);
    info!(url = %args.url, rate = args.rate, pipeline, "starting camwatch pipe");

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(&pipeline)
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", PipeError::Spawn(e));
            std::process::exit(1);
        }
    };
    let Some(mut stdin) = child.stdin.take() else {
        eprintln!("{}", PipeError::Spawn(std::io::ErrorKind::BrokenPipe.into()));
        std::process::exit(1);
    };

    let frames = run(&client, &args.url, args.rate, &mut stdin, ctrl_c()).await;
    drop(stdin);

    match child.wait().await {
        Ok(status) => info!(frames, %status, "pipeline finished"),
        Err(e) => error!(error = %e, "cannot wait for pipeline"),
    }
}
