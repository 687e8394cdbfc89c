use bytes::Bytes;
use camwatch_common::config::FilterConfig;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::fetcher::FetchError;

const STRENGTH_PLACEHOLDER: &str = "{strength}";

/// The external denoise filter. One process is spawned per frame: encoded
/// bytes go in on stdin, re-encoded bytes come out on stdout, and stderr is
/// passed through to ours.
#[derive(Debug, Clone)]
pub struct FilterCommand {
    program: String,
    args: Vec<String>,
}

impl FilterCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments with every `{strength}` replaced.
    pub fn args_for(&self, strength: u32) -> Vec<String> {
        let strength = strength.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace(STRENGTH_PLACEHOLDER, &strength))
            .collect()
    }

    /// Pipe `body` through the filter and return what it wrote to stdout.
    ///
    /// The child is killed if this future is dropped before it exits.
    pub async fn run<S, E>(&self, strength: u32, body: S) -> Result<Vec<u8>, FetchError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        let mut child = Command::new(&self.program)
            .args(self.args_for(strength))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::FilterSpawn(format!("{}: {e}", self.program)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| FetchError::FilterSpawn("could not get stdin handle".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::FilterSpawn("could not get stdout handle".into()))?;

        debug!(program = self.program, strength, "filter started");

        // Feed and drain concurrently, otherwise a filter that fills its
        // stdout pipe before reading all of stdin deadlocks us.
        let feed = async move {
            let mut body = Box::pin(body);
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| FetchError::Body(e.to_string()))?;
                match stdin.write_all(&chunk).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                        // The filter stopped reading; its exit status decides.
                        debug!("filter closed stdin early");
                        return Ok(());
                    }
                    Err(e) => return Err(FetchError::FilterIo(e.to_string())),
                }
            }
            // Dropping stdin here delivers EOF to the filter.
            Ok::<(), FetchError>(())
        };
        let drain = async {
            let mut out = Vec::new();
            stdout
                .read_to_end(&mut out)
                .await
                .map_err(|e| FetchError::FilterIo(e.to_string()))?;
            Ok::<Vec<u8>, FetchError>(out)
        };

        let ((), output) = tokio::try_join!(feed, drain)?;

        let status = child
            .wait()
            .await
            .map_err(|e| FetchError::FilterIo(e.to_string()))?;
        if !status.success() {
            warn!(program = self.program, %status, "filter exited with error");
            return Err(FetchError::FilterFailed {
                code: status.code(),
            });
        }

        debug!(bytes = output.len(), "filter finished");
        Ok(output)
    }
}

impl Default for FilterCommand {
    fn default() -> Self {
        Self::from_config(&FilterConfig::default())
    }
}
