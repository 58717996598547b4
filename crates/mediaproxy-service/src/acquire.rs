//! Acquisition of content through an external downloader process.

use std::process::Stdio;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};

use crate::config::DownloaderConfig;
use crate::error::FetchError;
use crate::identifier::MediaId;

/// The placeholder that is replaced with the media identifier in the command template.
pub const ID_PLACEHOLDER: &str = "{id}";

/// Size of the chunks the downloader output is read in.
const CHUNK_SIZE: usize = 8 * 1024;

/// Runs the configured downloader and collects its standard output.
///
/// The downloader is expected to write the raw content to stdout and exit with status 0. Its
/// stdin is closed and stderr is discarded.
#[derive(Debug, Clone)]
pub struct Acquirer {
    command: Vec<String>,
    timeout: Option<Duration>,
}

impl Acquirer {
    pub fn from_config(config: &DownloaderConfig) -> Self {
        Self::new(config.command.clone(), config.timeout)
    }

    pub fn new(command: Vec<String>, timeout: Option<Duration>) -> Self {
        Self { command, timeout }
    }

    /// Downloads the content for `id`.
    ///
    /// Fails with [`FetchError::TransferFailed`] as soon as more than `limit` bytes were read. A
    /// `limit` of `0` reads the output to the end, however large it is. Partially read output is
    /// discarded on every failure.
    ///
    /// The downloader is killed when this future is dropped before it completes.
    pub async fn fetch(&self, id: &MediaId, limit: u64) -> Result<Bytes, FetchError> {
        let start = Instant::now();
        let mut child = self.spawn(id)?;
        metric!(counter("downloads.started") += 1);

        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, collect_output(&mut child, limit))
                .await
                .unwrap_or_else(|_| {
                    Err(FetchError::TransferFailed(format!(
                        "download timed out after {}",
                        humantime::format_duration(timeout)
                    )))
                }),
            None => collect_output(&mut child, limit).await,
        };

        let contents = match result {
            Ok(contents) => contents,
            Err(e) => {
                // the process may already be gone, in which case there is nothing to kill
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(e);
            }
        };

        let elapsed = start.elapsed();
        tracing::info!(
            id = %id,
            size = contents.len(),
            "Downloaded {} bytes in {:.2}s",
            contents.len(),
            elapsed.as_secs_f64(),
        );
        metric!(time_raw("downloads.size") = contents.len() as u64);
        metric!(timer("downloads.duration") = elapsed);

        Ok(contents)
    }

    fn spawn(&self, id: &MediaId) -> Result<Child, FetchError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(FetchError::ToolUnavailable(
                "no downloader command configured".into(),
            ));
        };

        Command::new(program)
            .args(args.iter().map(|arg| arg.replace(ID_PLACEHOLDER, id.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FetchError::ToolUnavailable(format!("failed to start `{program}`: {e}")))
    }
}

/// Reads the complete output of `child` and waits for it to exit successfully.
async fn collect_output(child: &mut Child, limit: u64) -> Result<Bytes, FetchError> {
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| FetchError::TransferFailed("downloader output is not captured".into()))?;
    let contents = read_bounded(&mut stdout, limit).await?;
    drop(stdout);

    let status = child
        .wait()
        .await
        .map_err(|e| FetchError::TransferFailed(format!("waiting for downloader failed: {e}")))?;
    // output of a failed run is most likely truncated
    if !status.success() {
        return Err(FetchError::TransferFailed(format!(
            "downloader exited with {status}"
        )));
    }
    if contents.is_empty() {
        return Err(FetchError::TransferFailed(
            "downloader produced no output".into(),
        ));
    }

    Ok(contents.freeze())
}

/// Reads `reader` to the end in fixed-size chunks, failing once more than `limit` bytes were read.
///
/// A `limit` of `0` disables the check.
pub async fn read_bounded<R>(reader: &mut R, limit: u64) -> Result<BytesMut, FetchError>
where
    R: AsyncRead + Unpin,
{
    let mut contents = BytesMut::new();
    let mut chunk = vec![0; CHUNK_SIZE];
    let mut total: u64 = 0;

    loop {
        let read = reader.read(&mut chunk).await.map_err(|e| {
            FetchError::TransferFailed(format!("reading downloader output failed: {e}"))
        })?;
        if read == 0 {
            return Ok(contents);
        }

        total += read as u64;
        if limit > 0 && total > limit {
            return Err(FetchError::TransferFailed(format!(
                "download exceeded {limit} bytes"
            )));
        }
        contents.extend_from_slice(&chunk[..read]);
    }
}
