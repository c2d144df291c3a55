//! Tail reader: follows the access log from its current end of data.

use crate::event::RawLine;
use crate::monitor::CounterHandle;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_READ_CHUNK_BYTES: usize = 1024 * 1024;

pub struct TailReader {
    path: PathBuf,
    poll_interval: Duration,
}

impl TailReader {
    pub fn new(path: PathBuf, poll_interval: Duration) -> Self {
        Self {
            path,
            poll_interval,
        }
    }

    /// Tails the file until cancelled, pushing each complete line onto `sink`
    /// and signalling one handled-line increment per line.
    ///
    /// Pre-existing content is skipped: reading starts at the size the file
    /// had when the task launched. "No new data yet" and a shrunk or briefly
    /// missing file (truncation, in-place rotation) are transient states that
    /// are waited out; any other I/O failure is returned and takes the
    /// process down.
    pub async fn run(
        self,
        sink: mpsc::Sender<RawLine>,
        counters: CounterHandle,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut read_offset = fs::metadata(&self.path)
            .await
            .with_context(|| format!("failed to open log file {}", self.path.display()))?
            .len();
        let mut partial: Vec<u8> = Vec::new();

        info!(
            path = %self.path.display(),
            offset = read_offset,
            "tailing log file from end of existing data"
        );

        loop {
            let file_size = match fs::metadata(&self.path).await {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!(
                        path = %self.path.display(),
                        "log file missing; waiting for it to reappear"
                    );
                    if sleep_or_cancel(self.poll_interval, &cancel).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to stat log file {}", self.path.display())
                    })
                }
            };

            if file_size < read_offset {
                warn!(
                    path = %self.path.display(),
                    previous_offset = read_offset,
                    current_size = file_size,
                    "log file truncated or rotated; restarting from the beginning"
                );
                read_offset = 0;
                partial.clear();
                continue;
            }

            if file_size == read_offset {
                if sleep_or_cancel(self.poll_interval, &cancel).await {
                    return Ok(());
                }
                continue;
            }

            let bytes_to_read = (file_size - read_offset).min(MAX_READ_CHUNK_BYTES as u64) as usize;
            let buffer = read_new_bytes(&self.path, read_offset, bytes_to_read).await?;
            if buffer.is_empty() {
                if sleep_or_cancel(self.poll_interval, &cancel).await {
                    return Ok(());
                }
                continue;
            }

            read_offset += buffer.len() as u64;
            partial.extend_from_slice(&buffer);

            for line in drain_complete_lines(&mut partial) {
                let line = trim_carriage_return(line);
                counters.line_handled().await;
                if sink.send(line).await.is_err() {
                    debug!("raw line queue closed; stopping reader");
                    return Ok(());
                }
            }
        }
    }
}

/// Returns true when the token was cancelled before the duration elapsed.
pub(crate) async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = sleep(duration) => false,
    }
}

async fn read_new_bytes(path: &PathBuf, offset: u64, max_bytes: usize) -> Result<Vec<u8>> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(tokio::io::SeekFrom::Start(offset))
        .await
        .with_context(|| format!("failed to seek {} to offset {}", path.display(), offset))?;

    let mut buffer = vec![0u8; max_bytes];
    let mut total_read = 0usize;
    while total_read < max_bytes {
        let bytes_read = file
            .read(&mut buffer[total_read..])
            .await
            .with_context(|| format!("failed to read from {}", path.display()))?;
        if bytes_read == 0 {
            break;
        }
        total_read += bytes_read;
    }
    buffer.truncate(total_read);
    Ok(buffer)
}

/// Splits off every complete line, leaving any trailing partial line in the
/// buffer for the next read. The newline delimiter is not part of the result.
fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<RawLine> {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for (idx, byte) in buffer.iter().enumerate() {
        if *byte == b'\n' {
            lines.push(buffer[start..idx].to_vec());
            start = idx + 1;
        }
    }

    if start > 0 {
        buffer.drain(0..start);
    }

    lines
}

fn trim_carriage_return(mut line: RawLine) -> RawLine {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}
