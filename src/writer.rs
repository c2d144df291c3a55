//! Writer pool: turns events into single-point batches and submits them to
//! the sink.

use crate::event::Event;
use crate::pipeline::recv_shared;
use crate::sink::{FieldValue, Point, PointSink};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const MEASUREMENT: &str = "nginx_log";

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
}

pub fn point_from_event(event: &Event) -> Point {
    Point {
        measurement: MEASUREMENT.to_string(),
        tags: vec![
            ("path".to_string(), event.path.clone()),
            ("method".to_string(), event.method.clone()),
            ("scheme".to_string(), event.scheme.clone()),
            ("status".to_string(), event.status.clone()),
        ],
        fields: vec![
            (
                "upstream-time".to_string(),
                FieldValue::Float(event.upstream_time),
            ),
            (
                "request-time".to_string(),
                FieldValue::Float(event.request_time),
            ),
            (
                "bytes-sent".to_string(),
                FieldValue::Integer(event.bytes_sent as i64),
            ),
        ],
        timestamp: event.occurred_at,
    }
}

/// One writer worker: consumes events one at a time and submits each as its
/// own batch. An error the retry policy cannot absorb is returned and takes
/// the whole pipeline down.
pub async fn run_writer(
    source: Arc<Mutex<mpsc::Receiver<Event>>>,
    sink: Arc<dyn PointSink>,
    retry: RetryPolicy,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            maybe = recv_shared(&source) => match maybe {
                Some(event) => event,
                None => {
                    debug!("event queue closed; stopping writer worker");
                    return Ok(());
                }
            },
        };

        let point = point_from_event(&event);
        write_with_retry(sink.as_ref(), &[point], retry, &cancel).await?;
    }
}

/// Submits a batch, retrying transient failures with exponential backoff.
/// Exhausting the configured attempts, or a non-retryable rejection,
/// escalates by returning the error.
pub async fn write_with_retry(
    sink: &dyn PointSink,
    points: &[Point],
    retry: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let max_attempts = retry.max_attempts.max(1);
    let mut backoff = retry.base_delay.max(Duration::from_millis(1));
    let mut attempt = 0usize;

    loop {
        attempt += 1;
        match sink.write(points).await {
            Ok(()) => {
                debug!(count = points.len(), "batch written to sink");
                return Ok(());
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    error = %err,
                    "sink write failed; retrying with backoff"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("cancelled during sink retry; dropping in-flight batch");
                        return Ok(());
                    }
                    _ = sleep(backoff) => {}
                }
                backoff = std::cmp::min(backoff.saturating_mul(2), MAX_BACKOFF);
            }
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("sink write failed after {attempt} attempt(s)")));
            }
        }
    }
}
