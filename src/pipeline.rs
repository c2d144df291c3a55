//! Pipeline wiring and lifecycle.
//!
//! Builds the bounded queues, spawns the reader, the parser and writer pools,
//! the monitor and the status server, then supervises them: a fatal error in
//! any stage cancels the rest and propagates so the process exits nonzero.

use crate::config::Config;
use crate::event::{Event, RawLine};
use crate::monitor::{CounterHandle, CounterTotals, Monitor, QueueGauges, StatusState};
use crate::parser::{run_parser, AccessLogParser};
use crate::reader::TailReader;
use crate::sink::{InfluxDsn, InfluxWriter, PointSink};
use crate::status;
use crate::writer::{run_writer, RetryPolicy};
use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub fn build_sink(config: &Config) -> Result<Arc<dyn PointSink>> {
    let dsn = InfluxDsn::parse(&config.influx.dsn)?;
    info!(
        endpoint = %dsn.endpoint,
        database = %dsn.database,
        precision = %dsn.precision,
        "configured influxdb sink"
    );
    Ok(Arc::new(InfluxWriter::new(dsn)))
}

/// Runs the full pipeline against the sink named in the configuration.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    let sink = build_sink(&config)?;
    run_with_sink(config, sink, cancel).await
}

/// Runs the pipeline against an externally supplied sink. Returns when the
/// token is cancelled, a shutdown signal arrives, or a stage fails fatally.
pub async fn run_with_sink(
    config: Config,
    sink: Arc<dyn PointSink>,
    cancel: CancellationToken,
) -> Result<()> {
    let time_zone: Tz = config.input.time_zone.parse().map_err(|err| {
        anyhow::anyhow!("invalid time zone {:?}: {err}", config.input.time_zone)
    })?;
    let status_addr: SocketAddr = config
        .monitor
        .status_addr
        .parse()
        .with_context(|| format!("invalid status address {:?}", config.monitor.status_addr))?;

    let queue_capacity = config.pipeline.queue_capacity;
    let (raw_tx, raw_rx) = mpsc::channel::<RawLine>(queue_capacity);
    let (event_tx, event_rx) = mpsc::channel::<Event>(queue_capacity);
    let (counter_tx, counter_rx) = mpsc::channel(config.monitor.counter_capacity);
    let (totals_tx, totals_rx) = watch::channel(CounterTotals::default());

    let counters = CounterHandle::new(counter_tx);
    let gauges = QueueGauges::new(raw_tx.clone(), event_tx.clone());

    let monitor = Monitor::new(
        counter_rx,
        totals_tx,
        Duration::from_secs(config.monitor.sample_interval_secs),
    );
    let mut monitor_handle = tokio::spawn(monitor.run(cancel.clone()));

    let status_state = StatusState::new(totals_rx, gauges);
    let mut status_handle = tokio::spawn(status::serve(
        status_addr,
        status_state,
        cancel.clone(),
    ));

    let mut workers: JoinSet<Result<()>> = JoinSet::new();

    let reader = TailReader::new(
        config.input.expanded_path(),
        Duration::from_millis(config.input.poll_interval_ms),
    );
    workers.spawn(reader.run(raw_tx, counters.clone(), cancel.clone()));

    let raw_source = Arc::new(Mutex::new(raw_rx));
    for _ in 0..config.pipeline.parser_workers {
        workers.spawn(run_parser(
            AccessLogParser::new(time_zone),
            raw_source.clone(),
            event_tx.clone(),
            counters.clone(),
            cancel.clone(),
        ));
    }
    drop(raw_source);
    drop(event_tx);

    let retry = RetryPolicy {
        max_attempts: config.influx.retry_max_attempts,
        base_delay: Duration::from_millis(config.influx.retry_base_delay_ms),
    };
    let event_source = Arc::new(Mutex::new(event_rx));
    for _ in 0..config.pipeline.writer_workers {
        workers.spawn(run_writer(
            event_source.clone(),
            sink.clone(),
            retry,
            cancel.clone(),
        ));
    }
    drop(event_source);

    info!(
        parser_workers = config.pipeline.parser_workers,
        writer_workers = config.pipeline.writer_workers,
        queue_capacity,
        "pipeline started"
    );

    let mut fatal: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "failed while waiting for shutdown signal");
                }
                info!("shutdown signal received");
                cancel.cancel();
                break;
            }
            _ = cancel.cancelled() => {
                info!("cancellation requested; shutting down");
                break;
            }
            maybe = workers.join_next() => match maybe {
                Some(Ok(Ok(()))) => continue,
                Some(Ok(Err(err))) => {
                    error!(error = %err, "pipeline stage failed; shutting down");
                    cancel.cancel();
                    fatal = Some(err);
                    break;
                }
                Some(Err(join_err)) => {
                    error!(error = %join_err, "pipeline stage panicked; shutting down");
                    cancel.cancel();
                    fatal = Some(anyhow::anyhow!(join_err));
                    break;
                }
                None => break,
            },
        }
    }

    drain_workers(&mut workers).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut monitor_handle)
        .await
        .is_err()
    {
        monitor_handle.abort();
    }
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut status_handle)
        .await
        .is_err()
    {
        status_handle.abort();
    }

    match fatal {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn drain_workers(workers: &mut JoinSet<Result<()>>) {
    let deadline = sleep(SHUTDOWN_TIMEOUT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            maybe = workers.join_next() => match maybe {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    warn!(error = %err, "stage exited with error during shutdown");
                }
                Some(Err(join_err)) => {
                    if !join_err.is_cancelled() {
                        warn!(error = %join_err, "stage panicked during shutdown");
                    }
                }
                None => return,
            },
            _ = &mut deadline => {
                warn!("pipeline stages did not stop within timeout; aborting");
                workers.abort_all();
                while workers.join_next().await.is_some() {}
                return;
            }
        }
    }
}

pub(crate) async fn recv_shared<T>(source: &Arc<Mutex<mpsc::Receiver<T>>>) -> Option<T> {
    source.lock().await.recv().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{Point, SinkError};
    use async_trait::async_trait;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    struct CollectSink {
        points: std::sync::Mutex<Vec<Point>>,
    }

    #[async_trait]
    impl PointSink for CollectSink {
        async fn write(&self, points: &[Point]) -> Result<(), SinkError> {
            self.points.lock().unwrap().extend_from_slice(points);
            Ok(())
        }
    }

    /// Accepts no writes until released, simulating paused writers.
    struct BlockedSink {
        release: Notify,
    }

    #[async_trait]
    impl PointSink for BlockedSink {
        async fn write(&self, _points: &[Point]) -> Result<(), SinkError> {
            self.release.notified().await;
            Ok(())
        }
    }

    fn append(file: &NamedTempFile, data: &str) {
        let mut handle = std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap();
        handle.write_all(data.as_bytes()).unwrap();
        handle.flush().unwrap();
    }

    fn test_config(path: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.input.path = path.to_string_lossy().into_owned();
        config.input.poll_interval_ms = 10;
        config.monitor.status_addr = "127.0.0.1:0".to_string();
        config
    }

    const WELL_FORMED: &str = "172.0.0.12 - - [2020-08-03T21:25:48+08:00] https \"GET /foo?x=1 HTTP/1.0\" 200 1905 \"-\" \"KeepAliveClient\" \"-\" - 1.470\n";

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn end_to_end_delivers_parsed_events_to_the_sink() {
        let file = NamedTempFile::new().unwrap();
        let config = test_config(file.path());
        let sink = Arc::new(CollectSink {
            points: std::sync::Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();

        let pipeline = tokio::spawn(run_with_sink(
            config,
            sink.clone() as Arc<dyn PointSink>,
            cancel.clone(),
        ));

        // Let the reader record its starting offset before appending.
        tokio::time::sleep(Duration::from_millis(300)).await;
        append(&file, WELL_FORMED);
        append(&file, "garbage that matches nothing\n");

        timeout(Duration::from_secs(10), async {
            loop {
                if !sink.points.lock().unwrap().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("sink should receive a point");

        let points = sink.points.lock().unwrap().clone();
        assert_eq!(points.len(), 1);
        let point = &points[0];
        assert_eq!(point.measurement, "nginx_log");
        assert_eq!(point.tags[0], ("path".to_string(), "/foo".to_string()));
        assert_eq!(point.tags[2], ("scheme".to_string(), "https".to_string()));

        cancel.cancel();
        timeout(Duration::from_secs(15), pipeline)
            .await
            .expect("pipeline should stop after cancellation")
            .unwrap()
            .expect("cancelled pipeline exits cleanly");
    }

    /// With writers paused, parsers fill the event queue and block; the
    /// reader then fills the raw-line queue and blocks too. Neither queue
    /// ever exceeds its capacity and intake stalls instead of dropping.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saturated_queues_block_upstream_stages_within_capacity() {
        const CAPACITY: usize = 2;
        let file = NamedTempFile::new().unwrap();

        let (raw_tx, raw_rx) = mpsc::channel::<RawLine>(CAPACITY);
        let (event_tx, event_rx) = mpsc::channel::<Event>(CAPACITY);
        let (counter_tx, counter_rx) = mpsc::channel(256);
        let (totals_tx, totals_rx) = watch::channel(CounterTotals::default());
        let cancel = CancellationToken::new();

        let counters = CounterHandle::new(counter_tx);
        let gauges = QueueGauges::new(raw_tx.clone(), event_tx.clone());

        let monitor = Monitor::new(counter_rx, totals_tx, Duration::from_secs(5));
        tokio::spawn(monitor.run(cancel.clone()));

        let sink = Arc::new(BlockedSink {
            release: Notify::new(),
        });

        let reader = TailReader::new(file.path().to_path_buf(), Duration::from_millis(10));
        tokio::spawn(reader.run(raw_tx, counters.clone(), cancel.clone()));

        let raw_source = Arc::new(Mutex::new(raw_rx));
        tokio::spawn(run_parser(
            AccessLogParser::new("Asia/Shanghai".parse().unwrap()),
            raw_source,
            event_tx,
            counters,
            cancel.clone(),
        ));

        let event_source = Arc::new(Mutex::new(event_rx));
        tokio::spawn(run_writer(
            event_source,
            sink.clone() as Arc<dyn PointSink>,
            RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(1),
            },
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        const TOTAL_LINES: u64 = 30;
        for _ in 0..TOTAL_LINES {
            append(&file, WELL_FORMED);
        }

        // Wait for the pipeline to wedge: both queues full, writer parked in
        // the sink, reader unable to push further.
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(gauges.read_queue_depth() <= CAPACITY);
        assert!(gauges.write_queue_depth() <= CAPACITY);
        assert_eq!(gauges.read_queue_depth(), CAPACITY);
        assert_eq!(gauges.write_queue_depth(), CAPACITY);

        // Intake has stalled well short of the appended line count.
        let stalled_at = totals_rx.borrow().handled_lines;
        assert!(stalled_at < TOTAL_LINES);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(totals_rx.borrow().handled_lines, stalled_at);

        cancel.cancel();
        sink.release.notify_waiters();
    }
}
