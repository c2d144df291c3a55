//! Self-monitoring: counter aggregation, throughput sampling and the live
//! system snapshot.
//!
//! The monitor task is the only owner of the mutable counters. Reader and
//! parser workers send increments over a bounded channel; aggregated totals
//! are published through a watch channel so the status responder never
//! touches the counters themselves.

use crate::event::{Event, RawLine};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// An out-of-band counter increment from a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterEvent {
    /// The reader consumed one line from the log file.
    LineHandled,
    /// A parser worker observed one failure while handling a line.
    ParseError,
}

/// Cheap cloneable handle used by pipeline stages to report increments.
#[derive(Clone)]
pub struct CounterHandle {
    tx: mpsc::Sender<CounterEvent>,
}

impl CounterHandle {
    pub fn new(tx: mpsc::Sender<CounterEvent>) -> Self {
        Self { tx }
    }

    pub async fn line_handled(&self) {
        let _ = self.tx.send(CounterEvent::LineHandled).await;
    }

    pub async fn parse_error(&self) {
        let _ = self.tx.send(CounterEvent::ParseError).await;
    }
}

/// Aggregated totals published by the monitor task.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CounterTotals {
    pub handled_lines: u64,
    pub error_count: u64,
    pub tps: f64,
}

/// Rolling buffer of the two most recent `handled_lines` samples.
#[derive(Debug, Default)]
pub struct ThroughputWindow {
    samples: Vec<u64>,
}

impl ThroughputWindow {
    pub fn push(&mut self, handled_lines: u64) {
        self.samples.push(handled_lines);
        if self.samples.len() > 2 {
            self.samples.remove(0);
        }
    }

    /// Lines per second between the two retained samples; zero until the
    /// window is full.
    pub fn rate(&self, interval: Duration) -> f64 {
        if self.samples.len() < 2 || interval.is_zero() {
            return 0.0;
        }
        self.samples[1].saturating_sub(self.samples[0]) as f64 / interval.as_secs_f64()
    }
}

/// Owns the counters; applies increments one at a time and samples throughput
/// on a fixed interval.
pub struct Monitor {
    counter_rx: mpsc::Receiver<CounterEvent>,
    totals_tx: watch::Sender<CounterTotals>,
    sample_interval: Duration,
    window: ThroughputWindow,
    handled_lines: u64,
    error_count: u64,
    tps: f64,
}

impl Monitor {
    pub fn new(
        counter_rx: mpsc::Receiver<CounterEvent>,
        totals_tx: watch::Sender<CounterTotals>,
        sample_interval: Duration,
    ) -> Self {
        Self {
            counter_rx,
            totals_tx,
            sample_interval,
            window: ThroughputWindow::default(),
            handled_lines: 0,
            error_count: 0,
            tps: 0.0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.sample_interval;
        let mut ticker = tokio::time::interval_at(start, self.sample_interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.window.push(self.handled_lines);
                    self.tps = self.window.rate(self.sample_interval);
                    debug!(
                        handled_lines = self.handled_lines,
                        error_count = self.error_count,
                        tps = self.tps,
                        "sampled throughput"
                    );
                    self.publish();
                }
                maybe = self.counter_rx.recv() => match maybe {
                    Some(event) => {
                        self.apply(event);
                        // Drain whatever else is queued so bursts publish once.
                        while let Ok(event) = self.counter_rx.try_recv() {
                            self.apply(event);
                        }
                        self.publish();
                    }
                    None => return,
                },
            }
        }
    }

    fn apply(&mut self, event: CounterEvent) {
        match event {
            CounterEvent::LineHandled => self.handled_lines += 1,
            CounterEvent::ParseError => self.error_count += 1,
        }
    }

    fn publish(&self) {
        let _ = self.totals_tx.send(CounterTotals {
            handled_lines: self.handled_lines,
            error_count: self.error_count,
            tps: self.tps,
        });
    }
}

/// Advisory view of the two data queues, read without touching the queues'
/// consumers.
#[derive(Clone)]
pub struct QueueGauges {
    raw: mpsc::Sender<RawLine>,
    event: mpsc::Sender<Event>,
}

impl QueueGauges {
    pub fn new(raw: mpsc::Sender<RawLine>, event: mpsc::Sender<Event>) -> Self {
        Self { raw, event }
    }

    pub fn read_queue_depth(&self) -> usize {
        self.raw.max_capacity().saturating_sub(self.raw.capacity())
    }

    pub fn write_queue_depth(&self) -> usize {
        self.event
            .max_capacity()
            .saturating_sub(self.event.capacity())
    }
}

/// Live state of the pipeline, recomputed for every status request.
/// Field order is the serialized order.
#[derive(Debug, Clone, Serialize)]
pub struct SystemSnapshot {
    pub handle_line: u64,
    pub tps: f64,
    pub read_chan_len: usize,
    pub write_chan_len: usize,
    pub run_time: String,
    pub err_num: u64,
}

/// Everything the status responder needs to assemble a snapshot.
#[derive(Clone)]
pub struct StatusState {
    started_at: Instant,
    totals_rx: watch::Receiver<CounterTotals>,
    gauges: QueueGauges,
}

impl StatusState {
    pub fn new(totals_rx: watch::Receiver<CounterTotals>, gauges: QueueGauges) -> Self {
        Self {
            started_at: Instant::now(),
            totals_rx,
            gauges,
        }
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        let totals = *self.totals_rx.borrow();
        let uptime = Duration::from_secs(self.started_at.elapsed().as_secs());
        SystemSnapshot {
            handle_line: totals.handled_lines,
            tps: totals.tps,
            read_chan_len: self.gauges.read_queue_depth(),
            write_chan_len: self.gauges.write_queue_depth(),
            run_time: humantime::format_duration(uptime).to_string(),
            err_num: totals.error_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_reports_zero_until_two_samples() {
        let mut window = ThroughputWindow::default();
        assert_eq!(window.rate(Duration::from_secs(5)), 0.0);
        window.push(100);
        assert_eq!(window.rate(Duration::from_secs(5)), 0.0);
        window.push(150);
        assert_eq!(window.rate(Duration::from_secs(5)), 10.0);
    }

    #[test]
    fn window_discards_oldest_sample_beyond_two() {
        let mut window = ThroughputWindow::default();
        window.push(0);
        window.push(50);
        window.push(200);
        // Retained samples are now 50 and 200.
        assert_eq!(window.rate(Duration::from_secs(5)), 30.0);
    }

    #[test]
    fn queue_depth_never_exceeds_capacity() {
        let (raw_tx, _raw_rx) = mpsc::channel::<RawLine>(4);
        let (event_tx, _event_rx) = mpsc::channel::<Event>(4);
        let gauges = QueueGauges::new(raw_tx.clone(), event_tx);

        assert_eq!(gauges.read_queue_depth(), 0);
        for _ in 0..4 {
            raw_tx.try_send(Vec::new()).unwrap();
        }
        assert_eq!(gauges.read_queue_depth(), 4);
        assert!(raw_tx.try_send(Vec::new()).is_err());
        assert_eq!(gauges.read_queue_depth(), 4);
    }

    #[test]
    fn snapshot_serializes_with_stable_field_order() {
        let snapshot = SystemSnapshot {
            handle_line: 12,
            tps: 2.4,
            read_chan_len: 1,
            write_chan_len: 0,
            run_time: "5s".to_string(),
            err_num: 3,
        };
        let rendered = serde_json::to_string_pretty(&snapshot).unwrap();
        let order = [
            "handle_line",
            "tps",
            "read_chan_len",
            "write_chan_len",
            "run_time",
            "err_num",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|key| rendered.find(key).expect("field should be present"))
            .collect();
        assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_aggregates_increments_and_samples_throughput() {
        let (counter_tx, counter_rx) = mpsc::channel(64);
        let (totals_tx, totals_rx) = watch::channel(CounterTotals::default());
        let cancel = CancellationToken::new();
        let monitor = Monitor::new(counter_rx, totals_tx, Duration::from_secs(5));
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        let counters = CounterHandle::new(counter_tx);
        for _ in 0..10 {
            counters.line_handled().await;
        }
        counters.parse_error().await;
        counters.parse_error().await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let totals = *totals_rx.borrow();
        assert_eq!(totals.handled_lines, 10);
        assert_eq!(totals.error_count, 2);
        assert_eq!(totals.tps, 0.0);

        // First sample at t=5s; one sample is not enough for a rate.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(totals_rx.borrow().tps, 0.0);

        for _ in 0..25 {
            counters.line_handled().await;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        // Window holds 10 and 35: (35 - 10) / 5s.
        assert_eq!(totals_rx.borrow().tps, 5.0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
