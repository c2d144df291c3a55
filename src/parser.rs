//! Access-log line grammar and the parser worker pool.

use crate::event::{Event, RawLine};
use crate::monitor::CounterHandle;
use crate::pipeline::recv_shared;
use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use http::Uri;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

lazy_static! {
    // <ip> - - [<timestamp>] <scheme> "<METHOD> <target> <protocol>" <status> <bytes>
    // "<referer>" "<agent>" "<forwarded-ip>" <upstream-time> <request-time>
    static ref ACCESS_LOG_RE: Regex = Regex::new(
        r#"([\d\.]+)\s+([^ \[]+)\s+([^ \[]+)\s+\[([^\]]+)\]\s+([a-z]+)\s+"([^"]+)"\s+(\d{3})\s+(\d+)\s+"([^"]+)"\s+"(.*?)"\s+"([\d\.-]+)"\s+([\d\.-]+)\s+([\d\.-]+)"#
    )
    .unwrap();
}

/// Result of feeding one raw line through the grammar.
///
/// `errors` counts every failure observed while handling the line: a line
/// that fails the grammar outright yields no event and one error, while a
/// line with an unparsable timestamp still yields an event alongside the
/// error it recorded.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub event: Option<Event>,
    pub errors: u32,
}

/// Stateless line parser; any number of workers may share the compiled
/// grammar and parse concurrently.
#[derive(Debug, Clone, Copy)]
pub struct AccessLogParser {
    time_zone: Tz,
}

impl AccessLogParser {
    pub fn new(time_zone: Tz) -> Self {
        Self { time_zone }
    }

    pub fn parse_line(&self, line: &RawLine) -> ParseOutcome {
        let text = String::from_utf8_lossy(line);
        let caps = match ACCESS_LOG_RE.captures(&text) {
            Some(caps) => caps,
            None => {
                warn!(line = %line_preview(&text), "line did not match access log format");
                return ParseOutcome {
                    event: None,
                    errors: 1,
                };
            }
        };

        let mut errors = 0u32;

        let occurred_at = match self.parse_timestamp(&caps[4]) {
            Some(parsed) => parsed,
            None => {
                errors += 1;
                warn!(value = &caps[4], "failed to parse event timestamp");
                DateTime::UNIX_EPOCH
            }
        };

        let bytes_sent = caps[8].parse::<u64>().unwrap_or(0);

        let request = &caps[6];
        let tokens: Vec<&str> = request.split(' ').collect();
        if tokens.len() != 3 {
            errors += 1;
            warn!(request = %request, "request field is not method, target and protocol");
            return ParseOutcome {
                event: None,
                errors,
            };
        }

        let target: Uri = match tokens[1].parse() {
            Ok(uri) => uri,
            Err(err) => {
                errors += 1;
                warn!(request_target = tokens[1], error = %err, "failed to parse request target");
                return ParseOutcome {
                    event: None,
                    errors,
                };
            }
        };

        let event = Event {
            occurred_at,
            bytes_sent,
            path: target.path().to_string(),
            method: tokens[0].to_string(),
            scheme: caps[5].to_string(),
            status: caps[7].to_string(),
            upstream_time: caps[12].parse().unwrap_or(0.0),
            request_time: caps[13].parse().unwrap_or(0.0),
        };

        ParseOutcome {
            event: Some(event),
            errors,
        }
    }

    fn parse_timestamp(&self, raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        // Timestamps without an offset are interpreted in the configured zone.
        let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok()?;
        self.time_zone
            .from_local_datetime(&naive)
            .single()
            .map(|local| local.with_timezone(&Utc))
    }
}

/// One parser worker: drains raw lines from the shared queue, reports every
/// failure as a counter increment, and pushes events downstream. Blocks when
/// the event queue is full, propagating backpressure to the reader.
pub async fn run_parser(
    parser: AccessLogParser,
    source: Arc<Mutex<mpsc::Receiver<RawLine>>>,
    sink: mpsc::Sender<Event>,
    counters: CounterHandle,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            maybe = recv_shared(&source) => match maybe {
                Some(line) => line,
                None => {
                    debug!("raw line queue closed; stopping parser worker");
                    return Ok(());
                }
            },
        };

        let outcome = parser.parse_line(&line);
        for _ in 0..outcome.errors {
            counters.parse_error().await;
        }
        if let Some(event) = outcome.event {
            if sink.send(event).await.is_err() {
                debug!("event queue closed; stopping parser worker");
                return Ok(());
            }
        }
    }
}

fn line_preview(text: &str) -> String {
    const LIMIT: usize = 160;
    let mut preview = String::new();
    for (index, ch) in text.chars().enumerate() {
        if index >= LIMIT {
            preview.push('…');
            break;
        }
        preview.push(ch);
    }
    preview
}
