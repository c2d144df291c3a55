//! Core data model shared across pipeline stages.

use chrono::{DateTime, Utc};

/// One newline-delimited record as read from the log file, delimiter stripped.
///
/// A raw line is owned by the raw-line queue until a parser worker claims it;
/// it has no identity of its own after parsing.
pub type RawLine = Vec<u8>;

/// A structured access-log record produced by the parser pool.
///
/// Events are immutable once constructed and owned by the event queue until a
/// writer worker claims them for batching. An event only exists for lines that
/// matched the access-log grammar; individual numeric or time fields that
/// failed to parse are defaulted to zero with an error recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Instant the request was served, normalized to UTC.
    pub occurred_at: DateTime<Utc>,
    /// Response size in bytes.
    pub bytes_sent: u64,
    /// Request path with any query string removed.
    pub path: String,
    pub method: String,
    pub scheme: String,
    /// Three-digit HTTP status, kept as a string for tagging.
    pub status: String,
    /// Upstream service time in seconds.
    pub upstream_time: f64,
    /// Total request time in seconds.
    pub request_time: f64,
}
