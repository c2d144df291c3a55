//! logflux — access-log ingestion pipeline with live self-telemetry.
//!
//! Tails a continuously appended nginx-style access log, parses each line
//! into a typed event on a pool of workers, forwards single-point batches to
//! an InfluxDB-style sink from a pool of writers, and serves a live
//! `/status` snapshot of throughput, queue depths and error counts.
//!
//! Data flows strictly left to right:
//!
//! ```text
//! file -> reader -> raw-line queue -> parser pool -> event queue -> writer pool -> sink
//! ```
//!
//! The monitor sits off the data path: it owns the pipeline counters, fed by
//! a dedicated increment channel, and samples throughput on a fixed interval.

pub mod config;
pub mod event;
pub mod monitor;
pub mod parser;
pub mod pipeline;
pub mod reader;
pub mod sink;
pub mod status;
pub mod writer;
