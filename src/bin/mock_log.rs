//! Synthetic access-log generator.
//!
//! Appends bursts of well-formed access-log lines to the shared log file so
//! the agent has something to tail during development. The traffic shape is
//! intentionally skewed: `/foo` is slower and heavier than the other paths,
//! and roughly one request in ten fails.

use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use std::fs::OpenOptions;
use std::io::Write;
use std::thread;
use std::time::Duration;

const PATHS: &[&str] = &["/foo", "/bar", "/baz", "/qux", "/foo", "/bar", "/bar", "/bar"];

fn main() -> Result<()> {
    let path = std::env::var("LOGFLUX_MOCK_PATH").unwrap_or_else(|_| "./access.log".to_string());
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {path}"))?;

    println!("appending synthetic access log lines to {path}");

    loop {
        for _ in 0..3 {
            let line = synth_line();
            file.write_all(line.as_bytes())
                .with_context(|| format!("failed to append to {path}"))?;
        }
        thread::sleep(Duration::from_millis(200));
    }
}

fn synth_line() -> String {
    let now = Local::now();
    let path = PATHS[fastrand::usize(..PATHS.len())];

    let mut request_time = fastrand::f64();
    if path == "/foo" {
        request_time += 1.4;
    }

    let scheme = if now.timestamp_micros() % 2 == 1 {
        "https"
    } else {
        "http"
    };
    let status = if now.timestamp() % 10 == 1 { 500 } else { 200 };

    let mut bytes_sent = fastrand::u64(500..1500);
    if path == "/foo" {
        bytes_sent += 1000;
    }

    format!(
        "172.0.0.12 - - [{}] {} \"GET {} HTTP/1.0\" {} {} \"-\" \"KeepAliveClient\" \"-\" - {:.3}\n",
        now.to_rfc3339_opts(SecondsFormat::Secs, false),
        scheme,
        path,
        status,
        bytes_sent,
        request_time
    )
}
