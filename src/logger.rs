use std::{
    path::Path,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*};

/// Install the global subscriber:
///
/// - `xnode.<date>.log`: plain-text daily log filtered by `log_level`
/// - `xnode-events.<date>.json`: one JSON line per bridge request
///   (target `request`)
/// - stderr, when `to_stdout` is set
///
/// A second call is a no-op.
pub fn init_tracing(log_dir: &Path, log_level: &str, to_stdout: bool) -> Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let txt_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("xnode")
        .filename_suffix("log")
        .build(log_dir)?;
    let txt_layer = fmt::layer()
        .with_writer(txt_appender)
        .with_ansi(false)
        .with_filter(level_filter(log_level));

    let json_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("xnode-events")
        .filename_suffix("json")
        .build(log_dir)?;
    let json_layer = fmt::layer()
        .json()
        .with_writer(json_appender)
        .with_target(true)
        .with_filter(EnvFilter::new("request=info"));

    let console_layer = to_stdout.then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_thread_names(true)
            .with_filter(level_filter(log_level))
    });

    if let Err(err) = Registry::default()
        .with(txt_layer)
        .with(json_layer)
        .with(console_layer)
        .try_init()
    {
        debug!("tracing already initialised: {err}");
    }
    Ok(())
}

fn level_filter(log_level: &str) -> EnvFilter {
    let mut filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    for directive in ["hyper=off", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Request counters plus one JSON `request` event per bridge call.
#[derive(Debug, Default)]
pub struct Telemetry {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a bridge operation: log its outcome with latency and emit the
    /// `request` event picked up by the JSON layer.
    pub async fn instrument<F, Fut, T, E>(&self, name: &str, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.started.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        let result = handler().await;
        let elapsed = start.elapsed().as_secs_f64() * 1_000.0;

        match &result {
            Ok(_) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                info!("request `{}` succeeded in {:.2} ms", name, elapsed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(error = %err, "request `{}` failed in {:.2} ms", name, elapsed);
            }
        }

        tracing::event!(
            target: "request",
            tracing::Level::INFO,
            request = name,
            latency_ms = elapsed,
            status = if result.is_ok() { "ok" } else { "error" },
        );

        result
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}
