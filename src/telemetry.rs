//! `tracing` subscriber init and the crate-wide [`Metrics`] counters
//! rendered at `/metrics`. Structured fields (`repository`, `branch`,
//! `provider`, `operation`) are attached at call sites via `tracing`
//! spans/fields, not centralized here.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Holds the `tracing-appender` worker guard for the lifetime of the
/// process when file logging is enabled. Dropping it would stop the
/// background flush thread, so `init_tracing` leaks it in here instead of
/// handing it back to the caller.
static FILE_LOG_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Initializes the global `tracing` subscriber. `json` selects
/// machine-readable output (for shipping to a log aggregator); otherwise
/// human-readable `fmt` output goes to stderr. Honors `RUST_LOG`, defaulting
/// to `info`. When `log_dir` is set, logs are additionally written as daily
/// rolling files under that directory rather than just to stderr.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing(json: bool) {
    init_tracing_with(json, None)
}

/// As [`init_tracing`], but writes daily-rolling log files to `log_dir` in
/// addition to the process's stderr.
pub fn init_tracing_with(json: bool, log_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if let Some(dir) = log_dir {
        let appender = tracing_appender::rolling::daily(dir, "reposentry.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_LOG_GUARD.set(guard);
        let builder = builder.with_writer(writer).with_ansi(false);
        if json {
            builder.json().try_init()
        } else {
            builder.try_init()
        }
    } else if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed, skipping re-init");
    }
}

/// Atomic counters exposed at `/metrics` alongside the [`crate::dispatcher::DispatchMetrics`]
/// EMA/latency figures.
#[derive(Debug, Default)]
pub struct Metrics {
    pub polls_total: AtomicU64,
    pub events_emitted_total: AtomicU64,
    pub events_processed_total: AtomicU64,
    pub events_failed_total: AtomicU64,
    pub dispatch_attempts_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_poll(&self) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_events_emitted(&self, n: u64) {
        self.events_emitted_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_event_processed(&self) {
        self.events_processed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_failed(&self) {
        self.events_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_attempt(&self) {
        self.dispatch_attempts_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Renders the counters in a simple `key value` text format — not a
    /// full Prometheus exposition grammar.
    pub fn render_text(&self) -> String {
        format!(
            "polls_total {}\nevents_emitted_total {}\nevents_processed_total {}\nevents_failed_total {}\ndispatch_attempts_total {}\n",
            self.polls_total.load(Ordering::Relaxed),
            self.events_emitted_total.load(Ordering::Relaxed),
            self.events_processed_total.load(Ordering::Relaxed),
            self.events_failed_total.load(Ordering::Relaxed),
            self.dispatch_attempts_total.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_text_reflects_recorded_counters() {
        let metrics = Metrics::new();
        metrics.record_poll();
        metrics.record_events_emitted(3);
        metrics.record_event_processed();
        let text = metrics.render_text();
        assert!(text.contains("polls_total 1"));
        assert!(text.contains("events_emitted_total 3"));
        assert!(text.contains("events_processed_total 1"));
    }
}
