//! Severity-tagged log records.
//!
//! Records carry one of six severities. The three informational kinds mark
//! lifecycle and per-tick outcomes; the three error kinds distinguish a
//! skipped item (`Flag`), an aborted tick (`Error`), and an aborted process
//! (`Abort`). Everything is emitted through `tracing` so the subscriber
//! controls formatting and filtering.

use std::fmt;
use std::io;

use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Record severity, in increasing order of consequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Routine per-tick note.
    Status,

    /// Daemon started.
    Start,

    /// Daemon shut down cleanly.
    Stop,

    /// Per-item anomaly; the item was skipped and the tick continues.
    Flag,

    /// The current tick was invalidated.
    Error,

    /// The process is going down.
    Abort,
}

impl Severity {
    fn is_error_channel(self) -> bool {
        matches!(self, Severity::Flag | Severity::Error | Severity::Abort)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Status => "STATUS",
            Severity::Start => "START",
            Severity::Stop => "STOP",
            Severity::Flag => "FLAG",
            Severity::Error => "ERROR",
            Severity::Abort => "ABORT",
        };
        f.write_str(name)
    }
}

/// Emit one record at the given severity.
pub fn record(severity: Severity, message: impl fmt::Display) {
    if !severity.is_error_channel() {
        tracing::info!(severity = %severity, "{}", message);
    } else if severity == Severity::Flag {
        tracing::warn!(severity = %severity, "{}", message);
    } else {
        tracing::error!(severity = %severity, "{}", message);
    }
}

/// Install the diagnostic-stream subscriber.
///
/// Records go to stderr with a local `[YYYY-MM-DD HH:MM:SS]` timestamp.
/// `RUST_LOG` narrows the filter; the default level is `info`.
pub fn init() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(ChronoLocal::new("[%Y-%m-%d %H:%M:%S]".to_string()))
                .with_writer(io::stderr),
        )
        .init();
}
