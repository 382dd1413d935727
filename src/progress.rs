//! Stage progress reporting.
//!
//! Reports observable progress during `dgov sync` and `dgov process` so
//! users see which stage is running and how much of the batch is left.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The stage is listing its input tier. Total unknown.
    Discovering { stage: String },
    /// `n` of `total` discovered documents have been handled.
    Processing { stage: String, n: u64, total: u64 },
    /// The stage finished its batch.
    Finished {
        stage: String,
        advanced: u64,
        failed: u64,
        timed_out: bool,
    },
}

/// Receives progress events. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Shared handle passed into stage processors.
pub type SharedProgress = Arc<dyn ProgressReporter>;

/// Human-friendly progress on stderr: "enrich  processing  1,234 / 5,000 documents".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Discovering { stage } => format!("{}  discovering...\n", stage),
            ProgressEvent::Processing { stage, n, total } => format!(
                "{}  processing  {} / {} documents\n",
                stage,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Finished {
                stage,
                advanced,
                failed,
                timed_out,
            } => format!(
                "{}  done  {} advanced, {} failed{}\n",
                stage,
                format_number(*advanced),
                format_number(*failed),
                if *timed_out { " (batch timed out)" } else { "" }
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Discovering { stage } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "phase": "discovering"
            }),
            ProgressEvent::Processing { stage, n, total } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "phase": "processing",
                "n": n,
                "total": total
            }),
            ProgressEvent::Finished {
                stage,
                advanced,
                failed,
                timed_out,
            } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "phase": "finished",
                "advanced": advanced,
                "failed": failed,
                "timed_out": timed_out
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Shared no-op reporter.
pub fn silent() -> SharedProgress {
    Arc::new(NoProgress)
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> SharedProgress {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
