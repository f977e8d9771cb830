//! Per-injection timing metrics.
//!
//! Each injection cycle produces one [`InjectionMetrics`] record that is
//! serialized to JSON and pushed to every connected client, which reposts it
//! as an in-process notification so tooling inside the app can graph
//! turnaround times.

use serde::Serialize;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Notification name clients repost the decoded payload under.
pub const METRICS_NOTIFICATION: &str = "INJECTION_METRICS_NOTIFICATION";

/// Wall-clock phase timings for one injection cycle, in milliseconds.
///
/// Field names are part of the client contract; in-app observers look the
/// phases up by these exact keys.
#[derive(Debug, Clone, Serialize)]
pub struct InjectionMetrics {
    /// Cycle start until the compiler is spawned.
    pub processing_time_ms: f64,
    pub compilation_time_ms: f64,
    pub linking_time_ms: f64,
    pub total_time_ms: f64,
    pub source_path: String,
    pub success: bool,
    pub notification_name: &'static str,
    /// Unix seconds at cycle start.
    pub start_time: f64,
    #[serde(skip)]
    started: Instant,
}

impl InjectionMetrics {
    pub fn begin(source_path: &str) -> Self {
        let start_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs_f64())
            .unwrap_or(0.0);
        Self {
            processing_time_ms: 0.0,
            compilation_time_ms: 0.0,
            linking_time_ms: 0.0,
            total_time_ms: 0.0,
            source_path: source_path.to_string(),
            success: false,
            notification_name: METRICS_NOTIFICATION,
            start_time,
            started: Instant::now(),
        }
    }

    /// Records everything up to now as the processing phase.
    pub fn mark_processing(&mut self) {
        self.processing_time_ms = self.elapsed_ms();
    }

    pub fn set_compilation_ms(&mut self, ms: f64) {
        self.compilation_time_ms = ms;
    }

    pub fn set_linking_ms(&mut self, ms: f64) {
        self.linking_time_ms = ms;
    }

    /// Closes the cycle and records the outcome.
    pub fn finish(&mut self, success: bool) {
        self.total_time_ms = self.elapsed_ms();
        self.success = success;
    }

    fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Runs `work` and returns its result with the elapsed milliseconds.
pub fn timed<R>(work: impl FnOnce() -> R) -> (R, f64) {
    let started = Instant::now();
    let result = work();
    (result, started.elapsed().as_secs_f64() * 1000.0)
}
