//! Upload progress: client-side throughput from a one-second rolling window, and the
//! structured events handed to the host for display.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Samples older than this are discarded.
pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Rolling window of `(cumulative_bytes, time)` samples.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    samples: VecDeque<(u64, Instant)>,
    started: Option<Instant>,
    latest: u64,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, cumulative_bytes: u64) {
        self.record_at(cumulative_bytes, Instant::now());
    }

    /// Record a sample taken at `now`.
    pub fn record_at(&mut self, cumulative_bytes: u64, now: Instant) {
        self.started.get_or_insert(now);
        self.latest = cumulative_bytes;
        self.samples.push_back((cumulative_bytes, now));
        self.prune(now);
    }

    /// Bytes per second over the window. Zero with fewer than two samples in the window.
    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.prune(now);
        if self.samples.len() < 2 {
            return 0.0;
        }
        let Some(&(oldest_bytes, oldest_time)) = self.samples.front() else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(oldest_time).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        self.latest.saturating_sub(oldest_bytes) as f64 / elapsed
    }

    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    /// Mean bytes per second since the first sample.
    pub fn average_rate_at(&self, now: Instant) -> f64 {
        let Some(started) = self.started else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        if elapsed <= f64::EPSILON {
            return 0.0;
        }
        self.latest as f64 / elapsed
    }

    /// Remaining time at the current windowed rate; `None` while the rate is zero.
    pub fn eta_at(&mut self, total_bytes: u64, now: Instant) -> Option<Duration> {
        let rate = self.rate_at(now);
        if rate <= 0.0 {
            return None;
        }
        let remaining = total_bytes.saturating_sub(self.latest) as f64;
        Some(Duration::from_secs_f64(remaining / rate))
    }

    pub fn samples_in_window(&self) -> usize {
        self.samples.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&(_, t)) = self.samples.front() {
            if now.saturating_duration_since(t) > RATE_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// One progress update, emitted after each chunk acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// 1-based index of the acknowledged chunk.
    pub chunk_index: u64,
    pub chunk_total: u64,
    /// Bytes this client has sent so far.
    pub bytes_sent: u64,
    /// Server-reported fields, displayed as-is.
    pub total_received: u64,
    pub total_size: u64,
    pub percentage: f64,
    pub upload_speed_mbps: f64,
    pub estimated_time: String,
    /// Client-side windowed rate in bytes per second.
    pub local_rate: f64,
}

/// Receives progress from a running session. The core never renders output itself.
pub trait ProgressSink: Send {
    fn on_progress(&mut self, event: &ProgressEvent);

    /// Called once after the last chunk has been acknowledged.
    fn on_stream_finished(&mut self) {}
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&mut self, _event: &ProgressEvent) {}
}

impl ProgressSink for Vec<ProgressEvent> {
    fn on_progress(&mut self, event: &ProgressEvent) {
        self.push(event.clone());
    }
}
