//! Rolling downloader statistics and skip-ahead tracking.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

const TIMING_WINDOW: usize = 20;
const DELTA_WINDOW: usize = 10;
const RATE_WINDOW: usize = 60;

/// Fixed-capacity window of recent samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            None
        } else {
            Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipAheadEnd {
    CaughtUp { average_delta: f64 },
    TimedOut,
}

/// Decides when the downloader has caught up with the head of the feed.
#[derive(Debug, Clone)]
pub struct SkipAhead {
    active: bool,
    deltas: RollingWindow,
    sufficient_delta: f64,
    started: Instant,
    timeout: Duration,
}

impl SkipAhead {
    pub fn new(enabled: bool, sufficient_delta: u64, timeout: Duration, now: Instant) -> Self {
        Self {
            active: enabled,
            deltas: RollingWindow::new(DELTA_WINDOW),
            sufficient_delta: sufficient_delta as f64,
            started: now,
            timeout,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Record the delta of a released request. Returns why skip-ahead ended
    /// when this sample turns it off.
    pub fn record(&mut self, delta: i64, now: Instant) -> Option<SkipAheadEnd> {
        self.deltas.push(delta as f64);
        self.check(now)
    }

    /// Re-evaluate the timeout without a new sample.
    pub fn check(&mut self, now: Instant) -> Option<SkipAheadEnd> {
        if !self.active {
            return None;
        }

        if self.deltas.is_full() {
            if let Some(average_delta) = self.deltas.mean() {
                if average_delta <= self.sufficient_delta {
                    self.active = false;
                    return Some(SkipAheadEnd::CaughtUp { average_delta });
                }
            }
        }

        if now.saturating_duration_since(self.started) > self.timeout {
            self.active = false;
            return Some(SkipAheadEnd::TimedOut);
        }

        None
    }
}

/// Point-in-time view of the downloader, published for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloaderStats {
    pub avg_request_ms: Option<f64>,
    pub avg_peek_ms: Option<f64>,
    pub avg_queue_ms: Option<f64>,
    pub avg_dispatch_delay_ms: Option<f64>,
    pub avg_delta: Option<f64>,
    pub ids_per_second: Option<f64>,
    pub in_flight: usize,
    pub released: u64,
    pub skip_ahead: bool,
    pub last_released: Option<String>,
    pub pending: Vec<String>,
}

/// Accumulates timing samples inside the downloader actor.
#[derive(Debug, Clone)]
pub struct FeedStats {
    request: RollingWindow,
    peek: RollingWindow,
    queue: RollingWindow,
    dispatch_delay: RollingWindow,
    deltas: RollingWindow,
    ids_per_second: RollingWindow,
    delta_since_tick: i64,
    pub released: u64,
}

impl Default for FeedStats {
    fn default() -> Self {
        Self {
            request: RollingWindow::new(TIMING_WINDOW),
            peek: RollingWindow::new(TIMING_WINDOW),
            queue: RollingWindow::new(TIMING_WINDOW),
            dispatch_delay: RollingWindow::new(TIMING_WINDOW),
            deltas: RollingWindow::new(DELTA_WINDOW),
            ids_per_second: RollingWindow::new(RATE_WINDOW),
            delta_since_tick: 0,
            released: 0,
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl FeedStats {
    pub fn record_request(&mut self, elapsed: Duration) {
        self.request.push(millis(elapsed));
    }

    pub fn record_peek(&mut self, elapsed: Duration) {
        self.peek.push(millis(elapsed));
    }

    pub fn record_queue(&mut self, elapsed: Duration) {
        self.queue.push(millis(elapsed));
    }

    pub fn record_dispatch_delay(&mut self, elapsed: Duration) {
        self.dispatch_delay.push(millis(elapsed));
    }

    pub fn record_release(&mut self, delta: i64) {
        self.deltas.push(delta as f64);
        self.delta_since_tick += delta;
        self.released += 1;
    }

    /// Called once per second to sample feed throughput.
    pub fn tick(&mut self) {
        self.ids_per_second.push(self.delta_since_tick as f64);
        self.delta_since_tick = 0;
    }

    pub fn snapshot(&self) -> DownloaderStats {
        DownloaderStats {
            avg_request_ms: self.request.mean(),
            avg_peek_ms: self.peek.mean(),
            avg_queue_ms: self.queue.mean(),
            avg_dispatch_delay_ms: self.dispatch_delay.mean(),
            avg_delta: self.deltas.mean(),
            ids_per_second: self.ids_per_second.mean(),
            released: self.released,
            ..DownloaderStats::default()
        }
    }
}
