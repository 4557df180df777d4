//! Measurement hooks.
//!
//! Pure observation points: v-log size before combine, NVM flush size,
//! group size, group-commit count, and per-transaction commit delay. All
//! collection is behind an `enabled` flag checked at each call site so that
//! disabling metrics never changes control flow, only whether a counter
//! moves. Bucketed histograms rather than a running average, so the shape
//! of the distribution survives long after the raw samples are gone.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Histogram buckets above this value are folded into the last slot.
const V_LOG_COLLECT_MAX: usize = 32;
const FLUSH_COLLECT_MAX: usize = 256;
const GROUP_COLLECT_MAX: usize = 256;
const GROUP_COMMIT_MAX: usize = 256;
const DELAY_COLLECT_MAX: usize = 1024;

struct Histogram {
    buckets: Vec<AtomicU64>,
}

impl Histogram {
    fn new(len: usize) -> Self {
        let mut buckets = Vec::with_capacity(len + 1);
        for _ in 0..=len {
            buckets.push(AtomicU64::new(0));
        }
        Self { buckets }
    }

    fn record(&self, value: u64) {
        let idx = (value as usize).min(self.buckets.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> Vec<u64> {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

/// Per-commit timing, used to compute the delay from transaction start to
/// the group flush that made it durable.
pub struct CommitTimer {
    start: Instant,
}

impl CommitTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }
}

/// Collection of bucketed counters for the persistence core.
pub struct Metrics {
    enabled: AtomicBool,
    v_log_size: Histogram,
    flush_size: Histogram,
    group_size: Histogram,
    group_commit: Histogram,
    delay: Histogram,
    total_flushes: AtomicU64,
    total_reproduces: AtomicU64,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            v_log_size: Histogram::new(V_LOG_COLLECT_MAX),
            flush_size: Histogram::new(FLUSH_COLLECT_MAX),
            group_size: Histogram::new(GROUP_COLLECT_MAX),
            group_commit: Histogram::new(GROUP_COMMIT_MAX),
            delay: Histogram::new(DELAY_COLLECT_MAX),
            total_flushes: AtomicU64::new(0),
            total_reproduces: AtomicU64::new(0),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Collection point: before absorbing a transaction's volatile log.
    pub fn before_log_combine(&self, v_log_num: u64) {
        if self.enabled() {
            self.v_log_size.record(v_log_num);
        }
    }

    /// Collection point: before each NVM flush, in words flushed.
    pub fn before_flush(&self, flush_words: u64) {
        if self.enabled() {
            self.flush_size.record(flush_words);
        }
    }

    /// Collection point: before commit, once a group has actually flushed.
    pub fn before_commit_flushed(&self, group_size: u64, distinct_entries: u64, delays_micros: &[u64]) {
        if !self.enabled() {
            return;
        }
        self.group_commit.record(group_size);
        self.group_size.record(distinct_entries);
        self.total_flushes.fetch_add(1, Ordering::Relaxed);
        for &d in delays_micros {
            self.delay.record(d);
        }
    }

    pub fn record_reproduce(&self) {
        if self.enabled() {
            self.total_reproduces.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            v_log_size: self.v_log_size.snapshot(),
            flush_size: self.flush_size.snapshot(),
            group_size: self.group_size.snapshot(),
            group_commit: self.group_commit.snapshot(),
            delay_micros: self.delay.snapshot(),
            total_flushes: self.total_flushes.load(Ordering::Relaxed),
            total_reproduces: self.total_reproduces.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of all histograms, suitable for logging or export.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub v_log_size: Vec<u64>,
    pub flush_size: Vec<u64>,
    pub group_size: Vec<u64>,
    pub group_commit: Vec<u64>,
    pub delay_micros: Vec<u64>,
    pub total_flushes: u64,
    pub total_reproduces: u64,
}
