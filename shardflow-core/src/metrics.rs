//! Per-run metrics
//!
//! Counters and a flush-latency histogram, exportable as Prometheus text.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bounds of the flush-latency buckets, in seconds. A flush rewrites
/// the whole sink, so the range runs from milliseconds to minutes.
const FLUSH_BOUNDS: [f64; 8] = [0.01, 0.05, 0.25, 1.0, 5.0, 15.0, 60.0, 300.0];

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} {}", name, kind);
}

/// Monotonic counter
#[derive(Debug)]
pub struct Counter {
    name: &'static str,
    help: &'static str,
    value: AtomicU64,
}

impl Counter {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.inc_by(1);
    }

    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    fn export(&self, out: &mut String) {
        write_header(out, self.name, self.help, "counter");
        let _ = writeln!(out, "{} {}", self.name, self.get());
    }
}

/// Flush-latency histogram over [`FLUSH_BOUNDS`]
#[derive(Debug)]
pub struct Histogram {
    name: &'static str,
    help: &'static str,
    /// Observations per bucket, not cumulative; the last slot is +Inf
    buckets: [AtomicU64; FLUSH_BOUNDS.len() + 1],
    sum_micros: AtomicU64,
}

impl Histogram {
    pub fn new(name: &'static str, help: &'static str) -> Self {
        Self {
            name,
            help,
            buckets: Default::default(),
            sum_micros: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let slot = FLUSH_BOUNDS
            .iter()
            .position(|&bound| secs <= bound)
            .unwrap_or(FLUSH_BOUNDS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record the time elapsed since `start`
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed());
    }

    /// Number of observations
    pub fn count(&self) -> u64 {
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    fn export(&self, out: &mut String) {
        write_header(out, self.name, self.help, "histogram");

        let mut cumulative = 0;
        for (slot, count) in self.buckets.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            match FLUSH_BOUNDS.get(slot) {
                Some(bound) => {
                    let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", self.name, bound, cumulative);
                }
                None => {
                    let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", self.name, cumulative);
                }
            }
        }

        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1e6;
        let _ = writeln!(out, "{}_sum {}", self.name, sum);
        let _ = writeln!(out, "{}_count {}", self.name, cumulative);
    }
}

/// Metrics of one worker's run
#[derive(Debug)]
pub struct RunMetrics {
    pub keys_owned: Counter,
    pub keys_processed: Counter,
    pub keys_failed: Counter,
    /// Keys whose transform returned nothing
    pub keys_skipped: Counter,
    pub items_buffered: Counter,
    pub flushes: Counter,
    pub flush_duration: Histogram,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            keys_owned: Counter::new("shardflow_keys_owned_total", "Keys assigned to this worker"),
            keys_processed: Counter::new(
                "shardflow_keys_processed_total",
                "Keys transformed successfully",
            ),
            keys_failed: Counter::new("shardflow_keys_failed_total", "Keys whose processing failed"),
            keys_skipped: Counter::new(
                "shardflow_keys_skipped_total",
                "Keys whose transform produced no output",
            ),
            items_buffered: Counter::new(
                "shardflow_items_buffered_total",
                "Output items staged for the sink",
            ),
            flushes: Counter::new("shardflow_flushes_total", "Buffer flushes into the sink"),
            flush_duration: Histogram::new(
                "shardflow_flush_duration_seconds",
                "Time spent flushing while holding the write token",
            ),
        }
    }

    /// Export every metric in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        for counter in [
            &self.keys_owned,
            &self.keys_processed,
            &self.keys_failed,
            &self.keys_skipped,
            &self.items_buffered,
            &self.flushes,
        ] {
            counter.export(&mut out);
        }
        self.flush_duration.export(&mut out);
        out
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}
