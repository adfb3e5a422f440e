//! Time-windowed statistical reservoir.
//!
//! A bounded rolling-window statistic: the total span is divided into a fixed
//! number of sub-windows, each holding only the aggregates (count, sum, min,
//! max) of the measurements that fell into it.  Memory stays
//! O(`window_count`) regardless of measurement volume, and sub-windows that
//! age out of the span are evicted lazily on the next record or read.
//!
//! # Usage in the health monitor
//!
//! The uptime tick records `100.0` or `0.0` once per second into a reservoir
//! of 168 one-hour sub-windows; [`StatisticalReservoir::statistics`] then
//! yields the rolling 7-day uptime percentage as the average.

// Rust guideline compliant 2026-02

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Aggregates of one sub-window.
#[derive(Debug, Clone)]
struct Bucket {
    start: Instant,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Bucket {
    fn new(start: Instant, value: f64) -> Self {
        Self {
            start,
            count: 1,
            sum: value,
            min: value,
            max: value,
        }
    }

    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }
}

/// Summary statistics over the live sub-windows.
#[derive(Debug, Clone, PartialEq)]
pub struct Statistics {
    /// Number of measurements in the window.
    pub count: u64,
    /// Sum of measurements in the window.
    pub sum: f64,
    /// Smallest measurement, `None` when the window is empty.
    pub min: Option<f64>,
    /// Largest measurement, `None` when the window is empty.
    pub max: Option<f64>,
    /// `sum / count`, `0.0` when the window is empty.
    pub average: f64,
}

/// Bounded time-windowed sample buffer.
#[derive(Debug)]
pub struct StatisticalReservoir {
    buckets: VecDeque<Bucket>,
    window_count: usize,
    window_span: Duration,
}

impl StatisticalReservoir {
    /// Create a reservoir of `window_count` sub-windows spanning `window_span`
    /// in total.
    ///
    /// # Panics
    ///
    /// Panics if `window_count == 0` or `window_span` is zero.
    #[must_use]
    pub fn new(window_count: usize, window_span: Duration) -> Self {
        assert!(window_count > 0, "reservoir window_count must be > 0");
        assert!(
            !window_span.is_zero(),
            "reservoir window_span must be non-zero"
        );
        Self {
            buckets: VecDeque::with_capacity(window_count),
            window_count,
            window_span,
        }
    }

    /// Record a measurement at the current instant.
    pub fn record(&mut self, value: f64) {
        self.record_at(value, Instant::now());
    }

    /// Record a measurement taken at `at`.
    ///
    /// Sub-windows older than `at − window_span` are evicted first.
    pub fn record_at(&mut self, value: f64, at: Instant) {
        self.evict(at);

        let len = self.bucket_len();
        match self.buckets.back().map(|b| b.start) {
            None => self.buckets.push_back(Bucket::new(at, value)),
            Some(back_start) if at >= back_start => {
                let steps = at.duration_since(back_start).as_nanos() / len.as_nanos().max(1);
                if steps == 0 {
                    if let Some(back) = self.buckets.back_mut() {
                        back.record(value);
                    }
                } else {
                    // Eviction already bounded the gap to the window span.
                    let start = back_start + len.saturating_mul(steps as u32);
                    self.buckets.push_back(Bucket::new(start, value));
                }
            }
            Some(_) => {
                // Late measurement: fold into the sub-window it falls in, or
                // the oldest live one when it predates them all.
                let idx = self.buckets.iter().rposition(|b| at >= b.start).unwrap_or(0);
                self.buckets[idx].record(value);
            }
        }
    }

    /// Summary statistics over the sub-windows still inside the span.
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        let now = Instant::now();
        let mut count = 0u64;
        let mut sum = 0.0f64;
        let mut min: Option<f64> = None;
        let mut max: Option<f64> = None;

        for bucket in &self.buckets {
            if now.saturating_duration_since(bucket.start) > self.window_span {
                continue;
            }
            count += bucket.count;
            sum += bucket.sum;
            min = Some(min.map_or(bucket.min, |m: f64| m.min(bucket.min)));
            max = Some(max.map_or(bucket.max, |m: f64| m.max(bucket.max)));
        }

        let average = if count > 0 { sum / count as f64 } else { 0.0 };
        Statistics {
            count,
            sum,
            min,
            max,
            average,
        }
    }

    /// Number of sub-windows the reservoir divides its span into.
    #[must_use]
    pub fn window_count(&self) -> usize {
        self.window_count
    }

    /// Total span the reservoir covers.
    #[must_use]
    pub fn window_span(&self) -> Duration {
        self.window_span
    }

    fn bucket_len(&self) -> Duration {
        self.window_span / self.window_count as u32
    }

    fn evict(&mut self, at: Instant) {
        while let Some(front) = self.buckets.front() {
            if at.saturating_duration_since(front.start) > self.window_span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
        // Bound the bucket list even if timestamps arrive faster than they age out.
        while self.buckets.len() > self.window_count {
            self.buckets.pop_front();
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
