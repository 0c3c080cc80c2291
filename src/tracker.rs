use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;

/// Latency statistics for one measurement class.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub sample_count: u64,
}

/// Process-wide query latency tracker.
///
/// Records per-class durations (total query time, time to first result)
/// into HDR histograms; `/health` reports the percentiles. Inner Mutex
/// because `Histogram::record` needs `&mut self`.
pub struct QueryTracker {
    histograms: DashMap<&'static str, Mutex<Histogram<u64>>>,
}

pub const QUERY_TOTAL: &str = "query_total";
pub const TIME_TO_FIRST_RESULT: &str = "time_to_first_result";

impl QueryTracker {
    pub fn new() -> Self {
        Self {
            histograms: DashMap::new(),
        }
    }

    pub fn record(&self, class: &'static str, duration: Duration) {
        let millis = duration.as_millis().min(u128::from(u64::MAX)) as u64;
        let entry = self.histograms.entry(class).or_insert_with(|| {
            // 1ms..10min at 3 significant figures; construction only
            // fails on invalid bounds.
            Mutex::new(
                Histogram::new_with_bounds(1, 600_000, 3)
                    .unwrap_or_else(|_| Histogram::new(3).expect("default histogram")),
            )
        });
        let mut histogram = entry.lock().unwrap_or_else(|e| e.into_inner());
        let _ = histogram.record(millis.max(1));
    }

    /// Percentile snapshot per class; empty classes are omitted.
    pub fn snapshot(&self) -> Vec<(String, LatencyStats)> {
        let mut stats: Vec<(String, LatencyStats)> = self
            .histograms
            .iter()
            .filter_map(|entry| {
                let histogram = entry.value().lock().unwrap_or_else(|e| e.into_inner());
                if histogram.len() == 0 {
                    return None;
                }
                Some((
                    (*entry.key()).to_string(),
                    LatencyStats {
                        p50_ms: histogram.value_at_quantile(0.5) as f64,
                        p95_ms: histogram.value_at_quantile(0.95) as f64,
                        p99_ms: histogram.value_at_quantile(0.99) as f64,
                        sample_count: histogram.len(),
                    },
                ))
            })
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}

impl Default for QueryTracker {
    fn default() -> Self {
        Self::new()
    }
}
