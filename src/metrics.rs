//! Cache counters shared by concurrent request tasks

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Default)]
struct Latency {
    avg_ms: f64,
    samples: u64,
}

/// Hit/miss/error counters plus a running mean of distributed latency
#[derive(Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
    operations: AtomicU64,
    latency: Mutex<Latency>,
}

/// Point-in-time copy of [`CacheMetrics`] with derived rates
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub operations: u64,
    /// Mean latency of successful store calls, in milliseconds
    pub avg_response_time: f64,
    pub hit_rate: f64,
    pub error_rate: f64,
}

impl CacheMetrics {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let mut latency = self.latency.lock();
        latency.samples += 1;
        latency.avg_ms += (ms - latency.avg_ms) / latency.samples as f64;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let operations = self.operations.load(Ordering::Relaxed);
        MetricsSnapshot {
            hits,
            misses,
            errors,
            operations,
            avg_response_time: self.latency.lock().avg_ms,
            hit_rate: ratio(hits, hits + misses),
            error_rate: ratio(errors, operations),
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.operations.store(0, Ordering::Relaxed);
        *self.latency.lock() = Latency::default();
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rates_are_zero_without_traffic() {
        let snapshot = CacheMetrics::default().snapshot();
        assert_eq!(snapshot.hit_rate, 0.0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.avg_response_time, 0.0);
    }

    #[test]
    fn test_derived_rates() {
        let metrics = CacheMetrics::default();
        for _ in 0..3 {
            metrics.record_hit();
            metrics.record_operation();
        }
        metrics.record_miss();
        metrics.record_operation();
        metrics.record_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hit_rate, 0.75);
        assert_eq!(snapshot.error_rate, 0.25);
    }

    #[test]
    fn test_running_mean_latency() {
        let metrics = CacheMetrics::default();
        metrics.record_latency(Duration::from_millis(10));
        metrics.record_latency(Duration::from_millis(20));
        metrics.record_latency(Duration::from_millis(30));
        assert!((metrics.snapshot().avg_response_time - 20.0).abs() < 1e-9);

        metrics.reset();
        assert_eq!(metrics.snapshot().avg_response_time, 0.0);
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let metrics = Arc::new(CacheMetrics::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_operation();
                        metrics.record_hit();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.operations, 8000);
        assert_eq!(snapshot.hits, 8000);
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(CacheMetrics::default().snapshot()).unwrap();
        assert!(json.get("avgResponseTime").is_some());
        assert!(json.get("hitRate").is_some());
        assert!(json.get("errorRate").is_some());
    }
}
