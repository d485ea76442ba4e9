// Performance metrics module
//
// Lightweight counters for pipeline and output-store activity

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Operation and maintenance metrics
///
/// Uses atomic operations for thread-safe tracking without locks. Shared
/// between pipelines through an `Arc` and logged on shutdown.
#[derive(Debug)]
pub struct Metrics {
    /// Operations accepted by a pipeline
    pub operations_started: AtomicUsize,

    /// Operations that completed successfully
    pub operations_succeeded: AtomicUsize,

    /// Operations that ended in failure
    pub operations_failed: AtomicUsize,

    /// Operations that stopped after a cancellation request
    pub operations_cancelled: AtomicUsize,

    /// Start requests rejected because the pipeline was busy
    pub busy_rejections: AtomicU64,

    /// Total operation wall time in milliseconds
    pub total_operation_time_ms: AtomicU64,

    /// Files removed by cleanup sweeps
    pub files_cleaned: AtomicU64,

    /// Per-file deletion failures during cleanup sweeps
    pub cleanup_failures: AtomicU64,

    /// Creation time
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            operations_started: AtomicUsize::new(0),
            operations_succeeded: AtomicUsize::new(0),
            operations_failed: AtomicUsize::new(0),
            operations_cancelled: AtomicUsize::new(0),
            busy_rejections: AtomicU64::new(0),
            total_operation_time_ms: AtomicU64::new(0),
            files_cleaned: AtomicU64::new(0),
            cleanup_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn record_operation_started(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation_succeeded(&self) {
        self.operations_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation_failed(&self) {
        self.operations_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_operation_cancelled(&self) {
        self.operations_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy_rejection(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record wall time of one finished operation
    pub fn record_operation_time(&self, duration: Duration) {
        self.total_operation_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record the outcome of a cleanup sweep
    pub fn record_cleanup(&self, deleted: usize, failed: usize) {
        self.files_cleaned
            .fetch_add(deleted as u64, Ordering::Relaxed);
        self.cleanup_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average wall time per finished operation in milliseconds
    pub fn avg_operation_time_ms(&self) -> f64 {
        let total = self.total_operation_time_ms.load(Ordering::Relaxed);
        let count = self.operations_succeeded.load(Ordering::Relaxed)
            + self.operations_failed.load(Ordering::Relaxed)
            + self.operations_cancelled.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Metrics Summary ===");
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
        tracing::info!(
            "Operations: {} started, {} succeeded, {} failed, {} cancelled, {} rejected as busy",
            self.operations_started.load(Ordering::Relaxed),
            self.operations_succeeded.load(Ordering::Relaxed),
            self.operations_failed.load(Ordering::Relaxed),
            self.operations_cancelled.load(Ordering::Relaxed),
            self.busy_rejections.load(Ordering::Relaxed)
        );
        tracing::info!(
            "Total operation time: {:.2}s (avg: {:.2}ms per operation)",
            self.total_operation_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_operation_time_ms()
        );
        tracing::info!(
            "Cleanup: {} files removed, {} deletion failures",
            self.files_cleaned.load(Ordering::Relaxed),
            self.cleanup_failures.load(Ordering::Relaxed)
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.operations_started.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.busy_rejections.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_operations() {
        let metrics = Metrics::new();

        metrics.record_operation_started();
        metrics.record_operation_started();
        metrics.record_operation_started();
        metrics.record_operation_succeeded();
        metrics.record_operation_failed();
        metrics.record_operation_cancelled();
        metrics.record_busy_rejection();

        assert_eq!(metrics.operations_started.load(Ordering::Relaxed), 3);
        assert_eq!(metrics.operations_succeeded.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.operations_failed.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.operations_cancelled.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.busy_rejections.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_avg_operation_time() {
        let metrics = Metrics::new();
        assert_eq!(metrics.avg_operation_time_ms(), 0.0);

        metrics.record_operation_succeeded();
        metrics.record_operation_time(Duration::from_millis(100));
        metrics.record_operation_failed();
        metrics.record_operation_time(Duration::from_millis(300));

        assert_eq!(metrics.avg_operation_time_ms(), 200.0);
    }

    #[test]
    fn test_record_cleanup() {
        let metrics = Metrics::new();
        metrics.record_cleanup(4, 1);
        metrics.record_cleanup(2, 0);
        assert_eq!(metrics.files_cleaned.load(Ordering::Relaxed), 6);
        assert_eq!(metrics.cleanup_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_uptime() {
        let metrics = Metrics::new();
        thread::sleep(Duration::from_millis(10));
        assert!(metrics.uptime().as_millis() >= 10);
    }
}
