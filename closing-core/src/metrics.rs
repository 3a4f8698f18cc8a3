//! Metrics collection for observability
//!
//! Prometheus metrics for the closing core, registered on a per-instance
//! registry so several engines can coexist in one process.
//!
//! # Metrics
//!
//! - `closing_submissions_total{outcome}` - Submissions by terminal outcome
//! - `closing_lock_contention_total` - Acquisitions denied because the scope was held
//! - `closing_lock_degraded` - 1 while the lock manager runs on the in-process fallback
//! - `closing_active_operations` - Operations in the active registry
//! - `closing_processing_duration_seconds` - Time from registration to terminal state
//! - `closing_evicted_total` - Operations removed by the grace-period sweep
//! - `closing_history_purged_total` - History entries removed by retention

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Submissions by outcome (`COMPLETED` or an error code)
    pub submissions_total: IntCounterVec,

    /// Lock contention count
    pub lock_contention_total: IntCounter,

    /// Degraded lock mode flag
    pub lock_degraded: IntGauge,

    /// Active registry size
    pub active_operations: IntGauge,

    /// Processing duration histogram
    pub processing_duration: Histogram,

    /// Evicted operations
    pub evicted_total: IntCounter,

    /// Purged history entries
    pub history_purged_total: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let submissions_total = IntCounterVec::new(
            Opts::new("closing_submissions_total", "Submissions by terminal outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(submissions_total.clone()))?;

        let lock_contention_total = IntCounter::new(
            "closing_lock_contention_total",
            "Lock acquisitions denied because the scope was held",
        )?;
        registry.register(Box::new(lock_contention_total.clone()))?;

        let lock_degraded = IntGauge::new(
            "closing_lock_degraded",
            "1 while locks are served by the in-process fallback",
        )?;
        registry.register(Box::new(lock_degraded.clone()))?;

        let active_operations = IntGauge::new(
            "closing_active_operations",
            "Operations in the active registry",
        )?;
        registry.register(Box::new(active_operations.clone()))?;

        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "closing_processing_duration_seconds",
                "Time from registration to terminal state",
            )
            .buckets(vec![0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0]),
        )?;
        registry.register(Box::new(processing_duration.clone()))?;

        let evicted_total = IntCounter::new(
            "closing_evicted_total",
            "Operations removed from the active registry by the grace-period sweep",
        )?;
        registry.register(Box::new(evicted_total.clone()))?;

        let history_purged_total = IntCounter::new(
            "closing_history_purged_total",
            "History entries removed by the retention sweep",
        )?;
        registry.register(Box::new(history_purged_total.clone()))?;

        Ok(Self {
            submissions_total,
            lock_contention_total,
            lock_degraded,
            active_operations,
            processing_duration,
            evicted_total,
            history_purged_total,
            registry,
        })
    }

    /// Record a terminal submission outcome
    pub fn record_submission(&self, outcome: &str, duration_seconds: f64) {
        self.submissions_total.with_label_values(&[outcome]).inc();
        self.processing_duration.observe(duration_seconds);
    }

    /// Record a denied acquisition
    pub fn record_contention(&self) {
        self.lock_contention_total.inc();
    }

    /// Update degraded flag
    pub fn set_degraded(&self, degraded: bool) {
        self.lock_degraded.set(i64::from(degraded));
    }

    /// Update active registry size
    pub fn set_active(&self, count: usize) {
        self.active_operations.set(count as i64);
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in the Prometheus text format
    pub fn export(&self) -> crate::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Other(format!("Invalid metrics output: {}", e)))
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        assert_eq!(metrics.lock_contention_total.get(), 0);
        assert_eq!(metrics.active_operations.get(), 0);

        // Independent registries, so a second collector does not collide
        assert!(Metrics::new().is_ok());
    }

    #[test]
    fn test_record_submission() {
        let metrics = Metrics::new().unwrap();
        metrics.record_submission("COMPLETED", 0.02);
        metrics.record_submission("COMPLETED", 0.03);
        metrics.record_submission("DUPLICATE_OPERATION", 0.001);

        assert_eq!(metrics.submissions_total.with_label_values(&["COMPLETED"]).get(), 2);
        assert_eq!(metrics.processing_duration.get_sample_count(), 3);
    }

    #[test]
    fn test_export_text() {
        let metrics = Metrics::new().unwrap();
        metrics.set_degraded(true);
        let text = metrics.export().unwrap();
        assert!(text.contains("closing_lock_degraded 1"));
    }
}
