//! Metrics collection for observability
//!
//! # Metrics
//!
//! - `accounting_requests_total` - Requests handled by the actor
//! - `accounting_requests_rejected_total` - Requests answered with an error
//! - `accounting_charges_succeeded_total` - Charges that covered the full amount
//! - `accounting_charges_failed_total` - Charges that did not
//! - `accounting_sync_cycles_total` - Synchronization cycles that wrote a batch
//! - `accounting_sync_failures_total` - Synchronization cycles that failed
//! - `accounting_sync_records` - Histogram of records flushed per cycle
//! - `accounting_sync_duration_seconds` - Histogram of cycle durations

use prometheus::{Histogram, HistogramOpts, IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone, Debug)]
pub struct Metrics {
    /// Requests handled
    pub requests_total: IntCounter,

    /// Requests answered with an error
    pub requests_rejected: IntCounter,

    /// Charges that covered the full amount
    pub charges_succeeded: IntCounter,

    /// Charges that did not
    pub charges_failed: IntCounter,

    /// Synchronization cycles that wrote a batch
    pub sync_cycles: IntCounter,

    /// Synchronization cycles that failed
    pub sync_failures: IntCounter,

    /// Records flushed per cycle
    pub sync_records: Histogram,

    /// Cycle duration
    pub sync_duration: Histogram,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let requests_total = IntCounter::new(
            "accounting_requests_total",
            "Requests handled by the accounting actor",
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let requests_rejected = IntCounter::new(
            "accounting_requests_rejected_total",
            "Requests answered with an error",
        )?;
        registry.register(Box::new(requests_rejected.clone()))?;

        let charges_succeeded = IntCounter::new(
            "accounting_charges_succeeded_total",
            "Charges that covered the full amount",
        )?;
        registry.register(Box::new(charges_succeeded.clone()))?;

        let charges_failed = IntCounter::new(
            "accounting_charges_failed_total",
            "Charges that did not cover the full amount",
        )?;
        registry.register(Box::new(charges_failed.clone()))?;

        let sync_cycles = IntCounter::new(
            "accounting_sync_cycles_total",
            "Synchronization cycles that wrote a batch",
        )?;
        registry.register(Box::new(sync_cycles.clone()))?;

        let sync_failures = IntCounter::new(
            "accounting_sync_failures_total",
            "Synchronization cycles that failed",
        )?;
        registry.register(Box::new(sync_failures.clone()))?;

        let sync_records = Histogram::with_opts(
            HistogramOpts::new("accounting_sync_records", "Records flushed per cycle")
                .buckets(vec![1.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 10000.0]),
        )?;
        registry.register(Box::new(sync_records.clone()))?;

        let sync_duration = Histogram::with_opts(
            HistogramOpts::new(
                "accounting_sync_duration_seconds",
                "Synchronization cycle duration",
            )
            .buckets(vec![0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 5.0]),
        )?;
        registry.register(Box::new(sync_duration.clone()))?;

        Ok(Self {
            requests_total,
            requests_rejected,
            charges_succeeded,
            charges_failed,
            sync_cycles,
            sync_failures,
            sync_records,
            sync_duration,
            registry,
        })
    }

    /// Record a handled request
    pub fn record_request(&self, rejected: bool) {
        self.requests_total.inc();
        if rejected {
            self.requests_rejected.inc();
        }
    }

    /// Record a charge outcome
    pub fn record_charge(&self, success: bool) {
        if success {
            self.charges_succeeded.inc();
        } else {
            self.charges_failed.inc();
        }
    }

    /// Record a completed synchronization cycle
    pub fn record_sync(&self, records: usize, duration_seconds: f64) {
        self.sync_cycles.inc();
        self.sync_records.observe(records as f64);
        self.sync_duration.observe(duration_seconds);
    }

    /// Record a failed synchronization cycle
    pub fn record_sync_failure(&self) {
        self.sync_failures.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
