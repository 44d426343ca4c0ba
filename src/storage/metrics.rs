//! Prometheus metrics for one cache instance
//!
//! Every cache owns its registry; nothing is registered globally, so
//! several caches can live in one process.

use crate::error::{Error, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metric handles of one cache
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    operations: IntCounterVec,
    operation_duration: HistogramVec,
    live_entries: IntGauge,
    live_bytes: IntGauge,
    compactions: IntCounter,
    compacted_bytes: IntCounter,
    coalesced_ranges: IntCounter,
}

impl CacheMetrics {
    /// Build and register every metric, labelled with the cache name
    pub fn new(cache: &str) -> Result<Self> {
        let registry = Registry::new();
        let opts = |name: &str, help: &str| Opts::new(name, help).const_label("cache", cache);

        let operations = IntCounterVec::new(
            opts("directcache_operations_total", "Cache operations by outcome"),
            &["op", "status"],
        )
        .map_err(metrics_error)?;
        let operation_duration = HistogramVec::new(
            HistogramOpts::new("directcache_operation_duration_seconds", "Operation latency")
                .const_label("cache", cache)
                .buckets(vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0, 10.0]),
            &["op"],
        )
        .map_err(metrics_error)?;
        let live_entries = IntGauge::with_opts(opts("directcache_live_entries", "Stored entries"))
            .map_err(metrics_error)?;
        let live_bytes = IntGauge::with_opts(opts("directcache_live_bytes", "Stored payload bytes"))
            .map_err(metrics_error)?;
        let compactions = IntCounter::with_opts(opts(
            "directcache_compactions_total",
            "Completed buffer compactions",
        ))
        .map_err(metrics_error)?;
        let compacted_bytes = IntCounter::with_opts(opts(
            "directcache_compacted_bytes_total",
            "Bytes copied by compaction",
        ))
        .map_err(metrics_error)?;
        let coalesced_ranges = IntCounter::with_opts(opts(
            "directcache_coalesced_ranges_total",
            "Fragments merged by coalescing",
        ))
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(operation_duration.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(live_entries.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(live_bytes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(compactions.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(compacted_bytes.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(coalesced_ranges.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            operation_duration,
            live_entries,
            live_bytes,
            compactions,
            compacted_bytes,
            coalesced_ranges,
        })
    }

    /// Record one operation and its outcome
    pub fn record<T>(&self, op: &str, elapsed: Duration, result: &Result<T>) {
        let status = match result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        self.operations.with_label_values(&[op, status]).inc();
        self.operation_duration
            .with_label_values(&[op])
            .observe(elapsed.as_secs_f64());
    }

    pub fn entry_added(&self, bytes: usize) {
        self.live_entries.inc();
        self.live_bytes.add(bytes as i64);
    }

    pub fn entry_removed(&self, bytes: usize) {
        self.live_entries.dec();
        self.live_bytes.sub(bytes as i64);
    }

    pub fn compacted(&self, bytes: usize) {
        self.compactions.inc();
        self.compacted_bytes.inc_by(bytes as u64);
    }

    pub fn coalesced(&self, ranges: usize) {
        self.coalesced_ranges.inc_by(ranges as u64);
    }

    pub fn reset_live(&self) {
        self.live_entries.set(0);
        self.live_bytes.set(0);
    }

    /// Count of operations `op` that ended with `status`
    pub fn operation_count(&self, op: &str, status: &str) -> u64 {
        self.operations.with_label_values(&[op, status]).get()
    }

    pub fn compaction_count(&self) -> u64 {
        self.compactions.get()
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Metrics(format!("UTF-8 conversion error: {}", e)))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Metrics(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_by_outcome() -> Result<()> {
        let metrics = CacheMetrics::new("DM-test")?;
        metrics.record("store", Duration::from_micros(5), &Ok(()));
        metrics.record::<()>(
            "store",
            Duration::from_micros(5),
            &Err(Error::AllocationFailed { requested: 10 }),
        );

        assert_eq!(metrics.operation_count("store", "ok"), 1);
        assert_eq!(metrics.operation_count("store", "allocation_failed"), 1);
        assert_eq!(metrics.operation_count("get", "ok"), 0);
        Ok(())
    }

    #[test]
    fn test_export_text_format() -> Result<()> {
        let metrics = CacheMetrics::new("DM-export")?;
        metrics.entry_added(230);
        metrics.compacted(1024);

        let text = metrics.export()?;
        assert!(text.contains("directcache_live_entries{cache=\"DM-export\"} 1"));
        assert!(text.contains("directcache_live_bytes{cache=\"DM-export\"} 230"));
        assert!(text.contains("directcache_compactions_total"));
        Ok(())
    }

    #[test]
    fn test_registry_errors_map_to_metrics() {
        let err = metrics_error(prometheus::Error::AlreadyReg);
        assert!(matches!(err, Error::Metrics(_)));
        assert_eq!(err.kind(), "metrics");
    }

    #[test]
    fn test_instances_are_independent() -> Result<()> {
        let a = CacheMetrics::new("a")?;
        let b = CacheMetrics::new("b")?;
        a.compacted(1);
        assert_eq!(a.compaction_count(), 1);
        assert_eq!(b.compaction_count(), 0);
        Ok(())
    }
}
