// directcache - Off-heap blob cache
// Handle-addressed storage over fixed-size memory regions with online compaction

#![warn(rust_2018_idioms)]

pub mod config;
pub mod index;
pub mod storage;

// Re-exports for convenience
pub use config::{ByteUnit, CacheConfig};
pub use index::{Comparator, NaturalOrder, OrderedIndexedList};
pub use storage::{CacheStats, CompactionDriver, CompactionReport, DirectCache, Handle};

/// directcache error types
pub mod error {
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Cache is inactive")]
        Inactive,

        #[error("Capacity exhausted: no free slot among {capacity} within {waited:?}")]
        CapacityExhausted { capacity: usize, waited: Duration },

        #[error("Allocation failed: no free range for {requested} bytes")]
        AllocationFailed { requested: usize },

        #[error("Invalid handle: {0}")]
        InvalidHandle(String),

        #[error("Lock timeout: {0}")]
        LockTimeout(String),

        #[error("Construction failed: {0}")]
        ConstructionFailed(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Region error: {0}")]
        Region(String),

        #[error("Metrics error: {0}")]
        Metrics(String),
    }

    impl Error {
        /// Stable label for metrics
        pub fn kind(&self) -> &'static str {
            match self {
                Error::Inactive => "inactive",
                Error::CapacityExhausted { .. } => "capacity_exhausted",
                Error::AllocationFailed { .. } => "allocation_failed",
                Error::InvalidHandle(_) => "invalid_handle",
                Error::LockTimeout(_) => "lock_timeout",
                Error::ConstructionFailed(_) => "construction_failed",
                Error::InvalidArgument(_) => "invalid_argument",
                Error::Config(_) => "config",
                Error::Region(_) => "region",
                Error::Metrics(_) => "metrics",
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = error::Error::AllocationFailed { requested: 230 };
        assert_eq!(err.to_string(), "Allocation failed: no free range for 230 bytes");
        assert_eq!(error::Error::Inactive.to_string(), "Cache is inactive");

        let err = error::Error::Metrics("duplicate registration".to_string());
        assert_eq!(err.kind(), "metrics");
        assert!(err.to_string().starts_with("Metrics error: "));
    }
}
