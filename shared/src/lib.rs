//! Shared types for Aperture profiler backends
//!
//! This crate holds the scope/metric data model that profiler backends report
//! into: the PC-sampling metric taxonomy, the metric record, and the
//! [`DataSink`] trait together with an in-memory implementation.

pub mod types;

// Re-export commonly used types
pub use types::{metric::*, scope::*};
