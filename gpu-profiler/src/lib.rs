//! GPU PC sampling
//!
//! Collects program-counter samples from the GPU through CUPTI, maps them to
//! source lines and attributes stall-reason counts to scopes of the host
//! profiler's data model.

pub mod config;
pub mod cupti;
pub mod error;
pub mod metrics;

pub use config::SamplingConfig;
pub use cupti::bindings::ContextHandle;
pub use cupti::collector::CuptiPcSampling;
pub use error::{GpuError, Result};

use aperture_shared::ScopeId;

/// GPU profiler interface driven by the host profiling framework
pub trait GpuProfiler {
    /// Configure sampling for a context, once. Later calls are no-ops.
    fn initialize(&self, context: ContextHandle, frequency_exponent: u32) -> Result<()>;

    /// Arm sampling for a context
    fn start(&self, context: ContextHandle) -> Result<()>;

    /// Disarm sampling and attribute all pending samples under `scope`
    fn stop(&self, context: ContextHandle, scope: ScopeId) -> Result<()>;

    /// Disable sampling for a context entirely
    fn finalize(&self, context: ContextHandle) -> Result<()>;

    /// Module-load callback
    fn load_module(&self, cubin: &[u8]) -> Result<()>;

    /// Module-unload callback
    fn unload_module(&self, cubin: &[u8]) -> Result<()>;
}
