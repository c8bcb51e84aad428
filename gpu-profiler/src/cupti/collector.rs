//! CUPTI PC sampling session control
//!
//! One [`CuptiPcSampling`] instance serves every context of a profiling
//! session. Contexts are configured once, then armed and disarmed by
//! start/stop; stop drains and attributes all pending samples before it
//! returns.

use aperture_shared::{DataSink, ScopeId};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tracing::{debug, info};

use super::attribution::{process_pc_sampling_data, DrainOptions, DrainSummary};
use super::bindings::{ContextHandle, PcSamplingApi};
use super::configure::ConfigureData;
use super::cubin::CubinRegistry;
use crate::config::SamplingConfig;
use crate::error::{GpuError, Result};
use crate::GpuProfiler;

/// PC sampling backend over a CUPTI-like API and a data sink
pub struct CuptiPcSampling<A: PcSamplingApi, S: DataSink> {
    api: A,
    sink: S,
    config: SamplingConfig,
    /// Serializes start/stop, including the drain inside stop
    armed: Mutex<HashSet<u32>>,
    configure_data: Mutex<HashMap<u32, ConfigureData>>,
    cubins: CubinRegistry,
}

impl<A: PcSamplingApi, S: DataSink> CuptiPcSampling<A, S> {
    /// Create a new PC sampling backend
    pub fn new(api: A, sink: S, config: SamplingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            api,
            sink,
            config,
            armed: Mutex::new(HashSet::new()),
            configure_data: Mutex::new(HashMap::new()),
            cubins: CubinRegistry::new(),
        })
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn cubins(&self) -> &CubinRegistry {
        &self.cubins
    }

    /// Whether sampling is currently armed for a context
    pub fn is_armed(&self, context: ContextHandle) -> Result<bool> {
        let context_id = self.context_id(context)?;
        Ok(lock(&self.armed).contains(&context_id))
    }

    /// Whether a context has been configured
    pub fn is_initialized(&self, context: ContextHandle) -> Result<bool> {
        let context_id = self.context_id(context)?;
        Ok(lock(&self.configure_data)
            .get(&context_id)
            .is_some_and(ConfigureData::is_initialized))
    }

    /// Run `f` against a context's configuration, if one exists
    pub fn with_configure_data<R>(
        &self,
        context: ContextHandle,
        f: impl FnOnce(&ConfigureData) -> R,
    ) -> Result<Option<R>> {
        let context_id = self.context_id(context)?;
        Ok(lock(&self.configure_data).get(&context_id).map(f))
    }

    /// Initialize with the configured default frequency
    pub fn initialize_default(&self, context: ContextHandle) -> Result<()> {
        self.initialize(context, self.config.frequency_exponent)
    }

    /// Stop and return drain statistics; `None` when the context was not armed.
    pub fn stop_with_summary(
        &self,
        context: ContextHandle,
        scope: ScopeId,
    ) -> Result<Option<DrainSummary>> {
        let context_id = self.context_id(context)?;
        let mut armed = lock(&self.armed);
        if !armed.contains(&context_id) {
            debug!("Context {} not armed, stop ignored", context_id);
            return Ok(None);
        }

        self.api
            .stop(context)
            .map_err(GpuError::driver("cuptiPCSamplingStop", Some(context_id)))?;
        armed.remove(&context_id);

        let mut configure_data = lock(&self.configure_data);
        let data = configure_data
            .get_mut(&context_id)
            .ok_or(GpuError::NotInitialized {
                context: context_id,
            })?;
        let summary = process_pc_sampling_data(
            &self.api,
            &self.cubins,
            &self.sink,
            data,
            scope,
            DrainOptions::from(&self.config),
        )?;
        info!("PC sampling stopped for context {} (scope {})", context_id, scope);
        Ok(Some(summary))
    }

    fn context_id(&self, context: ContextHandle) -> Result<u32> {
        self.api
            .context_id(context)
            .map_err(GpuError::driver("cuptiGetContextId", None))
    }
}

impl<A: PcSamplingApi, S: DataSink> GpuProfiler for CuptiPcSampling<A, S> {
    fn initialize(&self, context: ContextHandle, frequency_exponent: u32) -> Result<()> {
        let context_id = self.context_id(context)?;
        let mut configure_data = lock(&self.configure_data);
        configure_data
            .entry(context_id)
            .or_insert_with(|| ConfigureData::new(context, context_id, &self.config))
            .ensure_initialized(&self.api, frequency_exponent)
    }

    fn start(&self, context: ContextHandle) -> Result<()> {
        let context_id = self.context_id(context)?;
        let mut armed = lock(&self.armed);
        if armed.contains(&context_id) {
            debug!("Context {} already armed, start ignored", context_id);
            return Ok(());
        }

        let initialized = lock(&self.configure_data)
            .get(&context_id)
            .is_some_and(ConfigureData::is_initialized);
        if !initialized {
            return Err(GpuError::NotInitialized {
                context: context_id,
            });
        }

        self.api
            .start(context)
            .map_err(GpuError::driver("cuptiPCSamplingStart", Some(context_id)))?;
        armed.insert(context_id);
        info!("PC sampling started for context {}", context_id);
        Ok(())
    }

    fn stop(&self, context: ContextHandle, scope: ScopeId) -> Result<()> {
        self.stop_with_summary(context, scope).map(|_| ())
    }

    fn finalize(&self, context: ContextHandle) -> Result<()> {
        let context_id = self.context_id(context)?;
        let mut armed = lock(&self.armed);
        let mut configure_data = lock(&self.configure_data);
        if !configure_data.contains_key(&context_id) {
            armed.remove(&context_id);
            return Ok(());
        }

        // State is only dropped once the driver has let go of the context.
        self.api
            .disable(context)
            .map_err(GpuError::driver("cuptiPCSamplingDisable", Some(context_id)))?;
        configure_data.remove(&context_id);
        armed.remove(&context_id);
        info!("PC sampling finalized for context {}", context_id);
        Ok(())
    }

    fn load_module(&self, cubin: &[u8]) -> Result<()> {
        self.cubins.load_module(&self.api, cubin).map(|_| ())
    }

    fn unload_module(&self, cubin: &[u8]) -> Result<()> {
        self.cubins.unload_module(&self.api, cubin).map(|_| ())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cupti::bindings::{PcSample, StallReasonSample};
    use crate::cupti::replay::{ReplayApi, ReplayTrace};
    use aperture_shared::ScopeTree;

    const CTX: ContextHandle = ContextHandle(0xc7);
    const CUBIN: &[u8] = b"collector test cubin";

    fn profiler() -> CuptiPcSampling<ReplayApi, ScopeTree> {
        let trace = ReplayTrace::builder()
            .context(CTX.0, 3)
            .stall_reason(0, "selected")
            .stall_reason(1, "long_scoreboard_not_issued")
            .source("gemm", 0x20, 88, Some("/kernels"), Some("gemm.cu"))
            .build();
        CuptiPcSampling::new(ReplayApi::new(trace), ScopeTree::new(), SamplingConfig::default())
            .unwrap()
    }

    fn gemm_sample() -> PcSample {
        PcSample {
            cubin_crc: ReplayApi::crc_of(CUBIN),
            function_index: 1,
            pc_offset: 0x20,
            function_name: "gemm".to_string(),
            stall_reasons: vec![
                StallReasonSample {
                    hardware_index: 0,
                    samples: 2,
                },
                StallReasonSample {
                    hardware_index: 1,
                    samples: 6,
                },
            ],
        }
    }

    #[test]
    fn test_initialize_twice_configures_once() {
        let profiler = profiler();
        profiler.initialize(CTX, 10).unwrap();
        profiler.initialize(CTX, 20).unwrap();

        assert_eq!(profiler.api().calls("set_configuration"), 1);
        assert!(profiler.is_initialized(CTX).unwrap());
    }

    #[test]
    fn test_double_start_issues_one_hardware_start() {
        let profiler = profiler();
        profiler.initialize(CTX, 10).unwrap();
        profiler.start(CTX).unwrap();
        profiler.start(CTX).unwrap();

        assert_eq!(profiler.api().calls("start"), 1);
        assert!(profiler.is_armed(CTX).unwrap());
    }

    #[test]
    fn test_start_before_initialize_fails() {
        let profiler = profiler();
        let err = profiler.start(CTX).unwrap_err();
        assert!(matches!(err, GpuError::NotInitialized { context: 3 }));
        assert_eq!(profiler.api().calls("start"), 0);
    }

    #[test]
    fn test_stop_when_unarmed_is_noop() {
        let profiler = profiler();
        profiler.initialize(CTX, 10).unwrap();
        profiler.stop(CTX, ScopeId(1)).unwrap();
        profiler.stop(CTX, ScopeId(1)).unwrap();

        assert_eq!(profiler.api().calls("stop"), 0);
        assert_eq!(profiler.api().calls("get_sampling_data"), 0);
    }

    #[test]
    fn test_stop_drains_and_attributes() {
        let profiler = profiler();
        profiler.initialize(CTX, 10).unwrap();
        profiler.load_module(CUBIN).unwrap();
        profiler.start(CTX).unwrap();
        profiler.api().push_samples(CTX, vec![gemm_sample()]);

        let summary = profiler.stop_with_summary(CTX, ScopeId(42)).unwrap().unwrap();

        assert_eq!(summary.pc_records, 1);
        assert_eq!(summary.metrics_emitted, 2);
        assert!(!profiler.is_armed(CTX).unwrap());
        assert!(!profiler.api().is_armed(CTX));

        let function = profiler.sink().child(ScopeId(42), "gemm").unwrap();
        let records = profiler.sink().records_for(function);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stalled_samples, 0);
        assert_eq!(records[1].stalled_samples, 6);
    }

    #[test]
    fn test_start_stop_start_again() {
        let profiler = profiler();
        profiler.initialize(CTX, 10).unwrap();
        profiler.start(CTX).unwrap();
        profiler.stop(CTX, ScopeId(1)).unwrap();
        profiler.start(CTX).unwrap();

        assert_eq!(profiler.api().calls("start"), 2);
        assert!(profiler.is_armed(CTX).unwrap());
    }

    #[test]
    fn test_finalize_requires_reinitialize() {
        let profiler = profiler();
        profiler.initialize(CTX, 10).unwrap();
        profiler.start(CTX).unwrap();
        profiler.finalize(CTX).unwrap();

        assert!(!profiler.is_armed(CTX).unwrap());
        assert!(!profiler.api().is_enabled(CTX));
        assert!(matches!(
            profiler.start(CTX),
            Err(GpuError::NotInitialized { .. })
        ));

        profiler.initialize(CTX, 10).unwrap();
        profiler.start(CTX).unwrap();
        assert_eq!(profiler.api().calls("set_configuration"), 2);
    }

    #[test]
    fn test_line_scopes_from_config() {
        let trace = ReplayTrace::builder()
            .context(CTX.0, 3)
            .stall_reason(0, "selected")
            .source("gemm", 0x20, 88, Some("/kernels"), Some("gemm.cu"))
            .build();
        let config = SamplingConfig {
            line_scopes: true,
            ..SamplingConfig::default()
        };
        let profiler = CuptiPcSampling::new(ReplayApi::new(trace), ScopeTree::new(), config).unwrap();
        profiler.initialize(CTX, 10).unwrap();
        profiler.load_module(CUBIN).unwrap();
        profiler.start(CTX).unwrap();
        profiler.api().push_samples(CTX, vec![gemm_sample()]);
        profiler.stop(CTX, ScopeId(42)).unwrap();

        let sink = profiler.sink();
        let function = sink.child(ScopeId(42), "gemm").unwrap();
        let line = sink.child(function, "/kernels/gemm.cu:gemm@88").unwrap();
        assert_eq!(sink.records_for(function).len(), 1);
        assert_eq!(sink.records_for(line).len(), 1);
    }

    #[test]
    fn test_failed_disable_keeps_context_configured() {
        let profiler = profiler();
        profiler.initialize(CTX, 10).unwrap();
        profiler.start(CTX).unwrap();
        profiler.api().fail("disable");

        let err = profiler.finalize(CTX).unwrap_err();
        assert!(err.to_string().contains("cuptiPCSamplingDisable failed for context 3"));
        assert!(profiler.is_initialized(CTX).unwrap());
        assert!(profiler.is_armed(CTX).unwrap());
        assert!(profiler.api().is_enabled(CTX));

        profiler.api().recover("disable");
        profiler.finalize(CTX).unwrap();
        assert!(!profiler.is_initialized(CTX).unwrap());
        assert!(!profiler.api().is_enabled(CTX));
    }

    #[test]
    fn test_finalize_unknown_context_is_noop() {
        let profiler = profiler();
        profiler.finalize(CTX).unwrap();
        assert_eq!(profiler.api().calls("disable"), 0);
    }

    #[test]
    fn test_hardware_start_failure_keeps_unarmed() {
        let profiler = profiler();
        profiler.initialize(CTX, 10).unwrap();
        profiler.api().fail("start");

        let err = profiler.start(CTX).unwrap_err();
        assert!(err.to_string().contains("cuptiPCSamplingStart failed for context 3"));
        assert!(!profiler.is_armed(CTX).unwrap());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = SamplingConfig {
            frequency_exponent: 2,
            ..SamplingConfig::default()
        };
        let result = CuptiPcSampling::new(
            ReplayApi::new(ReplayTrace::default()),
            ScopeTree::new(),
            config,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_context_handle() {
        let profiler = profiler();
        let err = profiler.initialize(ContextHandle(0xbad), 10).unwrap_err();
        assert!(err.to_string().contains("cuptiGetContextId"));
    }
}
