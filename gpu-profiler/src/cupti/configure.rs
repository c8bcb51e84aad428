//! Per-context PC sampling configuration

use aperture_shared::PcSamplingMetricKind;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use super::bindings::{
    CollectionMode, ConfigurationAttribute, ContextHandle, PcSamplingApi, PcSamplingData,
};
use super::stall_reasons::{resolve_stall_reasons, StallReason};
use crate::config::{check_frequency_exponent, SamplingConfig};
use crate::error::{GpuError, Result};

/// Sampling state owned by one GPU context
#[derive(Debug)]
pub struct ConfigureData {
    pub context: ContextHandle,
    pub context_id: u32,
    initialized: bool,
    pub frequency_exponent: u32,
    pub hardware_buffer_bytes: u64,
    pub scratch_buffer_bytes: u64,
    pub scratch_buffer_pc_count: usize,
    pub stall_reasons: Vec<StallReason>,
    pub num_valid_stall_reasons: usize,
    pub stall_reason_index_to_metric_kind: HashMap<u32, PcSamplingMetricKind>,
    pub non_issue_stall_reason_indices: HashSet<u32>,
    pub pc_sampling_data: PcSamplingData,
}

impl ConfigureData {
    /// Create an uninitialized configuration using the buffer sizes from `config`
    pub fn new(context: ContextHandle, context_id: u32, config: &SamplingConfig) -> Self {
        Self {
            context,
            context_id,
            initialized: false,
            frequency_exponent: config.frequency_exponent,
            hardware_buffer_bytes: config.hardware_buffer_bytes,
            scratch_buffer_bytes: config.scratch_buffer_bytes,
            scratch_buffer_pc_count: config.scratch_buffer_pc_count,
            stall_reasons: Vec::new(),
            num_valid_stall_reasons: 0,
            stall_reason_index_to_metric_kind: HashMap::new(),
            non_issue_stall_reason_indices: HashSet::new(),
            pc_sampling_data: PcSamplingData::default(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Names of all stall reasons, valid prefix first
    pub fn stall_reason_names(&self) -> Vec<&str> {
        self.stall_reasons.iter().map(|r| r.name.as_str()).collect()
    }

    /// Hardware indices of all stall reasons, parallel to `stall_reason_names`
    pub fn stall_reason_hardware_indices(&self) -> Vec<u32> {
        self.stall_reasons.iter().map(|r| r.hardware_index).collect()
    }

    /// Enable sampling and submit the configuration, once.
    ///
    /// Later calls return without touching the hardware, even with a
    /// different frequency.
    pub fn ensure_initialized<A: PcSamplingApi>(
        &mut self,
        api: &A,
        frequency_exponent: u32,
    ) -> Result<()> {
        if self.initialized {
            if frequency_exponent != self.frequency_exponent {
                debug!(
                    "Context {} already configured with frequency 2^{}, ignoring 2^{}",
                    self.context_id, self.frequency_exponent, frequency_exponent
                );
            }
            return Ok(());
        }
        check_frequency_exponent(frequency_exponent)?;

        api.enable(self.context)
            .map_err(GpuError::driver("cuptiPCSamplingEnable", Some(self.context_id)))?;

        let resolved = resolve_stall_reasons(api, self.context, self.context_id)?;
        self.stall_reasons = resolved.reasons;
        self.num_valid_stall_reasons = resolved.num_valid;
        self.stall_reason_index_to_metric_kind = resolved.index_to_metric_kind;
        self.non_issue_stall_reason_indices = resolved.non_issue_indices;
        self.frequency_exponent = frequency_exponent;
        self.pc_sampling_data = PcSamplingData::with_capacity(self.scratch_buffer_pc_count);

        let attributes = self.configuration_attributes();
        api.set_configuration(self.context, &attributes).map_err(GpuError::driver(
            "cuptiPCSamplingSetConfigurationAttribute",
            Some(self.context_id),
        ))?;

        self.initialized = true;
        info!(
            "PC sampling configured for context {}: period 2^{} cycles, {} stall reasons",
            self.context_id, self.frequency_exponent, self.num_valid_stall_reasons
        );
        Ok(())
    }

    fn configuration_attributes(&self) -> Vec<ConfigurationAttribute> {
        let valid_indices = self.stall_reasons[..self.num_valid_stall_reasons]
            .iter()
            .map(|r| r.hardware_index)
            .collect();

        vec![
            ConfigurationAttribute::StallReasons(valid_indices),
            ConfigurationAttribute::SamplingPeriod(self.frequency_exponent),
            ConfigurationAttribute::HardwareBufferSize(self.hardware_buffer_bytes),
            ConfigurationAttribute::ScratchBufferSize(self.scratch_buffer_bytes),
            ConfigurationAttribute::SamplingDataBuffer {
                pc_capacity: self.pc_sampling_data.collect_num_pcs,
            },
            ConfigurationAttribute::EnableStartStopControl(true),
            ConfigurationAttribute::CollectionMode(CollectionMode::Continuous),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cupti::replay::{ReplayApi, ReplayTrace};

    fn api() -> ReplayApi {
        ReplayApi::new(
            ReplayTrace::builder()
                .context(0x1000, 1)
                .stall_reason(3, "not_selected")
                .stall_reason(9, "unknown_xyz")
                .stall_reason(4, "smsp__pcsamp_warps_issue_stalled_barrier_not_issued")
                .build(),
        )
    }

    fn configure_data() -> ConfigureData {
        ConfigureData::new(ContextHandle(0x1000), 1, &SamplingConfig::default())
    }

    #[test]
    fn test_initialize_submits_single_batch() {
        let api = api();
        let mut data = configure_data();
        data.ensure_initialized(&api, 10).unwrap();

        assert!(data.is_initialized());
        assert_eq!(api.calls("set_configuration"), 1);
        assert_eq!(api.calls("enable"), 1);

        let attributes = api.last_configuration(ContextHandle(0x1000)).unwrap();
        assert_eq!(attributes.len(), 7);
        assert_eq!(attributes[0], ConfigurationAttribute::StallReasons(vec![3, 4]));
        assert_eq!(attributes[1], ConfigurationAttribute::SamplingPeriod(10));
        assert!(attributes.contains(&ConfigurationAttribute::CollectionMode(
            CollectionMode::Continuous
        )));
        assert!(attributes.contains(&ConfigurationAttribute::EnableStartStopControl(true)));
    }

    #[test]
    fn test_second_initialize_is_noop() {
        let api = api();
        let mut data = configure_data();
        data.ensure_initialized(&api, 10).unwrap();
        data.ensure_initialized(&api, 14).unwrap();

        assert_eq!(api.calls("set_configuration"), 1);
        assert_eq!(data.frequency_exponent, 10);
    }

    #[test]
    fn test_invalid_reason_permuted_to_tail() {
        let api = api();
        let mut data = configure_data();
        data.ensure_initialized(&api, 10).unwrap();

        assert_eq!(data.num_valid_stall_reasons, 2);
        assert_eq!(data.stall_reason_names()[2], "unknown_xyz");
        assert_eq!(data.stall_reason_hardware_indices(), vec![3, 4, 9]);
        assert!(data.non_issue_stall_reason_indices.contains(&4));
    }

    #[test]
    fn test_rejects_out_of_range_frequency() {
        let api = api();
        let mut data = configure_data();
        assert!(matches!(
            data.ensure_initialized(&api, 40),
            Err(GpuError::InvalidConfig(_))
        ));
        assert!(!data.is_initialized());
        assert_eq!(api.calls("enable"), 0);
    }

    #[test]
    fn test_configuration_failure_leaves_uninitialized() {
        let api = api();
        api.fail("set_configuration");
        let mut data = configure_data();

        let err = data.ensure_initialized(&api, 10).unwrap_err();
        assert!(err.to_string().contains("cuptiPCSamplingSetConfigurationAttribute"));
        assert!(!data.is_initialized());
    }

    #[test]
    fn test_no_stall_reasons_is_not_fatal() {
        let api = ReplayApi::new(ReplayTrace::builder().context(0x2000, 2).build());
        let mut data = ConfigureData::new(ContextHandle(0x2000), 2, &SamplingConfig::default());
        data.ensure_initialized(&api, 10).unwrap();

        assert_eq!(data.num_valid_stall_reasons, 0);
        let attributes = api.last_configuration(ContextHandle(0x2000)).unwrap();
        assert_eq!(attributes[0], ConfigurationAttribute::StallReasons(vec![]));
    }
}
