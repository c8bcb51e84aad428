//! PC sampling configuration

use serde::{Deserialize, Serialize};

use crate::error::{GpuError, Result};

/// Smallest and largest sampling period exponents CUPTI accepts
pub const MIN_FREQUENCY_EXPONENT: u32 = 5;
pub const MAX_FREQUENCY_EXPONENT: u32 = 31;

/// Sampling parameters applied when a context is first initialized
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Sampling period exponent, period = 2^n cycles
    pub frequency_exponent: u32,

    /// Memory reserved on the GPU for samples
    pub hardware_buffer_bytes: u64,

    /// Amount of data copied out of the hardware buffer each time
    pub scratch_buffer_bytes: u64,

    /// Number of PCs copied from the scratch buffer per refill
    pub scratch_buffer_pc_count: usize,

    /// Give up draining after this many refills (None = until the driver reports empty)
    pub max_drain_rounds: Option<u32>,

    /// Also emit each record under a per-source-line scope below the function scope
    pub line_scopes: bool,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl Default for SamplingConfig {
    fn default() -> Self {
        let hardware_mb: u64 = env_parse("APERTURE_PC_HW_BUFFER_MB").unwrap_or(512);
        let scratch_mb: u64 = env_parse("APERTURE_PC_SCRATCH_BUFFER_MB").unwrap_or(16);

        Self {
            frequency_exponent: env_parse("APERTURE_PC_SAMPLING_FREQUENCY").unwrap_or(10),
            hardware_buffer_bytes: hardware_mb * 1024 * 1024,
            scratch_buffer_bytes: scratch_mb * 1024 * 1024,
            scratch_buffer_pc_count: 4096,
            max_drain_rounds: env_parse("APERTURE_PC_MAX_DRAIN_ROUNDS"),
            line_scopes: env_parse("APERTURE_PC_LINE_SCOPES").unwrap_or(false),
        }
    }
}

impl SamplingConfig {
    /// Sampling period in cycles
    pub fn sampling_period_cycles(&self) -> u64 {
        1u64 << self.frequency_exponent.min(63)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        check_frequency_exponent(self.frequency_exponent)?;

        if self.hardware_buffer_bytes == 0 {
            return Err(GpuError::InvalidConfig(
                "hardware buffer size must be greater than 0".to_string(),
            ));
        }

        if self.scratch_buffer_bytes == 0 {
            return Err(GpuError::InvalidConfig(
                "scratch buffer size must be greater than 0".to_string(),
            ));
        }

        if self.scratch_buffer_bytes > self.hardware_buffer_bytes {
            return Err(GpuError::InvalidConfig(format!(
                "scratch buffer ({} bytes) larger than hardware buffer ({} bytes)",
                self.scratch_buffer_bytes, self.hardware_buffer_bytes
            )));
        }

        if self.scratch_buffer_pc_count == 0 {
            return Err(GpuError::InvalidConfig(
                "scratch buffer PC count must be greater than 0".to_string(),
            ));
        }

        if self.max_drain_rounds == Some(0) {
            return Err(GpuError::InvalidConfig(
                "max drain rounds must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

pub(crate) fn check_frequency_exponent(exponent: u32) -> Result<()> {
    if !(MIN_FREQUENCY_EXPONENT..=MAX_FREQUENCY_EXPONENT).contains(&exponent) {
        return Err(GpuError::InvalidConfig(format!(
            "sampling frequency exponent {} outside {}..={}",
            exponent, MIN_FREQUENCY_EXPONENT, MAX_FREQUENCY_EXPONENT
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> SamplingConfig {
        SamplingConfig {
            frequency_exponent: 10,
            hardware_buffer_bytes: 512 * 1024 * 1024,
            scratch_buffer_bytes: 16 * 1024 * 1024,
            scratch_buffer_pc_count: 4096,
            max_drain_rounds: None,
            line_scopes: false,
        }
    }

    #[test]
    fn test_sampling_period_calculation() {
        assert_eq!(base().sampling_period_cycles(), 1024);
    }

    #[test]
    fn test_config_validation() {
        assert!(base().validate().is_ok());

        let invalid = SamplingConfig {
            frequency_exponent: 4,
            ..base()
        };
        assert!(invalid.validate().is_err());

        let invalid = SamplingConfig {
            frequency_exponent: 32,
            ..base()
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_validation_scratch_larger_than_hardware() {
        let config = SamplingConfig {
            scratch_buffer_bytes: 1024,
            hardware_buffer_bytes: 512,
            ..base()
        };
        assert!(matches!(config.validate(), Err(GpuError::InvalidConfig(_))));
    }

    #[test]
    fn test_validation_zero_drain_rounds() {
        let config = SamplingConfig {
            max_drain_rounds: Some(0),
            ..base()
        };
        assert!(config.validate().is_err());

        let config = SamplingConfig {
            max_drain_rounds: Some(8),
            ..base()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_uses_defaults() {
        let config: SamplingConfig =
            serde_json::from_str(r#"{"frequency_exponent": 12, "scratch_buffer_pc_count": 128}"#)
                .unwrap();
        assert_eq!(config.frequency_exponent, 12);
        assert_eq!(config.scratch_buffer_pc_count, 128);
        assert!(config.hardware_buffer_bytes > 0);
        assert!(!config.line_scopes);
    }
}
