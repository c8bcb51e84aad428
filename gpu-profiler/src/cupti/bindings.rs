//! CUPTI PC-sampling call contract
//!
//! The driver/profiling API is consumed through [`PcSamplingApi`]: one method
//! per CUPTI entry point the backend uses, each returning the raw status on
//! failure. Data shapes mirror the `CUpti_PCSampling*` structures.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque token identifying a driver context (a `CUcontext` pointer value)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextHandle(pub u64);

/// Non-success status returned by a CUPTI call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus(pub u32);

impl ApiStatus {
    pub const INVALID_PARAMETER: ApiStatus = ApiStatus(1);
    pub const INVALID_CONTEXT: ApiStatus = ApiStatus(3);
    pub const NOT_INITIALIZED: ApiStatus = ApiStatus(15);
    pub const NOT_SUPPORTED: ApiStatus = ApiStatus(28);
    pub const UNKNOWN: ApiStatus = ApiStatus(999);
}

impl fmt::Display for ApiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::INVALID_PARAMETER => "CUPTI_ERROR_INVALID_PARAMETER",
            Self::INVALID_CONTEXT => "CUPTI_ERROR_INVALID_CONTEXT",
            Self::NOT_INITIALIZED => "CUPTI_ERROR_NOT_INITIALIZED",
            Self::NOT_SUPPORTED => "CUPTI_ERROR_NOT_SUPPORTED",
            _ => "CUPTI_ERROR_UNKNOWN",
        };
        write!(f, "{} ({})", name, self.0)
    }
}

/// Result of a single CUPTI call
pub type ApiResult<T> = std::result::Result<T, ApiStatus>;

/// Stall reason as reported by `cuptiPCSamplingGetStallReasons`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallReasonInfo {
    pub index: u32,
    pub name: String,
}

/// PC sampling collection mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionMode {
    Continuous,
    KernelSerialized,
}

/// One entry of the batched `cuptiPCSamplingSetConfigurationAttribute` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationAttribute {
    /// Hardware stall indices to collect
    StallReasons(Vec<u32>),
    /// Sampling period exponent, period = 2^n cycles
    SamplingPeriod(u32),
    HardwareBufferSize(u64),
    ScratchBufferSize(u64),
    /// Capacity (in PCs) of the host buffer samples are drained into
    SamplingDataBuffer { pc_capacity: usize },
    EnableStartStopControl(bool),
    CollectionMode(CollectionMode),
}

/// Samples recorded for one stall reason at one PC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StallReasonSample {
    pub hardware_index: u32,
    pub samples: u64,
}

/// One sampled PC (`CUpti_PCSamplingPCData`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcSample {
    pub cubin_crc: u64,
    pub function_index: u32,
    pub pc_offset: u64,
    pub function_name: String,
    pub stall_reasons: Vec<StallReasonSample>,
}

/// Host buffer the driver drains samples into (`CUpti_PCSamplingData`)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcSamplingData {
    /// Number of PCs the driver may write per refill
    pub collect_num_pcs: usize,
    /// Number of PCs written by the last refill
    pub total_num_pcs: usize,
    /// Number of PCs still pending in the hardware buffer
    pub remaining_num_pcs: usize,
    pub pc_records: Vec<PcSample>,
}

impl PcSamplingData {
    pub fn with_capacity(collect_num_pcs: usize) -> Self {
        Self {
            collect_num_pcs,
            total_num_pcs: 0,
            remaining_num_pcs: 0,
            pc_records: Vec::with_capacity(collect_num_pcs),
        }
    }

    /// Forget the current batch before the driver refills the buffer
    pub fn clear(&mut self) {
        self.total_num_pcs = 0;
        self.remaining_num_pcs = 0;
        self.pc_records.clear();
    }

    /// True when the driver reports nothing left to drain
    pub fn is_drained(&self) -> bool {
        self.total_num_pcs == 0 && self.remaining_num_pcs == 0
    }
}

/// Answer of `cuptiGetSassToSourceCorrelation`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCorrelation {
    pub line_number: u32,
    pub file_name: Option<String>,
    pub dir_name: Option<String>,
}

/// The CUPTI/driver entry points used by PC sampling
pub trait PcSamplingApi: Send + Sync {
    /// `cuptiGetContextId`
    fn context_id(&self, context: ContextHandle) -> ApiResult<u32>;

    /// `cuptiPCSamplingGetNumStallReasons`
    fn num_stall_reasons(&self, context: ContextHandle) -> ApiResult<usize>;

    /// `cuptiPCSamplingGetStallReasons`
    fn stall_reasons(&self, context: ContextHandle, count: usize)
        -> ApiResult<Vec<StallReasonInfo>>;

    /// `cuptiGetCubinCrc`
    fn cubin_crc(&self, cubin: &[u8]) -> ApiResult<u64>;

    /// `cuptiGetSassToSourceCorrelation`
    fn source_correlation(
        &self,
        cubin: &[u8],
        function_name: &str,
        pc_offset: u64,
    ) -> ApiResult<SourceCorrelation>;

    /// `cuptiPCSamplingEnable`
    fn enable(&self, context: ContextHandle) -> ApiResult<()>;

    /// `cuptiPCSamplingDisable`
    fn disable(&self, context: ContextHandle) -> ApiResult<()>;

    /// `cuptiPCSamplingStart`
    fn start(&self, context: ContextHandle) -> ApiResult<()>;

    /// `cuptiPCSamplingStop`
    fn stop(&self, context: ContextHandle) -> ApiResult<()>;

    /// `cuptiPCSamplingGetData`: overwrite `data` with the next batch
    fn get_sampling_data(&self, context: ContextHandle, data: &mut PcSamplingData)
        -> ApiResult<()>;

    /// `cuptiPCSamplingSetConfigurationAttribute`
    fn set_configuration(
        &self,
        context: ContextHandle,
        attributes: &[ConfigurationAttribute],
    ) -> ApiResult<()>;
}
