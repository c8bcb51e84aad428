//! Replay backend
//!
//! [`ReplayApi`] answers the PC-sampling call contract from a recorded
//! [`ReplayTrace`] instead of a live driver. It is used to replay captured
//! sessions offline and to exercise the backend without a GPU.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use super::bindings::{
    ApiResult, ApiStatus, ConfigurationAttribute, ContextHandle, PcSample, PcSamplingApi,
    PcSamplingData, SourceCorrelation, StallReasonInfo,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayContext {
    pub handle: ContextHandle,
    pub id: u32,
    /// Samples sitting in the hardware buffer when the replay starts
    #[serde(default)]
    pub samples: Vec<PcSample>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySource {
    pub function_name: String,
    pub pc_offset: u64,
    pub line_number: u32,
    #[serde(default)]
    pub dir_name: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// A recorded device: its contexts, stall reason table and source line table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayTrace {
    #[serde(default)]
    pub contexts: Vec<ReplayContext>,
    #[serde(default)]
    pub stall_reasons: Vec<StallReasonInfo>,
    #[serde(default)]
    pub sources: Vec<ReplaySource>,
}

impl ReplayTrace {
    pub fn builder() -> ReplayTraceBuilder {
        ReplayTraceBuilder::default()
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse replay trace")
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay trace: {}", path.display()))?;
        Self::from_json_str(&contents)
    }
}

#[derive(Debug, Default)]
pub struct ReplayTraceBuilder {
    trace: ReplayTrace,
}

impl ReplayTraceBuilder {
    pub fn context(mut self, handle: u64, id: u32) -> Self {
        self.trace.contexts.push(ReplayContext {
            handle: ContextHandle(handle),
            id,
            samples: Vec::new(),
        });
        self
    }

    pub fn stall_reason(mut self, index: u32, name: &str) -> Self {
        self.trace.stall_reasons.push(StallReasonInfo {
            index,
            name: name.to_string(),
        });
        self
    }

    pub fn source(
        mut self,
        function_name: &str,
        pc_offset: u64,
        line_number: u32,
        dir_name: Option<&str>,
        file_name: Option<&str>,
    ) -> Self {
        self.trace.sources.push(ReplaySource {
            function_name: function_name.to_string(),
            pc_offset,
            line_number,
            dir_name: dir_name.map(str::to_string),
            file_name: file_name.map(str::to_string),
        });
        self
    }

    pub fn build(self) -> ReplayTrace {
        self.trace
    }
}

#[derive(Debug, Default)]
struct ContextState {
    id: u32,
    enabled: bool,
    armed: bool,
    configuration: Option<Vec<ConfigurationAttribute>>,
    pending: VecDeque<PcSample>,
    never_drain: bool,
}

#[derive(Debug, Default)]
struct ReplayState {
    contexts: HashMap<ContextHandle, ContextState>,
    calls: HashMap<&'static str, usize>,
    failing: HashSet<String>,
}

/// In-process implementation of [`PcSamplingApi`]
#[derive(Debug)]
pub struct ReplayApi {
    stall_reasons: Vec<StallReasonInfo>,
    sources: HashMap<(String, u64), ReplaySource>,
    state: Mutex<ReplayState>,
}

impl ReplayApi {
    pub fn new(trace: ReplayTrace) -> Self {
        let contexts = trace
            .contexts
            .into_iter()
            .map(|c| {
                let state = ContextState {
                    id: c.id,
                    pending: c.samples.into(),
                    ..ContextState::default()
                };
                (c.handle, state)
            })
            .collect();
        let sources = trace
            .sources
            .into_iter()
            .map(|s| ((s.function_name.clone(), s.pc_offset), s))
            .collect();

        Self {
            stall_reasons: trace.stall_reasons,
            sources,
            state: Mutex::new(ReplayState {
                contexts,
                ..ReplayState::default()
            }),
        }
    }

    /// CRC the replay driver reports for a cubin (64-bit FNV-1a)
    pub fn crc_of(cubin: &[u8]) -> u64 {
        cubin.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, b| {
            (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }

    /// Queue samples in a context's hardware buffer
    pub fn push_samples(&self, context: ContextHandle, samples: Vec<PcSample>) {
        let mut state = self.lock();
        if let Some(ctx) = state.contexts.get_mut(&context) {
            ctx.pending.extend(samples);
        }
    }

    /// Make every call to `op` fail with `CUPTI_ERROR_UNKNOWN`
    pub fn fail(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    /// Stop failing calls to `op`
    pub fn recover(&self, op: &str) {
        self.lock().failing.remove(op);
    }

    /// Make the context report pending PCs forever
    pub fn never_drain(&self, context: ContextHandle) {
        if let Some(ctx) = self.lock().contexts.get_mut(&context) {
            ctx.never_drain = true;
        }
    }

    /// Number of calls made to `op` so far
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Attributes of the last configuration submitted for a context
    pub fn last_configuration(&self, context: ContextHandle) -> Option<Vec<ConfigurationAttribute>> {
        self.lock()
            .contexts
            .get(&context)
            .and_then(|c| c.configuration.clone())
    }

    pub fn is_armed(&self, context: ContextHandle) -> bool {
        self.lock().contexts.get(&context).is_some_and(|c| c.armed)
    }

    pub fn is_enabled(&self, context: ContextHandle) -> bool {
        self.lock().contexts.get(&context).is_some_and(|c| c.enabled)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReplayState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Count the call and apply failure injection
    fn enter(&self, op: &'static str) -> ApiResult<std::sync::MutexGuard<'_, ReplayState>> {
        let mut state = self.lock();
        *state.calls.entry(op).or_insert(0) += 1;
        if state.failing.contains(op) {
            return Err(ApiStatus::UNKNOWN);
        }
        Ok(state)
    }

    fn with_context<T>(
        &self,
        op: &'static str,
        context: ContextHandle,
        f: impl FnOnce(&mut ContextState) -> ApiResult<T>,
    ) -> ApiResult<T> {
        let mut state = self.enter(op)?;
        let ctx = state
            .contexts
            .get_mut(&context)
            .ok_or(ApiStatus::INVALID_CONTEXT)?;
        f(ctx)
    }
}

impl PcSamplingApi for ReplayApi {
    fn context_id(&self, context: ContextHandle) -> ApiResult<u32> {
        self.with_context("context_id", context, |ctx| Ok(ctx.id))
    }

    fn num_stall_reasons(&self, context: ContextHandle) -> ApiResult<usize> {
        let count = self.stall_reasons.len();
        self.with_context("num_stall_reasons", context, |_| Ok(count))
    }

    fn stall_reasons(&self, context: ContextHandle, count: usize) -> ApiResult<Vec<StallReasonInfo>> {
        let reasons = &self.stall_reasons;
        self.with_context("stall_reasons", context, |_| {
            if count > reasons.len() {
                return Err(ApiStatus::INVALID_PARAMETER);
            }
            Ok(reasons[..count].to_vec())
        })
    }

    fn cubin_crc(&self, cubin: &[u8]) -> ApiResult<u64> {
        self.enter("cubin_crc")?;
        if cubin.is_empty() {
            return Err(ApiStatus::INVALID_PARAMETER);
        }
        Ok(Self::crc_of(cubin))
    }

    fn source_correlation(
        &self,
        _cubin: &[u8],
        function_name: &str,
        pc_offset: u64,
    ) -> ApiResult<SourceCorrelation> {
        self.enter("source_correlation")?;
        Ok(self
            .sources
            .get(&(function_name.to_string(), pc_offset))
            .map(|s| SourceCorrelation {
                line_number: s.line_number,
                file_name: s.file_name.clone(),
                dir_name: s.dir_name.clone(),
            })
            .unwrap_or_default())
    }

    fn enable(&self, context: ContextHandle) -> ApiResult<()> {
        self.with_context("enable", context, |ctx| {
            ctx.enabled = true;
            Ok(())
        })
    }

    fn disable(&self, context: ContextHandle) -> ApiResult<()> {
        self.with_context("disable", context, |ctx| {
            ctx.enabled = false;
            ctx.armed = false;
            ctx.configuration = None;
            Ok(())
        })
    }

    fn start(&self, context: ContextHandle) -> ApiResult<()> {
        self.with_context("start", context, |ctx| {
            if !ctx.enabled || ctx.configuration.is_none() {
                return Err(ApiStatus::NOT_INITIALIZED);
            }
            ctx.armed = true;
            Ok(())
        })
    }

    fn stop(&self, context: ContextHandle) -> ApiResult<()> {
        self.with_context("stop", context, |ctx| {
            if !ctx.armed {
                return Err(ApiStatus::NOT_INITIALIZED);
            }
            ctx.armed = false;
            Ok(())
        })
    }

    fn get_sampling_data(&self, context: ContextHandle, data: &mut PcSamplingData) -> ApiResult<()> {
        self.with_context("get_sampling_data", context, |ctx| {
            if !ctx.enabled {
                return Err(ApiStatus::NOT_INITIALIZED);
            }
            data.clear();
            if ctx.never_drain {
                data.remaining_num_pcs = 1;
                return Ok(());
            }
            let take = data.collect_num_pcs.min(ctx.pending.len());
            data.pc_records.extend(ctx.pending.drain(..take));
            data.total_num_pcs = take;
            data.remaining_num_pcs = ctx.pending.len();
            Ok(())
        })
    }

    fn set_configuration(
        &self,
        context: ContextHandle,
        attributes: &[ConfigurationAttribute],
    ) -> ApiResult<()> {
        self.with_context("set_configuration", context, |ctx| {
            if !ctx.enabled {
                return Err(ApiStatus::NOT_INITIALIZED);
            }
            ctx.configuration = Some(attributes.to_vec());
            Ok(())
        })
    }
}
