//! Stall reason discovery
//!
//! Hardware stall reasons are matched against the metric taxonomy by name.
//! Reasons that match nothing are kept but moved behind the valid ones, so
//! the valid prefix can be handed to the hardware as-is.

use aperture_shared::PcSamplingMetricKind;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use super::bindings::{ContextHandle, PcSamplingApi, StallReasonInfo};
use crate::error::{GpuError, Result};

/// Counter prefix shared by all stall reason names
const STALL_REASON_PREFIX: &str = "smsp__pcsamp_warps_issue_stalled_";

/// Suffix marking the variant of a reason where the warp did not issue
const NOT_ISSUED_SUFFIX: &str = "_not_issued";

/// A hardware stall reason and the metric kind it maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallReason {
    pub name: String,
    pub hardware_index: u32,
    pub metric_kind: Option<PcSamplingMetricKind>,
    pub not_issued: bool,
}

impl StallReason {
    pub fn is_valid(&self) -> bool {
        self.metric_kind.is_some()
    }
}

/// Stall reasons after matching, valid entries first
#[derive(Debug, Clone, Default)]
pub struct ResolvedStallReasons {
    pub reasons: Vec<StallReason>,
    pub num_valid: usize,
    pub index_to_metric_kind: HashMap<u32, PcSamplingMetricKind>,
    pub non_issue_indices: HashSet<u32>,
}

impl ResolvedStallReasons {
    /// Hardware indices of the valid reasons, in partition order
    pub fn valid_hardware_indices(&self) -> Vec<u32> {
        self.reasons[..self.num_valid]
            .iter()
            .map(|r| r.hardware_index)
            .collect()
    }
}

/// Normalize a hardware reason name for matching.
///
/// Returns the stripped, case-folded name and whether it is a not-issued variant.
pub fn normalize_stall_name(name: &str) -> (String, bool) {
    let name = name.trim_end_matches('\0');
    let name = name.strip_prefix(STALL_REASON_PREFIX).unwrap_or(name);
    let (name, not_issued) = match name.strip_suffix(NOT_ISSUED_SUFFIX) {
        Some(stripped) => (stripped, true),
        None => (name, false),
    };
    (name.replace('_', "").to_lowercase(), not_issued)
}

/// First taxonomy entry whose case-folded name contains `normalized`
pub fn match_metric_kind(normalized: &str) -> Option<PcSamplingMetricKind> {
    if normalized.is_empty() {
        return None;
    }
    PcSamplingMetricKind::ALL
        .iter()
        .copied()
        .find(|kind| kind.name().to_lowercase().contains(normalized))
}

/// Match reasons against the taxonomy and move invalid ones to the tail.
pub fn match_stall_reasons(infos: Vec<StallReasonInfo>) -> ResolvedStallReasons {
    let mut index_to_metric_kind = HashMap::new();
    let mut non_issue_indices = HashSet::new();

    let reasons: Vec<StallReason> = infos
        .into_iter()
        .map(|info| {
            let (normalized, not_issued) = normalize_stall_name(&info.name);
            let metric_kind = match_metric_kind(&normalized);
            match metric_kind {
                Some(kind) => {
                    index_to_metric_kind.insert(info.index, kind);
                    if not_issued {
                        non_issue_indices.insert(info.index);
                    }
                }
                None => debug!("Unrecognized stall reason {} ({})", info.name, info.index),
            }
            StallReason {
                name: info.name,
                hardware_index: info.index,
                metric_kind,
                not_issued,
            }
        })
        .collect();

    let (mut valid, invalid): (Vec<_>, Vec<_>) = reasons.into_iter().partition(StallReason::is_valid);
    let num_valid = valid.len();
    valid.extend(invalid);

    ResolvedStallReasons {
        reasons: valid,
        num_valid,
        index_to_metric_kind,
        non_issue_indices,
    }
}

/// Query the context's stall reasons and match them.
pub fn resolve_stall_reasons<A: PcSamplingApi>(
    api: &A,
    context: ContextHandle,
    context_id: u32,
) -> Result<ResolvedStallReasons> {
    let count = api
        .num_stall_reasons(context)
        .map_err(GpuError::driver("cuptiPCSamplingGetNumStallReasons", Some(context_id)))?;

    if count == 0 {
        warn!(
            "Context {} reports no stall reasons, samples will carry no stall attribution",
            context_id
        );
        return Ok(ResolvedStallReasons::default());
    }

    let infos = api
        .stall_reasons(context, count)
        .map_err(GpuError::driver("cuptiPCSamplingGetStallReasons", Some(context_id)))?;

    let resolved = match_stall_reasons(infos);
    debug!(
        "Context {}: {} of {} stall reasons recognized",
        context_id,
        resolved.num_valid,
        resolved.reasons.len()
    );
    Ok(resolved)
}
