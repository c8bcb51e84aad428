//! PC-sampling metric taxonomy and metric records
//!
//! The taxonomy is the fixed set of stall categories that hardware stall
//! reasons are normalized onto. Its enumeration order is significant: stall
//! reason matching takes the first entry whose name contains the reason.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Recognized PC-sampling metric kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PcSamplingMetricKind {
    NumSamples,
    NumStalledSamples,
    StalledBranchResolving,
    StalledNoInstructions,
    StalledShortScoreboard,
    StalledWait,
    StalledLongScoreboard,
    StalledTexThrottle,
    StalledBarrier,
    StalledMembar,
    StalledIMCMiss,
    StalledMIOThrottle,
    StalledMathPipeThrottle,
    StalledDrain,
    StalledLGThrottle,
    // Must precede StalledNotSelected, "selected" is a substring of it.
    StalledSelected,
    StalledNotSelected,
    StalledMisc,
    StalledDispatchStall,
    StalledSleeping,
}

impl PcSamplingMetricKind {
    /// Number of metric kinds in the taxonomy
    pub const COUNT: usize = 20;

    /// All metric kinds, in enumeration order
    pub const ALL: [PcSamplingMetricKind; Self::COUNT] = [
        Self::NumSamples,
        Self::NumStalledSamples,
        Self::StalledBranchResolving,
        Self::StalledNoInstructions,
        Self::StalledShortScoreboard,
        Self::StalledWait,
        Self::StalledLongScoreboard,
        Self::StalledTexThrottle,
        Self::StalledBarrier,
        Self::StalledMembar,
        Self::StalledIMCMiss,
        Self::StalledMIOThrottle,
        Self::StalledMathPipeThrottle,
        Self::StalledDrain,
        Self::StalledLGThrottle,
        Self::StalledSelected,
        Self::StalledNotSelected,
        Self::StalledMisc,
        Self::StalledDispatchStall,
        Self::StalledSleeping,
    ];

    /// Position of this kind in the taxonomy
    pub fn index(self) -> usize {
        self as usize
    }

    /// Look up a kind by its taxonomy position
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Display name of this kind
    pub fn name(self) -> &'static str {
        match self {
            Self::NumSamples => "NumSamples",
            Self::NumStalledSamples => "NumStalledSamples",
            Self::StalledBranchResolving => "StalledBranchResolving",
            Self::StalledNoInstructions => "StalledNoInstructions",
            Self::StalledShortScoreboard => "StalledShortScoreboard",
            Self::StalledWait => "StalledWait",
            Self::StalledLongScoreboard => "StalledLongScoreboard",
            Self::StalledTexThrottle => "StalledTexThrottle",
            Self::StalledBarrier => "StalledBarrier",
            Self::StalledMembar => "StalledMembar",
            Self::StalledIMCMiss => "StalledIMCMiss",
            Self::StalledMIOThrottle => "StalledMIOThrottle",
            Self::StalledMathPipeThrottle => "StalledMathPipeThrottle",
            Self::StalledDrain => "StalledDrain",
            Self::StalledLGThrottle => "StalledLGThrottle",
            Self::StalledSelected => "StalledSelected",
            Self::StalledNotSelected => "StalledNotSelected",
            Self::StalledMisc => "StalledMisc",
            Self::StalledDispatchStall => "StalledDispatchStall",
            Self::StalledSleeping => "StalledSleeping",
        }
    }
}

impl fmt::Display for PcSamplingMetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown metric kind name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown PC sampling metric kind: {0}")]
pub struct UnknownMetricKind(pub String);

impl FromStr for PcSamplingMetricKind {
    type Err = UnknownMetricKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownMetricKind(s.to_string()))
    }
}

/// One attributed stall-reason count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcSamplingMetric {
    /// Stall category the samples are attributed to
    pub kind: PcSamplingMetricKind,

    /// Number of samples observed for this stall reason
    pub samples: u64,

    /// Number of those samples where the warp was stalled without issuing
    pub stalled_samples: u64,
}

impl PcSamplingMetric {
    pub fn new(kind: PcSamplingMetricKind, samples: u64, stalled_samples: u64) -> Self {
        Self {
            kind,
            samples,
            stalled_samples,
        }
    }
}

/// Accumulated metric values for one scope, indexed by taxonomy position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcSamplingValues {
    values: Vec<u64>,
}

impl PcSamplingValues {
    pub fn new() -> Self {
        Self {
            values: vec![0; PcSamplingMetricKind::COUNT],
        }
    }

    /// Fold a metric record into the totals.
    ///
    /// The record's kind and `NumSamples` receive the sample count,
    /// `NumStalledSamples` receives the stalled count.
    pub fn accumulate(&mut self, metric: &PcSamplingMetric) {
        self.values[metric.kind.index()] += metric.samples;
        self.values[PcSamplingMetricKind::NumSamples.index()] += metric.samples;
        self.values[PcSamplingMetricKind::NumStalledSamples.index()] += metric.stalled_samples;
    }

    pub fn get(&self, kind: PcSamplingMetricKind) -> u64 {
        self.values[kind.index()]
    }

    /// Non-zero values keyed by metric name
    pub fn non_zero(&self) -> Vec<(&'static str, u64)> {
        PcSamplingMetricKind::ALL
            .iter()
            .filter(|kind| self.get(**kind) > 0)
            .map(|kind| (kind.name(), self.get(*kind)))
            .collect()
    }
}

impl Default for PcSamplingValues {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_matches_enumeration_order() {
        for (i, kind) in PcSamplingMetricKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
            assert_eq!(PcSamplingMetricKind::from_index(i), Some(*kind));
        }
        assert_eq!(PcSamplingMetricKind::from_index(PcSamplingMetricKind::COUNT), None);
    }

    #[test]
    fn test_selected_precedes_not_selected() {
        assert!(PcSamplingMetricKind::StalledSelected < PcSamplingMetricKind::StalledNotSelected);
    }

    #[test]
    fn test_parse_kind_case_insensitive() {
        assert_eq!(
            "stalledbarrier".parse::<PcSamplingMetricKind>().unwrap(),
            PcSamplingMetricKind::StalledBarrier
        );
        assert!("StalledNowhere".parse::<PcSamplingMetricKind>().is_err());
    }

    #[test]
    fn test_values_accumulate() {
        let mut values = PcSamplingValues::new();
        values.accumulate(&PcSamplingMetric::new(PcSamplingMetricKind::StalledWait, 4, 4));
        values.accumulate(&PcSamplingMetric::new(PcSamplingMetricKind::StalledSelected, 6, 0));

        assert_eq!(values.get(PcSamplingMetricKind::NumSamples), 10);
        assert_eq!(values.get(PcSamplingMetricKind::NumStalledSamples), 4);
        assert_eq!(values.get(PcSamplingMetricKind::StalledWait), 4);
        assert_eq!(values.get(PcSamplingMetricKind::StalledSelected), 6);
        assert_eq!(values.non_zero().len(), 4);
    }
}
