//! Sample attribution
//!
//! Drains the context's sampling buffer and turns every PC record into
//! metric records under the caller's scope.

use aperture_shared::{DataSink, PcSamplingMetric, ScopeId};
use tracing::{debug, info, warn};

use super::bindings::{PcSample, PcSamplingApi};
use super::configure::ConfigureData;
use super::cubin::CubinRegistry;
use crate::config::SamplingConfig;
use crate::error::{GpuError, Result};
use crate::metrics;

/// Counts from one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub rounds: u32,
    pub pc_records: u64,
    pub metrics_emitted: u64,
    pub dropped_stall_samples: u64,
}

/// Knobs for one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOptions {
    /// Fail after this many refills
    pub max_rounds: Option<u32>,
    /// Also emit each record under a `"{file}:{function}@{line}"` scope
    pub line_scopes: bool,
}

impl From<&SamplingConfig> for DrainOptions {
    fn from(config: &SamplingConfig) -> Self {
        Self {
            max_rounds: config.max_drain_rounds,
            line_scopes: config.line_scopes,
        }
    }
}

/// Attribute everything buffered for `configure_data`'s context to `scope`.
///
/// The current contents of the buffer are processed first; the buffer is
/// then refilled from the hardware until it reports no PCs left.
pub fn process_pc_sampling_data<A: PcSamplingApi, S: DataSink + ?Sized>(
    api: &A,
    cubins: &CubinRegistry,
    sink: &S,
    configure_data: &mut ConfigureData,
    scope: ScopeId,
    options: DrainOptions,
) -> Result<DrainSummary> {
    let mut summary = DrainSummary::default();
    let mut first_round = true;

    loop {
        let records = std::mem::take(&mut configure_data.pc_sampling_data.pc_records);
        for pc in &records {
            attribute_pc(api, cubins, sink, configure_data, scope, pc, options, &mut summary)?;
        }
        summary.pc_records += records.len() as u64;
        metrics::PC_SAMPLES_TOTAL.inc_by(records.len() as f64);

        let data = &mut configure_data.pc_sampling_data;
        if data.remaining_num_pcs == 0 && !first_round {
            break;
        }
        if let Some(max) = options.max_rounds {
            if summary.rounds >= max {
                return Err(GpuError::DrainIncomplete {
                    context: configure_data.context_id,
                    rounds: summary.rounds,
                });
            }
        }

        data.clear();
        // Keep the allocation across refills.
        data.pc_records = records;
        data.pc_records.clear();
        api.get_sampling_data(configure_data.context, data)
            .map_err(GpuError::driver("cuptiPCSamplingGetData", Some(configure_data.context_id)))?;
        summary.rounds += 1;
        first_round = false;

        if data.is_drained() {
            break;
        }
    }

    info!(
        "Context {}: attributed {} PC records ({} metrics) in {} rounds",
        configure_data.context_id, summary.pc_records, summary.metrics_emitted, summary.rounds
    );
    Ok(summary)
}

#[allow(clippy::too_many_arguments)]
fn attribute_pc<A: PcSamplingApi, S: DataSink + ?Sized>(
    api: &A,
    cubins: &CubinRegistry,
    sink: &S,
    configure_data: &ConfigureData,
    scope: ScopeId,
    pc: &PcSample,
    options: DrainOptions,
    summary: &mut DrainSummary,
) -> Result<()> {
    let line_info = cubins
        .with_cubin(pc.cubin_crc, |cubin| {
            cubin.resolve_line_info(api, pc.function_index, pc.pc_offset, &pc.function_name)
        })
        .transpose()
        .map_err(|e| e.for_context(configure_data.context_id))?;

    let function_name = line_info
        .as_ref()
        .map(|l| l.function_name.as_str())
        .unwrap_or(&pc.function_name);
    let function_scope = sink.add_scope(scope, function_name);

    let mut line_scope = None;
    match &line_info {
        Some(line) if line.has_source() && options.line_scopes => {
            let name = format!("{}:{}@{}", line.file_path, line.function_name, line.line_number);
            line_scope = Some(sink.add_scope(function_scope, &name));
        }
        Some(_) => {}
        None => warn!(
            "PC {:#x} in {} references unknown cubin {:#018x}",
            pc.pc_offset, pc.function_name, pc.cubin_crc
        ),
    }

    for stall in &pc.stall_reasons {
        let Some(kind) = configure_data
            .stall_reason_index_to_metric_kind
            .get(&stall.hardware_index)
            .copied()
        else {
            debug!(
                "Dropping {} samples with unmapped stall reason {}",
                stall.samples, stall.hardware_index
            );
            summary.dropped_stall_samples += stall.samples;
            metrics::STALL_SAMPLES_DROPPED.inc_by(stall.samples as f64);
            continue;
        };

        let stalled_samples = if configure_data
            .non_issue_stall_reason_indices
            .contains(&stall.hardware_index)
        {
            stall.samples
        } else {
            0
        };

        let metric = PcSamplingMetric::new(kind, stall.samples, stalled_samples);
        sink.add_metric(function_scope, metric);
        if let Some(line_scope) = line_scope {
            sink.add_metric(line_scope, metric);
        }
        metrics::STALL_SAMPLES_TOTAL
            .with_label_values(&[kind.name()])
            .inc_by(stall.samples as f64);
        summary.metrics_emitted += 1;
    }
    Ok(())
}
