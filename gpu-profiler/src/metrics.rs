//! Prometheus metrics for the PC sampling backend

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

// ── Sample attribution ───────────────────────────────────────────────────────

pub static PC_SAMPLES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!("aperture_pc_samples_total", "PC records drained from the hardware")
        .unwrap()
});

pub static STALL_SAMPLES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "aperture_pc_stall_samples_total",
        "Samples attributed per stall category",
        &["kind"]
    )
    .unwrap()
});

pub static STALL_SAMPLES_DROPPED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "aperture_pc_stall_samples_dropped_total",
        "Samples whose stall reason has no metric mapping"
    )
    .unwrap()
});

// ── Source correlation ───────────────────────────────────────────────────────

pub static SOURCE_CORRELATIONS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "aperture_pc_source_correlations_total",
        "SASS-to-source correlation queries issued"
    )
    .unwrap()
});

pub static LINE_INFO_CACHE_HITS: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "aperture_pc_line_info_cache_hits_total",
        "Line info lookups answered from the cubin cache"
    )
    .unwrap()
});

pub static CUBINS_LOADED: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("aperture_pc_cubins_loaded", "Cubins currently registered").unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
