use memory_stats::memory_stats;

/// Logs the resident memory of the process under `label`.
pub fn log_memory_usage(label: &str) {
    if let Some(usage) = memory_stats() {
        tracing::info!(
            "<{}> current memory usage: {:.3} GB",
            label,
            usage.physical_mem as f64 / 1_000_000_000.0
        );
    } else {
        tracing::debug!("<{}> memory usage unavailable on this platform", label);
    }
}
