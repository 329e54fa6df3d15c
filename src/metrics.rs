//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

pub fn record_load_started(slug: &str) {
    metrics::counter!("slm_manager_loads_started_total",
        "model" => slug.to_string()
    )
    .increment(1);
}

pub fn record_load_succeeded(slug: &str, variant: &str) {
    metrics::counter!("slm_manager_loads_succeeded_total",
        "model" => slug.to_string(),
        "engine" => variant.to_string()
    )
    .increment(1);
}

pub fn record_load_failed(slug: &str) {
    metrics::counter!("slm_manager_loads_failed_total",
        "model" => slug.to_string()
    )
    .increment(1);
}

pub fn record_eviction(slug: &str) {
    metrics::counter!("slm_manager_evictions_total",
        "model" => slug.to_string()
    )
    .increment(1);
}

/// A load proceeded without enough free budget
pub fn record_overcommit() {
    metrics::counter!("slm_manager_budget_overcommits_total").increment(1);
}

pub fn update_loaded_ram(ram_mb: u64) {
    metrics::gauge!("slm_manager_loaded_ram_mb").set(ram_mb as f64);
}

pub fn update_ram_budget(ram_mb: u64) {
    metrics::gauge!("slm_manager_ram_budget_mb").set(ram_mb as f64);
}

pub fn record_route(intent: &str, target: &str) {
    metrics::counter!("slm_manager_routes_total",
        "intent" => intent.to_string(),
        "target" => target.to_string()
    )
    .increment(1);
}

pub fn update_vector_store_entries(store: &str, count: usize) {
    metrics::gauge!("slm_manager_vector_store_entries",
        "store" => store.to_string()
    )
    .set(count as f64);
}
