use tracing_subscriber::EnvFilter;

// Metric names emitted across the crate
pub const MESSAGES_RECEIVED: &str = "mdfeed_messages_received_total";
pub const MESSAGES_DROPPED: &str = "mdfeed_messages_dropped_total";
pub const RECONNECTS: &str = "mdfeed_reconnects_total";
pub const CACHE_HITS: &str = "mdfeed_cache_hits_total";
pub const CACHE_MISSES: &str = "mdfeed_cache_misses_total";
pub const CACHE_EVICTIONS: &str = "mdfeed_cache_evictions_total";
pub const FALLBACK_ACTIVE: &str = "mdfeed_fallback_active";
pub const EVENTS_APPENDED: &str = "mdfeed_events_appended_total";
pub const RECORDS_COMPRESSED: &str = "mdfeed_records_compressed_total";
pub const PIPELINE_LATENCY: &str = "mdfeed_pipeline_latency_us";

pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    // try_init: a host application may already own the global subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();
}

fn describe_metrics() {
    metrics::describe_counter!(MESSAGES_RECEIVED, "Frames received from the streaming provider");
    metrics::describe_counter!(MESSAGES_DROPPED, "Events discarded by drop-oldest queues");
    metrics::describe_counter!(RECONNECTS, "Reconnect attempts scheduled");
    metrics::describe_counter!(CACHE_HITS, "Cache lookups served from memory or disk");
    metrics::describe_counter!(CACHE_MISSES, "Cache lookups that found nothing live");
    metrics::describe_counter!(CACHE_EVICTIONS, "Entries evicted by the LRU bounds");
    metrics::describe_gauge!(FALLBACK_ACTIVE, "1 while REST fallback polling is active");
    metrics::describe_counter!(EVENTS_APPENDED, "Audit events appended to the event store");
    metrics::describe_counter!(RECORDS_COMPRESSED, "Aged rows compressed by the compression job");
    metrics::describe_histogram!(PIPELINE_LATENCY, "Receive to broadcast latency of merged updates");
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(port: u16) -> anyhow::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()?;
    describe_metrics();
    metrics::gauge!("mdfeed_up").set(1.0);
    tracing::info!(port, "prometheus exporter listening");
    Ok(())
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(_port: u16) -> anyhow::Result<()> {
    describe_metrics();
    Ok(())
}
