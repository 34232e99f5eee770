//! Client metrics over the `metrics` facade.
//!
//! Exporter installation is the application's concern; without a
//! recorder these calls are no-ops.

/// Streaming client metrics. Names follow `riptide_client_*`.
pub struct ClientMetrics;

impl ClientMetrics {
    pub fn increment_frames_received() {
        metrics::counter!("riptide_client_frames_received_total").increment(1);
    }

    pub fn increment_buffer_acks() {
        metrics::counter!("riptide_client_buffer_acks_total").increment(1);
    }

    pub fn add_bytes_acked(bytes: u64) {
        metrics::counter!("riptide_client_bytes_acked_total").increment(bytes);
    }

    pub fn increment_configs_published() {
        metrics::counter!("riptide_client_configs_published_total").increment(1);
    }

    pub fn increment_config_parse_failures() {
        metrics::counter!("riptide_client_config_parse_failures_total").increment(1);
    }

    pub fn increment_streams_opened() {
        metrics::counter!("riptide_client_streams_opened_total").increment(1);
    }

    pub fn increment_rollbacks() {
        metrics::counter!("riptide_client_rollbacks_total").increment(1);
    }

    pub fn increment_stream_failures() {
        metrics::counter!("riptide_client_stream_failures_total").increment(1);
    }

    pub fn increment_reconnect_attempts(target: &str) {
        metrics::counter!(
            "riptide_client_reconnect_attempts_total",
            "target" => target.to_string()
        )
        .increment(1);
    }

    pub fn set_active_connections(count: u64) {
        metrics::gauge!("riptide_client_active_connections").set(count as f64);
    }

    pub fn set_config_revision(rev: i64) {
        metrics::gauge!("riptide_client_config_revision").set(rev as f64);
    }
}
