//! Prometheus metrics for the tailing engine

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, IntCounterVec, IntGauge, Encoder, TextEncoder,
};

const LABEL_BACKEND: &str = "backend";
const LABEL_FORMAT: &str = "format";
const LABEL_REASON: &str = "reason";

/// Backends currently running (one per source with interest)
static BACKENDS_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tailgate_backends_running",
        "Number of sources with a running backend"
    )
    .expect("Failed to register backends_running metric")
});

static BACKEND_STARTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tailgate_backend_starts_total",
        "Backends started",
        &[LABEL_BACKEND]
    )
    .expect("Failed to register backend_starts metric")
});

static BACKEND_STOPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tailgate_backend_stops_total",
        "Backends stopped",
        &[LABEL_BACKEND]
    )
    .expect("Failed to register backend_stops metric")
});

static BACKEND_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tailgate_backend_failures_total",
        "Backend spawn, watch or stop failures",
        &[LABEL_BACKEND, LABEL_REASON]
    )
    .expect("Failed to register backend_failures metric")
});

static CHUNKS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tailgate_chunks_total",
        "Raw chunks produced by backends",
        &[LABEL_BACKEND]
    )
    .expect("Failed to register chunks_total metric")
});

static DELIVERIES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tailgate_deliveries_total",
        "Transformed chunks queued to connections",
        &[LABEL_FORMAT]
    )
    .expect("Failed to register deliveries_total metric")
});

static DELIVERIES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tailgate_deliveries_dropped_total",
        "Deliveries dropped because a connection's queue was full",
        &[LABEL_FORMAT]
    )
    .expect("Failed to register deliveries_dropped metric")
});

static CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("tailgate_connections", "Live viewer connections")
        .expect("Failed to register connections metric")
});

static REJECTED_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tailgate_rejected_requests_total",
        "Subscribe requests that were ignored",
        &[LABEL_REASON]
    )
    .expect("Failed to register rejected_requests metric")
});

pub fn backend_started(backend: &str) {
    BACKENDS_RUNNING.inc();
    BACKEND_STARTS.with_label_values(&[backend]).inc();
}

pub fn backend_stopped(backend: &str) {
    BACKENDS_RUNNING.dec();
    BACKEND_STOPS.with_label_values(&[backend]).inc();
}

pub fn backend_failed(backend: &str, reason: &str) {
    BACKEND_FAILURES.with_label_values(&[backend, reason]).inc();
}

pub fn chunk_produced(backend: &str) {
    CHUNKS_TOTAL.with_label_values(&[backend]).inc();
}

pub fn delivered(format: &str, count: usize) {
    DELIVERIES_TOTAL
        .with_label_values(&[format])
        .inc_by(count as u64);
}

pub fn dropped(format: &str) {
    DELIVERIES_DROPPED.with_label_values(&[format]).inc();
}

pub fn connection_opened() {
    CONNECTIONS.inc();
}

pub fn connection_closed() {
    CONNECTIONS.dec();
}

pub fn request_rejected(reason: &str) {
    REJECTED_REQUESTS.with_label_values(&[reason]).inc();
}

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| {
        prometheus::Error::Msg(format!("Failed to encode metrics as UTF-8: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metrics() {
        backend_started("dev");
        backend_stopped("dev");
        backend_failed("tail", "spawn");
        request_rejected("malformed");
        let output = encode_metrics().unwrap();
        assert!(output.contains("tailgate_backend_stops_total{backend=\"dev\"}"));
        assert!(output.contains("tailgate_backend_failures_total"));
        assert!(output.contains("tailgate_rejected_requests_total"));
    }
}
