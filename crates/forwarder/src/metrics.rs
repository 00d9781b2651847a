//! Prometheus metrics for the forwarding engines
//!
//! Labelled per instance (`adsb`, `ais`) and, for delivery, per endpoint id.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

const LABEL_INSTANCE: &str = "instance";
const LABEL_ENDPOINT: &str = "endpoint";
const LABEL_OUTCOME: &str = "outcome";

static RECORDS_READ: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "marlink_records_read_total",
        "Records read from the upstream source",
        &[LABEL_INSTANCE]
    )
    .expect("Failed to register records_read_total metric")
});

static RECORDS_FILTERED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "marlink_records_filtered_total",
        "Records dropped by the filter policy",
        &[LABEL_INSTANCE]
    )
    .expect("Failed to register records_filtered_total metric")
});

static DECODE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "marlink_decode_errors_total",
        "Upstream lines dropped because they could not be decoded",
        &[LABEL_INSTANCE]
    )
    .expect("Failed to register decode_errors_total metric")
});

static SOURCE_SESSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "marlink_source_sessions_total",
        "Successful upstream connects",
        &[LABEL_INSTANCE]
    )
    .expect("Failed to register source_sessions_total metric")
});

static SOURCE_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "marlink_source_connected",
        "Upstream connection status (1=connected, 0=disconnected)",
        &[LABEL_INSTANCE]
    )
    .expect("Failed to register source_connected metric")
});

static SENDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "marlink_endpoint_sends_total",
        "Record deliveries per endpoint by outcome (ok, failed)",
        &[LABEL_INSTANCE, LABEL_ENDPOINT, LABEL_OUTCOME]
    )
    .expect("Failed to register endpoint_sends_total metric")
});

static QUEUE_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "marlink_endpoint_queue_dropped_total",
        "Records dropped because the endpoint queue was full",
        &[LABEL_INSTANCE, LABEL_ENDPOINT]
    )
    .expect("Failed to register endpoint_queue_dropped_total metric")
});

static ENDPOINT_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "marlink_endpoint_connected",
        "Result of the last delivery per endpoint (1=ok, 0=failing)",
        &[LABEL_INSTANCE, LABEL_ENDPOINT]
    )
    .expect("Failed to register endpoint_connected metric")
});

/// Handle for recording metrics of one engine instance
#[derive(Clone)]
pub struct EngineMetrics {
    instance: String,
}

impl EngineMetrics {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn inc_read(&self) {
        RECORDS_READ.with_label_values(&[&self.instance]).inc();
    }

    pub fn inc_filtered(&self) {
        RECORDS_FILTERED.with_label_values(&[&self.instance]).inc();
    }

    pub fn inc_decode_error(&self) {
        DECODE_ERRORS.with_label_values(&[&self.instance]).inc();
    }

    pub fn set_source_connected(&self, connected: bool) {
        if connected {
            SOURCE_SESSIONS.with_label_values(&[&self.instance]).inc();
        }
        SOURCE_CONNECTED
            .with_label_values(&[&self.instance])
            .set(i64::from(connected));
    }

    pub fn for_endpoint(&self, endpoint_id: &str) -> EndpointMetrics {
        EndpointMetrics {
            instance: self.instance.clone(),
            endpoint: endpoint_id.to_string(),
        }
    }
}

/// Handle for recording metrics of one endpoint worker
#[derive(Clone)]
pub struct EndpointMetrics {
    instance: String,
    endpoint: String,
}

impl EndpointMetrics {
    pub fn record_sent(&self) {
        SENDS
            .with_label_values(&[&self.instance, &self.endpoint, "ok"])
            .inc();
        ENDPOINT_CONNECTED
            .with_label_values(&[&self.instance, &self.endpoint])
            .set(1);
    }

    pub fn record_failed(&self) {
        SENDS
            .with_label_values(&[&self.instance, &self.endpoint, "failed"])
            .inc();
        ENDPOINT_CONNECTED
            .with_label_values(&[&self.instance, &self.endpoint])
            .set(0);
    }

    pub fn inc_queue_dropped(&self) {
        QUEUE_DROPPED
            .with_label_values(&[&self.instance, &self.endpoint])
            .inc();
    }

    #[cfg(test)]
    fn sent_count(&self) -> u64 {
        SENDS
            .with_label_values(&[&self.instance, &self.endpoint, "ok"])
            .get()
    }
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
