use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, Encoder, IntCounter, IntCounterVec,
    TextEncoder,
};

lazy_static! {
    pub static ref HTTP_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "mediarelay_http_requests_total",
        "Requests served, labelled by route prefix",
        &["route"]
    )
    .unwrap();
    pub static ref BYTES_STREAMED: IntCounter = register_int_counter!(
        "mediarelay_local_bytes_streamed_total",
        "Bytes of local media handed to range responses"
    )
    .unwrap();
    pub static ref UPSTREAM_FAILURES: IntCounter = register_int_counter!(
        "mediarelay_upstream_failures_total",
        "Provider API / proxied upstream failures"
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
