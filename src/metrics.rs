use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, HistogramVec, register_counter, register_counter_vec,
    register_gauge, register_histogram_vec,
};

lazy_static! {
    pub static ref REQUEST_TOTAL: CounterVec = register_counter_vec!(
        "tersa_requests_total",
        "Total number of AI route requests",
        &["route"]
    )
    .unwrap();
    pub static ref REQUEST_REJECTED: CounterVec = register_counter_vec!(
        "tersa_requests_rejected_total",
        "Requests rejected before streaming started",
        &["route", "reason"]
    )
    .unwrap();
    pub static ref STREAM_DURATION: HistogramVec = register_histogram_vec!(
        "tersa_stream_duration_seconds",
        "Time from admission to the end of the model stream",
        &["route"]
    )
    .unwrap();
    pub static ref CREDITS_CHARGED: Counter =
        register_counter!("tersa_credits_charged_total", "Total cost forwarded to billing").unwrap();
    pub static ref BILLING_FAILURES: Counter = register_counter!(
        "tersa_billing_failures_total",
        "Usage events the credit sink refused"
    )
    .unwrap();
    pub static ref RATE_LIMIT_ENTRIES: Gauge = register_gauge!(
        "tersa_rate_limit_entries",
        "Live entries in the rate limit table after the last sweep"
    )
    .unwrap();
}
