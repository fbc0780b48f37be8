use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

pub static INVOICES_ISSUED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "einvoice_invoices_issued_total",
        "Invoices signed and appended to the hash chain",
        &["kind"]
    )
    .expect("metric can be registered")
});

/// Outcome label: `accepted`, `network_error`, `rejected`.
pub static SUBMISSIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "einvoice_submissions_total",
        "Submissions to the tax authority by operation and outcome",
        &["operation", "outcome"]
    )
    .expect("metric can be registered")
});

pub static SUBMISSION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "einvoice_submission_duration_seconds",
        "Latency of calls to the tax authority",
        &["operation"]
    )
    .expect("metric can be registered")
});

pub static QUEUE_DRAINS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("einvoice_queue_drains_total", "Offline queue drain runs")
        .expect("metric can be registered")
});

pub static QUEUE_PENDING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("einvoice_queue_pending", "Entries waiting in the offline queue")
        .expect("metric can be registered")
});

pub static QUEUE_OVERDUE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "einvoice_queue_overdue",
        "Entries past the submission deadline at the last check"
    )
    .expect("metric can be registered")
});

pub fn record_submission(operation: &str, outcome: &str) {
    SUBMISSIONS.with_label_values(&[operation, outcome]).inc();
}
