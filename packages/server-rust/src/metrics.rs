//! Metric names and recording helpers.
//!
//! Only the `metrics` facade is used here; installing a recorder/exporter is
//! left to the embedding process. Without a recorder every call is a no-op.
//!
//! - `kv_pool_acquire_timeouts_total` - acquires that gave up waiting
//! - `kv_pool_acquire_wait_seconds` - time spent waiting for a connection
//! - `kv_admission_total` - admission decisions (label: `outcome`)
//! - `kv_admission_buckets` - live token buckets
//! - `kv_requests_total` - record operations (labels: `op`, `outcome`)

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};

static REGISTERED: OnceLock<()> = OnceLock::new();

/// Registers metric descriptions. Idempotent.
pub fn register() {
    REGISTERED.get_or_init(|| {
        describe_counter!(
            "kv_pool_acquire_timeouts_total",
            "Connection acquisitions that timed out"
        );
        describe_histogram!(
            "kv_pool_acquire_wait_seconds",
            Unit::Seconds,
            "Wait for an idle pooled connection"
        );
        describe_counter!("kv_admission_total", "Admission control decisions");
        describe_gauge!("kv_admission_buckets", "Token buckets currently tracked");
        describe_counter!("kv_requests_total", "Record operations by outcome");
    });
}

pub(crate) fn pool_acquire_timeout() {
    counter!("kv_pool_acquire_timeouts_total").increment(1);
}

pub(crate) fn pool_acquire_wait(waited: Duration) {
    histogram!("kv_pool_acquire_wait_seconds").record(waited.as_secs_f64());
}

pub(crate) fn admission(admitted: bool) {
    let outcome = if admitted { "admitted" } else { "rejected" };
    counter!("kv_admission_total", "outcome" => outcome).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn admission_buckets(count: usize) {
    gauge!("kv_admission_buckets").set(count as f64);
}

pub(crate) fn request(op: &'static str, outcome: &'static str) {
    counter!("kv_requests_total", "op" => op, "outcome" => outcome).increment(1);
}
