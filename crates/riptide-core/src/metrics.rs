//! Metric recording.
//!
//! Everything goes through the `metrics` facade. Nothing is recorded
//! anywhere unless the embedding binary installs a recorder (the CLI
//! installs a prometheus exporter when `--metrics-port` is set).

use std::time::Duration;

use metrics::{counter, histogram};

use crate::compare::Status;
use crate::reader::notification::KeyEventStatus;

pub(crate) fn record_notification(status: KeyEventStatus) {
    counter!("riptide_notifications_total", "status" => status.as_str()).increment(1);
}

pub(crate) fn record_batch(items: usize, elapsed: Duration) {
    histogram!("riptide_batch_seconds").record(elapsed.as_secs_f64());
    histogram!("riptide_batch_items").record(items as f64);
}

pub(crate) fn record_pipeline_items(n: usize) {
    counter!("riptide_pipeline_items_total").increment(n as u64);
}

pub(crate) fn record_comparison(status: Status) {
    counter!("riptide_comparisons_total", "status" => status.as_str()).increment(1);
}

pub(crate) fn record_write_failures(n: usize) {
    counter!("riptide_write_failures_total").increment(n as u64);
}

pub(crate) fn record_stream_acks(n: usize) {
    counter!("riptide_stream_acks_total").increment(n as u64);
}
