//! Thin wrappers over the `metrics` crate macros, so the streaming
//! stages never call `metrics::{counter,histogram,gauge}!` directly and
//! the metric names stay in one place.

use flowgate_time::Duration;

pub(crate) fn record_dynamic_backpressure() {
    metrics::counter!("dynamic_backpressure").increment(1);
}

pub(crate) fn record_dynamic_stats_concurrency(limit: f64) {
    metrics::gauge!("dynamic_stats", "stat" => "concurrency").set(limit);
}

pub(crate) fn record_dynamic_transform(elapsed: Duration) {
    metrics::histogram!("dynamic_transform").record(elapsed.as_secs_f64());
}

pub(crate) fn record_dynamic_read(elapsed: Duration) {
    metrics::histogram!("dynamic_read").record(elapsed.as_secs_f64());
}
