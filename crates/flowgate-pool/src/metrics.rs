//! Thin wrappers over the `metrics` crate macros, so the rest of this
//! crate never calls `metrics::{counter,histogram,gauge}!` directly and
//! the metric names stay in one place.

use flowgate_time::Duration;

pub(crate) fn record_pool_wait(pool: &str, wait: Duration) {
    metrics::histogram!("pool_wait_time", "pool" => pool.to_string()).record(wait.as_secs_f64());
}

pub(crate) fn record_pool_size(pool: &str, size: u32) {
    metrics::gauge!("pool_size", "pool" => pool.to_string()).set(size as f64);
}

pub(crate) fn record_pool_retrieval_failure(pool: &str) {
    metrics::counter!("pool_retrieval_failure", "pool" => pool.to_string()).increment(1);
}
