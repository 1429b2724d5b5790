//! A TCP-Vegas-style adaptive concurrency limit algorithm and a limiter
//! that binds it to a resizable semaphore.

mod limiter;
mod vegas;

pub use limiter::{LimitedOperation, Limiter};
pub use vegas::{Vegas, VegasConfig};

use flowgate_time::Duration;
use tokio::sync::watch;

/// A concurrency limit that adjusts itself from observed round-trip time,
/// in-flight count, and drop outcomes.
///
/// [`Vegas`] is the only implementation in this crate, but `Limiter` is
/// written against this trait rather than against `Vegas` directly, so a
/// different algorithm can be dropped in without touching `Limiter`.
pub trait LimitAlgorithm: Send + Sync {
    /// Current integer limit.
    fn limit(&self) -> u32;

    /// Feeds one observation in, returning the (possibly unchanged) limit.
    fn update(&self, rtt: Duration, in_flight: u32, dropped: bool) -> u32;

    /// Subscribes to limit-changed notifications.
    fn changed(&self) -> watch::Receiver<u32>;
}

impl LimitAlgorithm for Vegas {
    fn limit(&self) -> u32 {
        Vegas::limit(self)
    }

    fn update(&self, rtt: Duration, in_flight: u32, dropped: bool) -> u32 {
        Vegas::update(self, rtt, in_flight, dropped)
    }

    fn changed(&self) -> watch::Receiver<u32> {
        Vegas::changed(self)
    }
}
