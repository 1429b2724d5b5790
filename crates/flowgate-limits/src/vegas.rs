use std::sync::{Mutex as StdMutex, OnceLock};

use flowgate_time::Duration;
use rand::Rng;
use tokio::sync::watch;

/// Configuration for [`Vegas`].
#[derive(Debug, Clone, Copy)]
pub struct VegasConfig {
    pub initial_limit: u32,
    pub max_limit: u32,
    pub smoothing: f64,
    pub probe_multiplier: f64,
}

impl Default for VegasConfig {
    fn default() -> Self {
        Self {
            initial_limit: 20,
            max_limit: 512,
            smoothing: 1.0,
            probe_multiplier: 30.0,
        }
    }
}

struct State {
    estimated_limit: f64,
    rtt_no_load: Duration,
    probe_count: u32,
    probe_jitter: f64,
    last_published: u32,
}

/// A TCP-Vegas-style adaptive concurrency limit.
///
/// Fed round-trip time, in-flight count, and a drop flag via
/// [`Vegas::update`]; publishes the resulting integer limit on
/// [`Vegas::changed`] whenever it differs from the last published value.
pub struct Vegas {
    config: VegasConfig,
    state: StdMutex<State>,
    tx: watch::Sender<u32>,
}

fn log10_table() -> &'static [f64; 1000] {
    static TABLE: OnceLock<[f64; 1000]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut t = [0.0f64; 1000];
        for (i, slot) in t.iter_mut().enumerate() {
            *slot = (i.max(1) as f64).log10();
        }
        t
    })
}

/// `log10`, floored at an argument of 1 (never negative/infinite), with
/// the first 1000 integer inputs memoised.
fn log10(e: f64) -> f64 {
    let floored = e.max(1.0);
    if floored < 1000.0 {
        log10_table()[floored as usize]
    } else {
        floored.log10()
    }
}

fn alpha(e: f64) -> f64 {
    3.0 * log10(e)
}

fn beta(e: f64) -> f64 {
    6.0 * log10(e)
}

fn threshold(e: f64) -> f64 {
    log10(e)
}

fn increase(e: f64) -> f64 {
    e + log10(e)
}

fn decrease(e: f64) -> f64 {
    e - log10(e)
}

impl Vegas {
    /// Creates a new Vegas controller seeded at `config.initial_limit`.
    #[must_use]
    pub fn new(config: VegasConfig) -> Self {
        let initial = config.initial_limit.clamp(1, config.max_limit);
        let (tx, _rx) = watch::channel(initial);
        Self {
            config,
            state: StdMutex::new(State {
                estimated_limit: initial as f64,
                rtt_no_load: Duration::ZERO,
                probe_count: 0,
                probe_jitter: 1.0,
                last_published: initial,
            }),
            tx,
        }
    }

    /// Current integer limit.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.state.lock().unwrap().last_published
    }

    /// Subscribes to limit-changed notifications.
    #[must_use]
    pub fn changed(&self) -> watch::Receiver<u32> {
        self.tx.subscribe()
    }

    /// Feeds one observation into the controller, returning the
    /// (possibly unchanged) integer limit.
    ///
    /// Follows spec.md's six steps precisely: periodic re-baselining
    /// driven by `probe_count`, RTT no-load tracking, queue-size
    /// estimation, the drop/utilisation/threshold decision tree, clamp,
    /// then smoothing.
    pub fn update(&self, rtt: Duration, in_flight: u32, dropped: bool) -> u32 {
        let mut st = self.state.lock().unwrap();

        st.probe_count += 1;
        let probe_ceiling = st.estimated_limit * st.probe_jitter * self.config.probe_multiplier;
        if probe_ceiling <= st.probe_count as f64 {
            st.probe_count = 0;
            st.probe_jitter = rand::rng().random_range(0.5..=1.0);
            st.rtt_no_load = rtt;
            return self.publish(&mut st);
        }

        if st.rtt_no_load.is_zero() || rtt < st.rtt_no_load {
            st.rtt_no_load = rtt;
            return self.publish(&mut st);
        }

        let e = st.estimated_limit;
        let queue_size = (e * (1.0 - st.rtt_no_load.as_secs_f64() / rtt.as_secs_f64())).ceil();

        let candidate = if dropped {
            decrease(e)
        } else if 2.0 * (in_flight as f64) < e {
            e
        } else {
            let a = alpha(e);
            let b = beta(e);
            let t = threshold(e);
            if queue_size <= t {
                e + b
            } else if queue_size < a {
                increase(e)
            } else if queue_size > b {
                decrease(e)
            } else {
                e
            }
        };

        let clamped = candidate.clamp(1.0, self.config.max_limit as f64);
        let smoothed = ((1.0 - self.config.smoothing) * e + self.config.smoothing * clamped).floor();
        st.estimated_limit = smoothed.clamp(1.0, self.config.max_limit as f64);

        self.publish(&mut st)
    }

    fn publish(&self, st: &mut State) -> u32 {
        let limit = (st.estimated_limit.round() as i64).clamp(1, self.config.max_limit as i64) as u32;
        if limit != st.last_published {
            st.last_published = limit;
            let _ = self.tx.send(limit);
        }
        limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_hold_for_streams_of_drops_and_successes() {
        let vegas = Vegas::new(VegasConfig {
            initial_limit: 2,
            max_limit: 12,
            ..Default::default()
        });

        let mut saw_increase = false;
        let mut saw_decrease = false;
        let mut last = vegas.limit();

        for round in 0..250 {
            let dropped = round % 5 < 3;
            let in_flight = if dropped { 12 } else { 6 };
            let rtt = if dropped {
                Duration::from_millis(200)
            } else {
                Duration::from_millis(20)
            };
            let next = vegas.update(rtt, in_flight, dropped);
            assert!((1..=12).contains(&next), "limit {next} left [1,12]");
            if next > last {
                saw_increase = true;
            } else if next < last {
                saw_decrease = true;
            }
            last = next;
        }

        assert!(saw_increase, "expected at least one increase over 250 rounds");
        assert!(saw_decrease, "expected at least one decrease over 250 rounds");
    }

    #[test]
    fn log10_matches_std_outside_memo_table() {
        assert!((log10(5000.0) - 5000f64.log10()).abs() < 1e-9);
    }

    proptest::proptest! {
        #[test]
        fn estimated_limit_always_in_range(rtt_ms in 1i64..500, in_flight in 0u32..64, dropped: bool) {
            let vegas = Vegas::new(VegasConfig { initial_limit: 5, max_limit: 64, ..Default::default() });
            let limit = vegas.update(Duration::from_millis(rtt_ms), in_flight, dropped);
            proptest::prop_assert!((1..=64).contains(&limit));
        }
    }
}
