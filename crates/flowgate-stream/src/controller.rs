use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flowgate_sync::Semaphore;
use flowgate_time::Duration;
use tracing::debug;

const SIGNIFICANT_CHANGE: f64 = 0.025;
const FORCED_EXPLORE_AFTER_STABLE_TICKS: u32 = 16;
const STABLE_AFTER_SMALL_TICKS: u32 = 5;

/// Direction a hill-climbing exploration is currently biased toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn flipped(self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
        }
    }

    fn step(self) -> i32 {
        match self {
            Direction::Up => 1,
            Direction::Down => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stable { small_tick_streak: u32 },
    Exploring { direction: Direction, small_tick_streak: u32 },
}

/// Configuration for [`DynamicController`].
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub refresh_time: Duration,
    pub warm_up: Duration,
    pub range_min: u32,
    pub range_max: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            refresh_time: Duration::from_secs(15),
            warm_up: Duration::from_secs(60),
            range_min: 1,
            range_max: 256,
        }
    }
}

/// Decides the next phase from the current one and this tick's
/// throughput-change verdict. Kept separate from [`DynamicController::run`]
/// so the state machine is testable without driving a real interval.
fn next_phase(phase: Phase, significant: bool, delta_ratio: f64) -> Phase {
    match phase {
        Phase::Stable { .. } if significant => Phase::Exploring {
            direction: Direction::Down,
            small_tick_streak: 0,
        },
        Phase::Stable { small_tick_streak } if small_tick_streak >= FORCED_EXPLORE_AFTER_STABLE_TICKS => {
            Phase::Exploring {
                direction: Direction::Down,
                small_tick_streak: 0,
            }
        }
        Phase::Stable { small_tick_streak } => Phase::Stable {
            small_tick_streak: small_tick_streak + 1,
        },
        Phase::Exploring {
            direction,
            small_tick_streak,
        } => {
            let direction = if delta_ratio < -SIGNIFICANT_CHANGE {
                direction.flipped()
            } else {
                direction
            };
            if significant {
                Phase::Exploring {
                    direction,
                    small_tick_streak: 0,
                }
            } else {
                let small_tick_streak = small_tick_streak + 1;
                if small_tick_streak >= STABLE_AFTER_SMALL_TICKS {
                    Phase::Stable { small_tick_streak: 0 }
                } else {
                    Phase::Exploring {
                        direction,
                        small_tick_streak,
                    }
                }
            }
        }
    }
}

/// A hill-climbing controller that nudges a [`Semaphore`]'s limit by
/// {-1, 0, +1} each `refresh_time`, based on a throughput counter the
/// caller increments once per completed item.
///
/// Spends the first `warm_up` recording a baseline throughput instead
/// of adjusting, then alternates between a `Stable` phase (small,
/// infrequent adjustments) and an `Exploring` phase (biased steps in
/// one direction, flipping direction if throughput drops).
pub struct DynamicController {
    sem: Arc<Semaphore>,
    throughput: Arc<AtomicU64>,
    config: ControllerConfig,
}

impl DynamicController {
    #[must_use]
    pub fn new(sem: Arc<Semaphore>, config: ControllerConfig) -> Self {
        Self {
            sem,
            throughput: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Counter callers increment once per item observed downstream.
    #[must_use]
    pub fn throughput_counter(&self) -> Arc<AtomicU64> {
        self.throughput.clone()
    }

    /// Runs the controller loop until cancelled. Intended to be spawned
    /// as a background task; it never returns on its own.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(
            self.config.refresh_time.as_millis().max(1) as u64,
        ));
        interval.tick().await; // first tick fires immediately; skip it

        let warm_up_ticks = (self.config.warm_up.as_micros() / self.config.refresh_time.as_micros().max(1)).max(1);
        let mut ticks_elapsed: i64 = 0;
        let mut last_throughput: f64 = 0.0;
        let mut phase = Phase::Stable { small_tick_streak: 0 };

        loop {
            interval.tick().await;
            let current = self.throughput.swap(0, Ordering::AcqRel) as f64;
            ticks_elapsed += 1;

            if ticks_elapsed <= warm_up_ticks {
                last_throughput = current;
                debug!(current, "dynamic controller: warm-up tick, no adjustment");
                continue;
            }

            let delta_ratio = if last_throughput > 0.0 {
                (current - last_throughput) / last_throughput
            } else {
                0.0
            };
            let significant = delta_ratio.abs() > SIGNIFICANT_CHANGE;

            phase = next_phase(phase, significant, delta_ratio);

            let mut adjustment = match phase {
                Phase::Stable { .. } => 0,
                Phase::Exploring { direction, .. } => direction.step(),
            };

            let limit = self.sem.limit() as i64;
            let mut proposed = limit + adjustment as i64;
            if proposed < self.config.range_min as i64 || proposed > self.config.range_max as i64 {
                if let Phase::Exploring {
                    direction,
                    small_tick_streak,
                } = phase
                {
                    let flipped = direction.flipped();
                    adjustment = flipped.step();
                    proposed = limit + adjustment as i64;
                    phase = Phase::Exploring {
                        direction: flipped,
                        small_tick_streak,
                    };
                }
                proposed = proposed.clamp(self.config.range_min as i64, self.config.range_max as i64);
            }

            if adjustment != 0 {
                let new_limit = proposed.clamp(1, u32::MAX as i64) as u32;
                if self.sem.resize(new_limit).is_ok() {
                    debug!(new_limit, ?phase, "dynamic controller: resized semaphore");
                }
            }

            crate::metrics::record_dynamic_stats_concurrency(self.sem.limit() as f64);
            last_throughput = current;
        }
    }
}
