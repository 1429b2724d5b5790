//! A bounded MPMC circular buffer and a four-tier priority queue with
//! per-task timeouts and priority escalation.

mod buffer;
mod mlpq;

pub use buffer::CircularBuffer;
pub use mlpq::{MlpqError, MultiLevelQueue, Priority, QueueOptions};
