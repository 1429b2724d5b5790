//! Streaming transform stages that bound how many items are processed
//! concurrently, either at a fixed limit or one a background controller
//! retunes via hill-climbing.

mod controller;
mod dynamic;
mod fixed;
mod metrics;

pub use controller::{ControllerConfig, DynamicController};
pub use dynamic::DynamicConcurrencyStream;
pub use fixed::FixedConcurrencyStream;
