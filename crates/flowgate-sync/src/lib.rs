//! Fair, cancellable synchronization primitives: [`Signal`], [`Mutex`] and
//! [`Semaphore`].
//!
//! All three share one shape: a small synchronous critical section (a
//! `std::sync::Mutex` guarding a little bit of state plus an ordered queue
//! of waiters) and an async wait path built on a per-waiter
//! `tokio::sync::oneshot` channel raced against `tokio::time::timeout`.
//! A timed-out waiter always removes its own entry from the queue before
//! returning, so a late notification can never wake something that has
//! already given up (see the module tests for the regression this guards
//! against).

mod mutex;
mod semaphore;
mod signal;

pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{Semaphore, SemaphorePermit};
pub use signal::Signal;

use thiserror::Error;

/// Errors shared by the primitives in this crate.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A timed wait expired before the primitive became available.
    #[error("operation timed out")]
    Timeout,
    /// An argument was out of its required range (e.g. `resize(0)`).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

pub(crate) type WaiterId = u64;
