//! Common patterns shared by the driver components
//!
//! Currently this is the bounded retry helper used by machine creation for
//! IP acquisition and in-guest rename.

pub mod retry;

pub use retry::{BackoffStrategy, BoundedRetry, Clock, RetryConfig, TokioClock};
