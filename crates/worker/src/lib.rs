//! Worker primitives shared by the analysis core.
//!
//! * [`spawn`]: task spawning tagged with a [`TaskClass`] for tracing.
//! * [`RetryScheduler`]: single-flight, debounced execution with a growing delay.
//! * [`ExclusionGate`]: non-blocking intent tokens that keep analysis runs and change
//!   flushes from overlapping.

mod backoff;
mod class;
mod gate;
mod spawn;

pub use backoff::{BackoffConfig, RetryScheduler};
pub use class::TaskClass;
pub use gate::{ExclusionGate, Intent, IntentGuard};
pub use spawn::spawn;
