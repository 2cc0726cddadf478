//! Retry schedules for pending-change tasks.
//!
//! Uses `backon` to describe the backoff curve. Jitter stays off so a task's
//! next run time is a pure function of its attempt count.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Default backoff for transient task failures.
///
/// - Min delay: 1s
/// - Max delay: 60s
/// - Factor: 2
/// - No jitter
pub fn task_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(60))
        .with_factor(2.0)
        .with_max_times(usize::MAX)
}

/// Delay before retry number `attempt` (1-based) on the default curve.
pub fn task_retry_delay(attempt: u32) -> Duration {
    let index = attempt.saturating_sub(1) as usize;
    task_backoff()
        .build()
        .nth(index)
        .unwrap_or(Duration::from_secs(60))
}
