//! Retry utilities: backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Exponential backoff with jitter between `min` and `max`.
///
/// `max_times` bounds the number of retries; `None` retries forever.
pub fn exponential_backoff(
    min: Duration,
    max: Duration,
    max_times: Option<usize>,
) -> ExponentialBuilder {
    let builder = ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max)
        .with_jitter();
    match max_times {
        Some(times) => builder.with_max_times(times),
        None => builder.without_max_times(),
    }
}
