//! Time utilities for age-based decisions

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Age of a timestamp relative to now
///
/// Returns Duration::ZERO if the timestamp is in the future.
pub fn age(since: DateTime<Utc>) -> Duration {
    (Utc::now() - since).to_std().unwrap_or(Duration::ZERO)
}

/// Whether `since` lies more than `max_age` in the past
pub fn is_older_than(since: DateTime<Utc>, max_age: Duration) -> bool {
    age(since) > max_age
}
