// src/utils/time.rs
//! Wall-clock helpers. All persisted timestamps are milliseconds since epoch.

use crate::utils::errors::{EngineError, Result};
use chrono::{Duration, Utc};

/// Current time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Millisecond timestamp `days` days before now. Fails when the offset
/// does not fit chrono's range.
pub fn days_ago_ms(days: i64) -> Result<i64> {
    Duration::try_days(days)
        .and_then(|offset| Utc::now().checked_sub_signed(offset))
        .map(|cutoff| cutoff.timestamp_millis())
        .ok_or_else(|| EngineError::Config(format!("Retention of {} days is out of range", days)))
}
