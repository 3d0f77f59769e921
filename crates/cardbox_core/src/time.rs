//! Wall-clock helpers.
//!
//! The protocol stamps `mod`/`ls` in milliseconds and reports `ts` in
//! seconds; both come from the system clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in whole seconds.
pub fn now_secs() -> i64 {
    now_duration().as_secs() as i64
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    now_duration().as_millis() as i64
}

fn now_duration() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}
