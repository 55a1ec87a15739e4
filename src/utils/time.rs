use chrono::Utc;

/// Current wall clock as integer milliseconds since the Unix epoch.
/// Every timestamp inside the engine is in this unit.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub const MINUTE_MS: i64 = 60_000;
pub const HOUR_MS: i64 = 3_600_000;
pub const DAY_MS: i64 = 86_400_000;

/// UTC day ordinal, used for daily account-state resets.
pub fn day_ordinal(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(DAY_MS)
}
