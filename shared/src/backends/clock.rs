use std::time::SystemTime;

/// Current wall-clock reading in milliseconds since the UNIX epoch. Clock
/// deltas and listener stamps are computed from these readings. A system
/// clock before the epoch reads as zero rather than failing.
pub fn millis_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
