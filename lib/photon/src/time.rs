use std::sync::OnceLock;
use std::time::{Instant, SystemTime};

/// Microsecond timestamp on the process-local monotonic clock.
pub type Usec = i64;

/// Sentinel for "no deadline scheduled".
pub const NEVER: Usec = i64::MAX;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Returns the microseconds elapsed since the process-local epoch.
/// The first value returned is always > 0, so 0 can be used as "unset".
#[inline]
pub fn now_usec() -> Usec {
    epoch().elapsed().as_micros() as Usec + 1
}

/// Returns the current unix timestamp (seconds elapsed since 1970-01-01)
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Closed timelike curve, reality compromised")
        .as_secs()
}
