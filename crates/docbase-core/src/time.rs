//! Monotonically non-decreasing millisecond timestamps.
//!
//! `createdAt`/`updatedAt` are stored as integer milliseconds since the
//! epoch (§3, §6). Two calls to [`now_millis`] in quick succession on the
//! same wall-clock millisecond must never go backwards relative to each
//! other, so a process-wide high-water mark is kept alongside the real
//! clock reading.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

static LAST_MILLIS: AtomicI64 = AtomicI64::new(0);

/// Returns the current time in milliseconds since the Unix epoch, guaranteed
/// to be greater than or equal to every prior value returned by this
/// function in this process.
pub fn now_millis() -> i64 {
    let wall_clock = Utc::now().timestamp_millis();
    loop {
        let last = LAST_MILLIS.load(Ordering::SeqCst);
        let candidate = if wall_clock > last { wall_clock } else { last + 1 };
        if LAST_MILLIS
            .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_millis_is_nondecreasing() {
        let mut previous = now_millis();
        for _ in 0..1000 {
            let current = now_millis();
            assert!(current >= previous, "{current} < {previous}");
            previous = current;
        }
    }

    #[test]
    fn now_millis_is_roughly_wall_clock() {
        let before = Utc::now().timestamp_millis();
        let value = now_millis();
        let after = Utc::now().timestamp_millis();
        assert!(value >= before - 5 && value <= after + 1000);
    }
}
