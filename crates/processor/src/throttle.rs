//! Status throttler (C12): debounces `last_seen`/`status` writes to MS so
//! a chatty device doesn't generate a write per reading. Pure decision
//! function, kept separate from the `Store` call site the way
//! `hub::scheduler.rs` separates guard checks from the action they gate.

use time::OffsetDateTime;

pub const STATUS_THROTTLE_SECS: i64 = 300;

/// `last_seen = None` (never touched) always throttles through.
pub fn should_touch_last_seen(last_seen: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
    match last_seen {
        None => true,
        Some(last) => (now - last).whole_seconds() >= STATUS_THROTTLE_SECS,
    }
}
