//! Wall-clock timestamp helpers.
//!
//! Snapshot and push timestamps are **milliseconds since Unix epoch**.
//! Scheduling never uses these; collectors and the broadcaster run on
//! `tokio::time::Instant` so they can be driven by a paused test clock.

use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
fn since_epoch() -> std::time::Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    since_epoch().as_millis() as u64
}
