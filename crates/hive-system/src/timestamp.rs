//! Monotonic timestamps.
//!
//! Workers cache one timestamp per loop iteration; everything that needs
//! "now" inside an iteration reads the cached value.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process.
#[inline]
pub fn now_nanos() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}
