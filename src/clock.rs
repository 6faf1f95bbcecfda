//! Low-resolution unix clock for hot lookup paths.
//!
//! ACL lookups check item expiry on every call. Reading a cached second
//! counter is much cheaper than a syscall, and one second of precision is
//! plenty for TTLs expressed in seconds.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

use crate::signal::ShutdownToken;

/// Cached unix time in seconds; 0 until the ticker has run once.
static CACHED_UNIX_TIME: AtomicI64 = AtomicI64::new(0);

/// Current unix time in seconds, from the cache when the ticker is running.
#[inline]
pub fn unix_time() -> i64 {
    let cached = CACHED_UNIX_TIME.load(Ordering::Relaxed);
    if cached > 0 {
        cached
    } else {
        system_unix_time()
    }
}

/// Unix time straight from the system clock.
pub fn system_unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Refresh the cache every second until shutdown.
pub fn spawn_ticker(shutdown: ShutdownToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    CACHED_UNIX_TIME.store(system_unix_time(), Ordering::Relaxed);
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
