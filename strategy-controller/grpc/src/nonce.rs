use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

static NONCE_COUNTER: AtomicU64 = AtomicU64::new(0);
static VERSION: AtomicU64 = AtomicU64::new(0);

/// Generates an opaque token that is unique within the process.
pub(crate) fn generate() -> String {
    let count = NONCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:x}-{:x}", now_micros(), count)
}

/// Returns a version that is strictly greater than every version returned
/// before it and is at least the current wall-clock time in microseconds, so
/// that versions keep increasing across restarts.
pub(crate) fn next_version() -> u64 {
    let now = now_micros();
    let prev = VERSION
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
            Some(now.max(prev + 1))
        })
        .unwrap_or_else(|prev| prev);
    now.max(prev + 1)
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
