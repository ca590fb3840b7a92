//! Host "hold-awake" power-assertion hook (spec §6).
//!
//! No-op on this binding; a host embedding substitutes a real sleep-
//! prevention assertion here. Reference-counted per spec §5 ("at most one
//! active assertion per process"), mirroring the `fileops::start_scoped_access`
//! / `stop_scoped_access` no-op stub pattern for host-mediated permissions.

use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

static ACTIVE_ASSERTIONS: AtomicUsize = AtomicUsize::new(0);

/// Request that the host prevent power-save (spec §6 `hold_awake(begin, reason, timeout?)`).
/// Safe to call from more than one concurrent run; only the first caller
/// logs the host-facing request, later callers just bump the refcount.
pub fn begin(reason: &str) {
    let count = ACTIVE_ASSERTIONS.fetch_add(1, Ordering::SeqCst) + 1;
    if count == 1 {
        info!("requesting hold-awake: {}", reason);
    } else {
        debug!("hold-awake already active, refcount now {}", count);
    }
}

/// Release one reference (spec §6 `hold_awake(end)`). Releases the host
/// assertion once the refcount reaches zero.
pub fn end() {
    let prev = ACTIVE_ASSERTIONS.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
        if c == 0 {
            None
        } else {
            Some(c - 1)
        }
    });
    match prev {
        Ok(1) => info!("releasing hold-awake"),
        Ok(_) => {}
        Err(_) => warn!("hold-awake end() called with no active assertion"),
    }
}
