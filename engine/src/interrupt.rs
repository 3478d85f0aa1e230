//! Process-wide cooperative interrupt flag.
//!
//! Long-running operations (the reverse-map build, the page verifier, the
//! memory diff) poll this at their loop heads; cancellation never tears a
//! data structure mid-update. Init-once, cleared by the next operation.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Requests cooperative cancellation of the running operation.
pub fn interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

pub fn clear() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
