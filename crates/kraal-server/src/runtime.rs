//! Process-wide lifecycle flags.
//!
//! The only global state in the node: a running flag checked by background
//! loops at their iteration boundary, and a ready flag gating `/startup`.

use std::sync::atomic::{AtomicBool, Ordering};

static RUNNING: AtomicBool = AtomicBool::new(true);
static READY: AtomicBool = AtomicBool::new(false);

pub fn is_running() -> bool {
    RUNNING.load(Ordering::SeqCst)
}

pub fn request_shutdown() {
    RUNNING.store(false, Ordering::SeqCst);
}

pub fn is_ready() -> bool {
    READY.load(Ordering::SeqCst)
}

pub fn set_ready(ready: bool) {
    READY.store(ready, Ordering::SeqCst);
}
