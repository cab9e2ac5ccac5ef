// Per-sample debug logging
//
// Sample callbacks and the delivery queue run at stream rate, so their debug
// output stays off unless switched on at runtime (the demo's `--debug` flag).
// Lifecycle and resolution events always log through `tracing` directly.

use std::sync::atomic::{AtomicBool, Ordering};

/// Gate for `pipeline_debug!` output on the sample delivery path
pub static PIPELINE_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Switch delivery-path debug output on or off for every pipeline in the process
pub fn set_pipeline_debug(enabled: bool) {
    PIPELINE_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    tracing::info!(
        "Sample delivery debug logging {}",
        if enabled { "ENABLED" } else { "DISABLED" }
    );
}

pub fn is_pipeline_debug_enabled() -> bool {
    PIPELINE_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// `tracing::debug!` that only evaluates its arguments while delivery debugging is on
#[macro_export]
macro_rules! pipeline_debug {
    ($($arg:tt)*) => {
        if $crate::log::PIPELINE_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!($($arg)*);
        }
    };
}
