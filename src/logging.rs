//! Replay-gated logging macros for orchestration code.
//!
//! Ordinary `tracing` calls inside an orchestrator would re-emit on every
//! replay pass. These macros skip emission while the context is consuming
//! recorded history, so a log line appears once per logical program point.
//! For traces that must survive in history itself, use the context's
//! `trace_info`/`trace_warn`/`trace_error` methods instead.

/// Log at info level, suppressed during replay.
#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)*) => {
        if !$ctx.is_replaying() {
            tracing::info!(target: "windlass::orch", $($arg)*);
        }
    };
}

/// Log at warn level, suppressed during replay.
#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)*) => {
        if !$ctx.is_replaying() {
            tracing::warn!(target: "windlass::orch", $($arg)*);
        }
    };
}

/// Log at error level, suppressed during replay.
#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)*) => {
        if !$ctx.is_replaying() {
            tracing::error!(target: "windlass::orch", $($arg)*);
        }
    };
}

/// Log at debug level, suppressed during replay.
#[macro_export]
macro_rules! durable_debug {
    ($ctx:expr, $($arg:tt)*) => {
        if !$ctx.is_replaying() {
            tracing::debug!(target: "windlass::orch", $($arg)*);
        }
    };
}
