//! Kernel logging (`klog`).
//!
//! This crate provides level-filtered logging macros that replace ungated
//! `println!` usage throughout the kernel.  It is designed to be a lightweight
//! dependency that every kernel sub-crate can import without pulling in
//! heavyweight subsystems.
//!
//! # Macro Overview
//!
//! | Macro | Release build | Filtered | Use case |
//! |-------|--------------|----------|----------|
//! | [`kprintln!`] | Compiled out | No | Debug diagnostics (replaces `println!`) |
//! | [`klog!`] | Active | Yes | Operational logging with level filter |
//! | [`klog_always!`] | Active | No | Boot banners, status messages |
//!
//! # Output Sink
//!
//! The crate does not know how to reach a console.  The platform registers a
//! [`LogSink`] once during early boot (serial, VGA, a test capture buffer);
//! until then every macro is a no-op.  The hot path for a filtered-out
//! message is a single `Relaxed` atomic load and an integer compare.

#![no_std]

use core::sync::atomic::{AtomicU8, Ordering};

// ============================================================================
// Log Levels
// ============================================================================

/// Severity level for [`klog!`] messages.
///
/// Ordered from least severe ([`Trace`](Level::Trace)) to most severe
/// ([`Error`](Level::Error)).  The runtime filter allows messages at or above
/// the configured minimum level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    /// Extremely verbose tracing (compiled out in release).
    Trace = 0,
    /// Developer-oriented debug information (compiled out in release).
    Debug = 1,
    /// Normal operational information.
    Info = 2,
    /// Potential problems that merit attention.
    Warn = 3,
    /// Errors that affect correctness.
    Error = 4,
}

// ============================================================================
// Runtime Filter
// ============================================================================

/// Sentinel: all output suppressed.
const LEVEL_DISABLED: u8 = u8::MAX;

/// Runtime minimum level.  Messages with `level >= LOG_MIN_LEVEL` are emitted.
/// Initialised to `Warn`; the boot path may widen or narrow the filter.
static LOG_MIN_LEVEL: AtomicU8 = AtomicU8::new(Level::Warn as u8);

/// Set the minimum level emitted by [`klog!`].
///
/// Safe to call at any time; takes effect for subsequent messages.
#[inline]
pub fn set_min_level(level: Level) {
    LOG_MIN_LEVEL.store(level as u8, Ordering::Release);
}

/// Disable all [`klog!`] output.  Does **not** affect [`klog_always!`].
#[inline]
pub fn disable() {
    LOG_MIN_LEVEL.store(LEVEL_DISABLED, Ordering::Release);
}

/// Returns `true` if a message at `level` would currently be emitted.
///
/// Hot path: single `Relaxed` atomic load + integer compare.
#[inline(always)]
pub fn enabled(level: Level) -> bool {
    level as u8 >= LOG_MIN_LEVEL.load(Ordering::Relaxed)
}

// ============================================================================
// Output Sink
// ============================================================================

/// Destination for formatted log output.
///
/// Implementations must tolerate being called from any context the kernel
/// logs from, including interrupt handlers; they must not block.
pub trait LogSink: Send + Sync {
    /// Write one formatted message (no trailing newline is appended by the
    /// caller; the macros pass a complete line).
    fn write(&self, args: core::fmt::Arguments);
}

/// Static storage for the registered sink.
///
/// Uses `spin::Once` for thread-safe one-time initialisation.  After
/// registration the reference is valid for the lifetime of the kernel.
static LOG_SINK: spin::Once<&'static dyn LogSink> = spin::Once::new();

/// Register the platform log sink.
///
/// Multiple calls are safe; only the first registration takes effect.
pub fn register_sink(sink: &'static dyn LogSink) {
    LOG_SINK.call_once(|| sink);
}

#[doc(hidden)]
#[inline(always)]
pub fn _klog_print(args: core::fmt::Arguments) {
    if let Some(sink) = LOG_SINK.get() {
        sink.write(args);
    }
}

// ============================================================================
// Macros
// ============================================================================

/// Unconditional kernel output (boot banners, status messages).
///
/// Bypasses the level filter but still requires a registered sink.
#[macro_export]
macro_rules! klog_always {
    () => {{
        $crate::_klog_print(format_args!("\n"));
    }};
    ($($arg:tt)+) => {{
        $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
    }};
}

/// Debug-only kernel print — drop-in replacement for `println!`.
///
/// **Fully compiled out** in release builds (zero cost, zero binary impact).
#[macro_export]
macro_rules! kprintln {
    () => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!();
    }};
    ($($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        $crate::klog_always!($($arg)+);
    }};
}

/// Level-filtered kernel logging.
///
/// `Debug` and `Trace` levels are additionally compiled out in release
/// builds, so they incur zero cost in production even if the runtime filter
/// would allow them.
///
/// # Examples
///
/// ```ignore
/// klog!(Error, "tcp: impossible to prepare packet for ACK");
/// klog!(Warn,  "net: rx queue full, dropping");
/// klog!(Info,  "net: interface {} up", name);
/// klog!(Trace, "udp: source port {}", port);
/// ```
#[macro_export]
macro_rules! klog {
    // ---- Error (always compiled in, runtime-filtered) ----
    (Error, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Error) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Warn (always compiled in, runtime-filtered) ----
    (Warn, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Warn) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Info (always compiled in, runtime-filtered) ----
    (Info, $($arg:tt)+) => {{
        if $crate::enabled($crate::Level::Info) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Debug (compiled out in release) ----
    (Debug, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Debug) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
    // ---- Trace (compiled out in release) ----
    (Trace, $($arg:tt)+) => {{
        #[cfg(debug_assertions)]
        if $crate::enabled($crate::Level::Trace) {
            $crate::_klog_print(format_args!("{}\n", format_args!($($arg)+)));
        }
    }};
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
    }

    // Single test: the filter state is global, so the sequence must not be
    // split across concurrently-running test functions.
    #[test]
    fn test_filter_and_sinkless_output() {
        set_min_level(Level::Info);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Info));
        assert!(!enabled(Level::Debug));

        disable();
        assert!(!enabled(Level::Error));

        set_min_level(Level::Trace);
        assert!(enabled(Level::Trace));

        // Must not panic when no sink is registered.
        klog!(Error, "no sink {}", 42);
        klog_always!("banner");
        kprintln!("debug only");
    }
}
