//! Leveled logging interface for the Kestrel kernel crates.
//!
//! Library crates log through [`klog!`] and the convenience macros
//! (`kinfo!`, `kdebug!`, ...). The kernel proper registers a sink with
//! [`set_log_fn`] once a console exists; until then, and in host tests,
//! every message is discarded. [`set_max_level`] filters messages before
//! they reach the sink.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// Log levels (lower = more severe)
// ---------------------------------------------------------------------------

/// Kernel log severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Unrecoverable error, the system will halt.
    Fatal = 0,
    /// Something failed but the system may continue.
    Error = 1,
    /// Unexpected condition, not necessarily an error.
    Warn = 2,
    /// High-level progress messages.
    Info = 3,
    /// Detailed diagnostic information.
    Debug = 4,
    /// Very verbose, per-event tracing.
    Trace = 5,
}

impl LogLevel {
    /// Returns the fixed-width name used in log prefixes.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Fatal,
            1 => Self::Error,
            2 => Self::Warn,
            3 => Self::Info,
            4 => Self::Debug,
            _ => Self::Trace,
        }
    }
}

// ---------------------------------------------------------------------------
// Level filter
// ---------------------------------------------------------------------------

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Sets the most verbose level that reaches the sink.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Returns the current maximum level.
pub fn max_level() -> LogLevel {
    LogLevel::from_u8(MAX_LEVEL.load(Ordering::Relaxed))
}

/// Returns `true` if a message at `level` would be forwarded to the sink.
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

// ---------------------------------------------------------------------------
// Sink registration
// ---------------------------------------------------------------------------

/// The signature of the registered log sink.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn null_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static LOG_FN: AtomicPtr<()> = AtomicPtr::new(null_log as *mut ());

/// Registers the log sink.
///
/// # Safety
///
/// `f` must be callable from any context the memory manager runs in,
/// including the page-fault path with address-space locks held. It may be
/// replaced later (early serial first, full console afterwards).
pub unsafe fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

#[inline]
fn load_log_fn() -> LogFn {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: Only valid `LogFn` pointers (or the initial `null_log`) are
    // ever stored into LOG_FN.
    unsafe { core::mem::transmute::<*mut (), LogFn>(ptr) }
}

/// Implementation detail for [`klog!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    if enabled(level) {
        load_log_fn()(level, args);
    }
}

/// Logs a message at the given level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs a fatal-level message.
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Fatal, $($arg)*) };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs an info-level message.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs a debug-level message.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a trace-level message.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Fatal < LogLevel::Error);
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert_eq!(LogLevel::Warn.name().len(), LogLevel::Trace.name().len());
    }

    #[test]
    fn from_u8_saturates_to_trace() {
        assert_eq!(LogLevel::from_u8(3), LogLevel::Info);
        assert_eq!(LogLevel::from_u8(200), LogLevel::Trace);
    }

    #[test]
    fn unregistered_sink_discards() {
        // No sink registered in host tests: must not crash at any level.
        kinfo!("discarded {}", 1);
        ktrace!("discarded {}", 2);
    }
}
