//! Stream logging macros
//!
//! Per-chunk logging is far too chatty for release builds, so these compile
//! to no-ops there.

/// Stream debug logging - only active in debug builds
#[cfg(debug_assertions)]
#[macro_export]
macro_rules! stream_debug {
    ($($arg:tt)*) => { log::debug!($($arg)*) };
}

/// Stream debug logging - no-op in release builds
#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! stream_debug {
    ($($arg:tt)*) => {};
}

/// Stream trace logging - only active in debug builds
#[cfg(debug_assertions)]
#[macro_export]
macro_rules! stream_trace {
    ($($arg:tt)*) => { log::trace!($($arg)*) };
}

/// Stream trace logging - no-op in release builds
#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! stream_trace {
    ($($arg:tt)*) => {};
}
