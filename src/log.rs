//! Internal logging macros.
//!
//! They forward to `tracing` when the `tracing` feature is enabled and expand
//! to nothing otherwise, so call sites need no `cfg` of their own.

#[cfg(feature = "tracing")]
macro_rules! log_trace {
    ($($arg:tt)*) => { ::tracing::trace!($($arg)*) };
}

#[cfg(feature = "tracing")]
macro_rules! log_debug {
    ($($arg:tt)*) => { ::tracing::debug!($($arg)*) };
}

#[cfg(feature = "tracing")]
macro_rules! log_warn {
    ($($arg:tt)*) => { ::tracing::warn!($($arg)*) };
}

#[cfg(feature = "tracing")]
macro_rules! log_error {
    ($($arg:tt)*) => { ::tracing::error!($($arg)*) };
}

/// Enters a span for the rest of the enclosing scope.
#[cfg(feature = "tracing")]
macro_rules! enter_span {
    ($level:ident, $($arg:tt)*) => {
        let _span_guard = ::tracing::span!(::tracing::Level::$level, $($arg)*).entered();
    };
}

#[cfg(not(feature = "tracing"))]
macro_rules! log_trace {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! log_error {
    ($($arg:tt)*) => {{}};
}

#[cfg(not(feature = "tracing"))]
macro_rules! enter_span {
    ($($arg:tt)*) => {};
}
