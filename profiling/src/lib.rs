//! Scoped tracing spans for the per-frame compile and submit phases.

pub use tracing;

/// Open a tracing span that lives until the end of the enclosing scope.
#[macro_export]
macro_rules! enter_span {
    ($level:expr, $name:expr, $($fields:tt)*) => {
        let span = $crate::tracing::span!($level, $name, $($fields)*);
        let _enter = span.enter();
    };

    ($level:expr, $name:expr) => {
        $crate::enter_span!($level, $name,)
    };
}

/// Span wrapping a whole frame, carrying the frame serial as a field.
#[macro_export]
macro_rules! frame_span {
    ($serial:expr) => {
        $crate::enter_span!($crate::tracing::Level::DEBUG, "frame", serial = $serial)
    };
}
