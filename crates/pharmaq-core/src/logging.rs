//! Structured event helper shared by the pipeline stages
//!
//! Subscriber setup lives in the binary; the core only emits events.

/// Helper macro for logging with structured fields
///
/// Usage:
/// ```rust
/// pharmaq_core::log_event!(
///     level: tracing::Level::INFO,
///     event: "query_executed",
///     rows: 100,
///     elapsed_ms: 42
/// );
/// ```
#[macro_export]
macro_rules! log_event {
    (level: $level:expr, event: $event:expr $(, $key:ident: $value:expr)* $(,)?) => {
        $crate::tracing::event!(
            $level,
            event = $event
            $(, $key = ?$value)*
        );
    };
}
