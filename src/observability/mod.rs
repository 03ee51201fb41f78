//! Observability: structured logging with runtime level control

pub mod logging;

// Re-export for convenience
pub use logging::{
    init_logging, level_handle, parse_level, LevelHandle, LevelWatcher, LogFormat, LogOutput,
    LoggingError,
};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
