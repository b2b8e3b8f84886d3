//! Shared tracing setup for the engine's binaries.

/// Initialize process-wide tracing with the format chosen by `LOG_FORMAT`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Subscriber configuration (filters, output format).
pub mod tracing;
