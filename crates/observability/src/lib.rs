//! Tracing/logging setup shared by every binary in the workspace.

/// Subscriber installation (filters, output format).
pub mod subscriber;

pub use subscriber::LogFormat;

/// Initialize process-wide tracing with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    subscriber::init(LogFormat::Json);
}

/// Initialize process-wide tracing with an explicit output format.
pub fn init_with(format: LogFormat) {
    subscriber::init(format);
}
