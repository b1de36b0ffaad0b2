//! Process-wide tracing setup shared by binaries and integration tests.

pub mod tracing;

pub use crate::tracing::{LogFormat, UnknownLogFormat};

/// Initialize tracing for the process.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init(format: LogFormat) {
    tracing::init(format);
}
