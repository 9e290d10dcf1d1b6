//! Tracing/logging setup shared by courier binaries and tests.

/// Initialize process-wide logging.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize logging for tests: compact, captured by the test harness.
///
/// Idempotent, so every test may call it.
pub fn init_for_tests() {
    tracing::init_for_tests();
}

/// Subscriber construction.
pub mod tracing;
