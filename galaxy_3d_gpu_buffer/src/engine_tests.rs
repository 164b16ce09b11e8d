//! Unit tests for the Engine logging facade
//!
//! IMPORTANT: LOGGER is a global OnceLock shared across all tests.
//! All tests are marked with #[serial] and restore the default logger.

use crate::galaxy3d::Engine;
use crate::galaxy3d::log::{Logger, LogEntry, LogSeverity};
use std::sync::{Arc, Mutex};
use serial_test::serial;

// ============================================================================
// TEST HELPERS
// ============================================================================

/// Test logger that captures log entries for verification
struct TestLogger {
    entries: Arc<Mutex<Vec<(LogSeverity, String, String, Option<u32>)>>>,
}

impl TestLogger {
    fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Logger for TestLogger {
    fn log(&self, entry: &LogEntry) {
        self.entries.lock().unwrap().push((
            entry.severity,
            entry.source.clone(),
            entry.message.clone(),
            entry.line,
        ));
    }
}

// ============================================================================
// LOGGING API TESTS
// ============================================================================

#[test]
#[serial]
fn test_default_logger_logs_without_panic() {
    Engine::reset_logger();
    Engine::log(LogSeverity::Info, "test", "Test message".to_string());
    Engine::log(LogSeverity::Error, "test", "Error message".to_string());
}

#[test]
#[serial]
fn test_set_custom_logger() {
    let test_logger = TestLogger::new();
    let entries_ref = test_logger.entries.clone();
    Engine::set_logger(test_logger);

    Engine::log(LogSeverity::Info, "galaxy3d::test", "Message 1".to_string());
    Engine::log(LogSeverity::Warn, "galaxy3d::test", "Message 2".to_string());
    Engine::reset_logger();

    let entries = entries_ref.lock().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].0, LogSeverity::Info);
    assert_eq!(entries[0].1, "galaxy3d::test");
    assert_eq!(entries[1].2, "Message 2");
    assert_eq!(entries[1].3, None);
}

#[test]
#[serial]
fn test_reset_logger_to_default() {
    let test_logger = TestLogger::new();
    let entries_ref = test_logger.entries.clone();
    Engine::set_logger(test_logger);
    Engine::reset_logger();

    Engine::log(LogSeverity::Info, "test", "After reset".to_string());

    // Default logger is active again
    assert!(entries_ref.lock().unwrap().is_empty());
}

#[test]
#[serial]
fn test_log_detailed_with_file_line() {
    let test_logger = TestLogger::new();
    let entries_ref = test_logger.entries.clone();
    Engine::set_logger(test_logger);

    Engine::log_detailed(
        LogSeverity::Error,
        "galaxy3d::test",
        "Detailed error".to_string(),
        "test.rs",
        42,
    );
    Engine::reset_logger();

    let entries = entries_ref.lock().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, LogSeverity::Error);
    assert_eq!(entries[0].3, Some(42));
}

#[test]
#[serial]
fn test_custom_logger_receives_every_severity() {
    let test_logger = TestLogger::new();
    let entries_ref = test_logger.entries.clone();
    Engine::set_logger(test_logger);

    crate::engine_trace!("test", "Trace");
    crate::engine_debug!("test", "Debug");
    crate::engine_info!("test", "Info");
    crate::engine_warn!("test", "Warn");
    crate::engine_error!("test", "Error {}", 5);
    Engine::reset_logger();

    let entries = entries_ref.lock().unwrap();
    let severities: Vec<LogSeverity> = entries.iter().map(|e| e.0).collect();
    assert_eq!(
        severities,
        vec![
            LogSeverity::Trace,
            LogSeverity::Debug,
            LogSeverity::Info,
            LogSeverity::Warn,
            LogSeverity::Error,
        ]
    );
    assert_eq!(entries[4].2, "Error 5");
    // engine_error! records where it was raised
    assert!(entries[4].3.is_some());
}
