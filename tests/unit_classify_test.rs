use vigild::core::classify::{
    LineMatchers, derive_label, derive_severity, extract_timestamp, is_internal_line,
};
use vigild::core::events::{Priority, Severity};

fn default_matchers() -> LineMatchers {
    let error_keywords: Vec<String> = [
        "emerg", "emergency", "alert", "crit", "critical", "err", "error", "fail", "failed",
        "failure", "panic", "fatal",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let critical: Vec<String> = ["panic", "fatal", "emerg", "segfault", "out of memory"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let high: Vec<String> = ["err", "error", "fail", "denied", "refused"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    LineMatchers::new(&error_keywords, &critical, &high).unwrap()
}

#[test]
fn test_severity_order() {
    assert_eq!(derive_severity("kernel PANIC on cpu 0"), Severity::Critical);
    assert_eq!(derive_severity("FATAL: out of memory"), Severity::Critical);
    assert_eq!(derive_severity("crit: watchdog"), Severity::Critical);
    assert_eq!(derive_severity("request failed with 502"), Severity::Failure);
    assert_eq!(derive_severity("ERROR: connection refused"), Severity::Error);
    assert_eq!(derive_severity("warning: disk slow"), Severity::Warn);
    assert_eq!(derive_severity("started ok"), Severity::Info);
}

#[test]
fn test_severity_critical_wins_over_failure() {
    // "fatal" and "failed" in the same line classify as critical.
    assert_eq!(derive_severity("fatal: startup failed"), Severity::Critical);
}

#[test]
fn test_priority_from_severity_mapping() {
    let matchers = default_matchers();
    assert_eq!(
        matchers.derive_priority("ERROR: connection refused", Severity::Error),
        Priority::High
    );
    assert_eq!(
        matchers.derive_priority("something benign", Severity::Warn),
        Priority::Medium
    );
    assert_eq!(
        matchers.derive_priority("something benign", Severity::Info),
        Priority::Low
    );
}

#[test]
fn test_priority_keyword_override() {
    let matchers = default_matchers();
    // A warn-severity line with a critical keyword is critical priority.
    assert_eq!(
        matchers.derive_priority("warning: segfault imminent", Severity::Warn),
        Priority::Critical
    );
}

#[test]
fn test_error_gate() {
    let matchers = default_matchers();
    assert!(matchers.is_error_line("2024-01-01T10:00:00Z ERROR: connection refused"));
    assert!(matchers.is_error_line("Task FAILED after 3 attempts"));
    assert!(!matchers.is_error_line("user logged in successfully"));
}

#[test]
fn test_gate_is_case_insensitive() {
    let matchers = default_matchers();
    assert!(matchers.is_error_line("eRrOr: mixed case"));
    assert!(matchers.is_error_line("PANIC"));
}

#[test]
fn test_label_heuristics() {
    assert_eq!(derive_label("/var/log/apache2/error.log"), "apache_errors");
    assert_eq!(derive_label("/var/log/nginx/access.log"), "nginx_errors");
    assert_eq!(derive_label("/var/log/mysql/slow.log"), "mysql_errors");
    assert_eq!(derive_label("/var/lib/mariadb/err.log"), "mysql_errors");
    assert_eq!(derive_label("/var/log/postgresql/pg.log"), "postgresql_errors");
    assert_eq!(derive_label("/var/log/syslog"), "system");
    assert_eq!(derive_label("/var/log/messages"), "system");
    assert_eq!(derive_label("/var/log/kern.log"), "kernel");
    assert_eq!(derive_label("/var/log/auth.log"), "authentication");
    assert_eq!(derive_label("/var/log/app.log"), "app");
}

#[test]
fn test_internal_marker_guard() {
    assert!(is_internal_line(
        "2024-01-01T10:00:00Z ERROR vigild::core::publisher: bus publish failed"
    ));
    assert!(!is_internal_line("ERROR: app crashed"));
}

#[test]
fn test_timestamp_extraction() {
    let ts = extract_timestamp("2024-01-01T10:00:00Z ERROR: connection refused");
    assert_eq!(ts, "2024-01-01T10:00:00Z");

    // Non-timestamp lines get a synthesized timestamp.
    let synthesized = extract_timestamp("ERROR without timestamp");
    assert!(chrono::DateTime::parse_from_rfc3339(&synthesized).is_ok());
}

#[test]
fn test_scenario_error_line_derivation() {
    // The canonical scenario: an appended error line derives
    // severity=error, priority=high, label=app.
    let line = "2024-01-01T10:00:00Z ERROR: connection refused";
    let matchers = default_matchers();
    assert!(matchers.is_error_line(line));
    let severity = derive_severity(line);
    assert_eq!(severity, Severity::Error);
    assert_eq!(matchers.derive_priority(line, severity), Priority::High);
    assert_eq!(derive_label("/var/log/app.log"), "app");
}
