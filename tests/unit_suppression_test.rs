use chrono::{TimeDelta, Utc};
use std::time::Duration;
use vigild::core::suppression::{RuleStore, SuppressionChecker};

fn open_store(dir: &tempfile::TempDir) -> RuleStore {
    RuleStore::open(&dir.path().join("suppression.db")).unwrap()
}

#[test]
fn test_no_rules_no_suppression() {
    let dir = tempfile::tempdir().unwrap();
    let checker = SuppressionChecker::new(Some(open_store(&dir)), Duration::from_secs(60));
    let (suppressed, rule) = checker.should_suppress("ERROR: connection refused", "10.0.0.1");
    assert!(!suppressed);
    assert!(rule.is_none());
}

#[test]
fn test_match_is_case_insensitive_substring() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .insert("noisy", "Connection Refused", None, true, None)
        .unwrap();
    let checker = SuppressionChecker::new(Some(store), Duration::from_secs(60));

    let (suppressed, rule) =
        checker.should_suppress("2024-01-01T10:00:00Z ERROR: connection refused", "node-a");
    assert!(suppressed);
    assert_eq!(rule.unwrap().name, "noisy");

    let (suppressed, _) = checker.should_suppress("ERROR: disk full", "node-a");
    assert!(!suppressed);
}

#[test]
fn test_match_count_increments() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let rule_id = store
        .insert("noisy", "connection refused", None, true, None)
        .unwrap();
    let checker = SuppressionChecker::new(Some(store), Duration::from_secs(60));

    let (suppressed, _) = checker.should_suppress("ERROR: connection refused", "node-a");
    assert!(suppressed);

    // A second connection to the same file sees the updated counter.
    let verify = open_store(&dir);
    assert_eq!(verify.match_count(rule_id).unwrap(), Some(1));

    let (suppressed, _) = checker.should_suppress("ERROR: connection refused again", "node-a");
    assert!(suppressed);
    assert_eq!(verify.match_count(rule_id).unwrap(), Some(2));
}

#[test]
fn test_node_scoping() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .insert("scoped", "timeout", Some("10.0.0.1"), true, None)
        .unwrap();
    let checker = SuppressionChecker::new(Some(store), Duration::from_secs(60));

    let (suppressed, _) = checker.should_suppress("ERROR: timeout", "10.0.0.1");
    assert!(suppressed);
    let (suppressed, _) = checker.should_suppress("ERROR: timeout", "10.0.0.2");
    assert!(!suppressed);
}

#[test]
fn test_disabled_and_expired_rules_never_suppress() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .insert("disabled", "timeout", None, false, None)
        .unwrap();
    store
        .insert(
            "expired",
            "timeout",
            None,
            true,
            Some(Utc::now() - TimeDelta::hours(1)),
        )
        .unwrap();
    let checker = SuppressionChecker::new(Some(store), Duration::from_secs(60));

    let (suppressed, _) = checker.should_suppress("ERROR: timeout", "node-a");
    assert!(!suppressed);
}

#[test]
fn test_future_expiry_still_active() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .insert(
            "temporary",
            "timeout",
            None,
            true,
            Some(Utc::now() + TimeDelta::hours(1)),
        )
        .unwrap();
    let checker = SuppressionChecker::new(Some(store), Duration::from_secs(60));

    let (suppressed, _) = checker.should_suppress("ERROR: timeout", "node-a");
    assert!(suppressed);
}

#[test]
fn test_first_match_wins_in_id_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let first = store.insert("first", "error", None, true, None).unwrap();
    store.insert("second", "error", None, true, None).unwrap();
    let checker = SuppressionChecker::new(Some(store), Duration::from_secs(60));

    let (suppressed, rule) = checker.should_suppress("ERROR: both rules match", "node-a");
    assert!(suppressed);
    assert_eq!(rule.unwrap().id, first);
}

#[test]
fn test_cache_hides_new_rules_until_reload() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    let checker = SuppressionChecker::new(Some(store), Duration::from_secs(3600));

    // Prime the cache with an empty rule set.
    let (suppressed, _) = checker.should_suppress("ERROR: connection refused", "node-a");
    assert!(!suppressed);

    // A rule added behind the cache's back is invisible until reload.
    let writer = open_store(&dir);
    writer
        .insert("late", "connection refused", None, true, None)
        .unwrap();
    let (suppressed, _) = checker.should_suppress("ERROR: connection refused", "node-a");
    assert!(!suppressed);

    checker.force_reload();
    let (suppressed, _) = checker.should_suppress("ERROR: connection refused", "node-a");
    assert!(suppressed);
}

#[test]
fn test_missing_store_fails_open() {
    let checker = SuppressionChecker::new(None, Duration::from_secs(60));
    let (suppressed, rule) = checker.should_suppress("ERROR: anything", "node-a");
    assert!(!suppressed);
    assert!(rule.is_none());
}

#[test]
fn test_statistics() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir);
    store
        .insert("noisy", "connection refused", None, true, None)
        .unwrap();
    let checker = SuppressionChecker::new(Some(store), Duration::from_secs(60));

    checker.should_suppress("ERROR: connection refused", "node-a");
    checker.should_suppress("ERROR: disk full", "node-a");

    let stats = checker.stats();
    assert_eq!(stats.total_checks, 2);
    assert_eq!(stats.total_suppressed, 1);
    assert!((stats.suppression_rate - 50.0).abs() < f64::EPSILON);
    assert_eq!(stats.cached_rules, 1);
}
