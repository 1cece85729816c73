// src/core/suppression.rs

//! Suppression rules: a small relational store of match rules synced in by
//! the control plane, and the TTL-cached matcher the tailers consult before
//! publishing. The matcher is fail-open: callers treat any error as
//! "no rule matched".

use crate::core::errors::AgentError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// A persisted instruction to drop matching events without publication.
#[derive(Debug, Clone, Serialize)]
pub struct SuppressionRule {
    pub id: i64,
    pub name: String,
    /// Matched case-insensitively as a substring of the line.
    pub match_text: String,
    /// `None` applies the rule to every node.
    pub node_scope: Option<String>,
    pub expires_at: Option<String>,
}

impl SuppressionRule {
    fn matches(&self, line_lower: &str, node_id: &str) -> bool {
        if let Some(scope) = &self.node_scope
            && scope != node_id
        {
            return false;
        }
        line_lower.contains(&self.match_text.to_lowercase())
    }
}

/// The rule store, backed by a SQLite file the control plane syncs rules
/// into. The agent reads active rules and writes match statistics.
#[derive(Debug)]
pub struct RuleStore {
    conn: Mutex<Connection>,
}

impl RuleStore {
    pub fn open(path: &Path) -> Result<Self, AgentError> {
        let conn = Connection::open(path).map_err(|e| AgentError::RuleStore(e.to_string()))?;
        let store = Self { conn: Mutex::new(conn) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), AgentError> {
        self.conn
            .lock()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS suppression_rules (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL,
                    match_text TEXT NOT NULL,
                    node_ip TEXT,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    expires_at TEXT,
                    match_count INTEGER NOT NULL DEFAULT 0,
                    last_matched_at TEXT
                );",
            )
            .map_err(|e| AgentError::RuleStore(e.to_string()))
    }

    /// Loads enabled, non-expired rules in ascending id order.
    pub fn load_active(&self) -> Result<Vec<SuppressionRule>, AgentError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, match_text, node_ip, expires_at
                 FROM suppression_rules
                 WHERE enabled = 1 AND (expires_at IS NULL OR expires_at > ?1)
                 ORDER BY id",
            )
            .map_err(|e| AgentError::RuleStore(e.to_string()))?;
        let rules = stmt
            .query_map(params![now], |row| {
                Ok(SuppressionRule {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    match_text: row.get(2)?,
                    node_scope: row.get(3)?,
                    expires_at: row.get(4)?,
                })
            })
            .map_err(|e| AgentError::RuleStore(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AgentError::RuleStore(e.to_string()))?;
        Ok(rules)
    }

    /// Increments a rule's match counter and stamps `last_matched_at`.
    pub fn increment_match(&self, rule_id: i64) -> Result<(), AgentError> {
        self.conn
            .lock()
            .execute(
                "UPDATE suppression_rules
                 SET match_count = match_count + 1, last_matched_at = ?1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), rule_id],
            )
            .map_err(|e| AgentError::RuleStore(e.to_string()))?;
        Ok(())
    }

    /// Inserts a rule. Used by the control plane's sync path and by tests.
    pub fn insert(
        &self,
        name: &str,
        match_text: &str,
        node_scope: Option<&str>,
        enabled: bool,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<i64, AgentError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO suppression_rules (name, match_text, node_ip, enabled, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                name,
                match_text,
                node_scope,
                enabled as i64,
                expires_at.map(|t| t.to_rfc3339())
            ],
        )
        .map_err(|e| AgentError::RuleStore(e.to_string()))?;
        Ok(conn.last_insert_rowid())
    }

    /// Reads a rule's current match count, for statistics and tests.
    pub fn match_count(&self, rule_id: i64) -> Result<Option<i64>, AgentError> {
        self.conn
            .lock()
            .query_row(
                "SELECT match_count FROM suppression_rules WHERE id = ?1",
                params![rule_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AgentError::RuleStore(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct RuleCache {
    rules: Option<Arc<Vec<SuppressionRule>>>,
    loaded_at: Option<Instant>,
}

/// Cumulative matcher statistics, exposed through `/api/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SuppressionStats {
    pub total_checks: u64,
    pub total_suppressed: u64,
    pub suppression_rate: f64,
    pub cached_rules: usize,
}

/// Checks whether error lines should be suppressed, caching the active rule
/// set for a TTL to keep the store off the tailers' hot path.
#[derive(Debug)]
pub struct SuppressionChecker {
    store: Option<RuleStore>,
    cache: Mutex<RuleCache>,
    cache_ttl: Duration,
    total_checks: AtomicU64,
    total_suppressed: AtomicU64,
}

impl SuppressionChecker {
    pub fn new(store: Option<RuleStore>, cache_ttl: Duration) -> Self {
        info!("suppression checker initialized with cache TTL: {}s", cache_ttl.as_secs());
        Self {
            store,
            cache: Mutex::new(RuleCache::default()),
            cache_ttl,
            total_checks: AtomicU64::new(0),
            total_suppressed: AtomicU64::new(0),
        }
    }

    /// Returns whether the line is suppressed and, if so, by which rule.
    /// Rules are evaluated in ascending id order; the first match wins and
    /// has its match counter incremented (best-effort).
    pub fn should_suppress(
        &self,
        line: &str,
        node_id: &str,
    ) -> (bool, Option<SuppressionRule>) {
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let rules = self.current_rules();
        if rules.is_empty() {
            return (false, None);
        }

        let line_lower = line.to_lowercase();
        for rule in rules.iter() {
            if rule.matches(&line_lower, node_id) {
                if let Some(store) = &self.store
                    && let Err(e) = store.increment_match(rule.id)
                {
                    error!("failed to update match count for rule {}: {e}", rule.id);
                }
                self.total_suppressed.fetch_add(1, Ordering::Relaxed);
                info!(
                    "line suppressed by rule {} ('{}', node_id={})",
                    rule.id, rule.name, node_id
                );
                return (true, Some(rule.clone()));
            }
        }
        (false, None)
    }

    /// Returns the cached rule set, reloading it when the TTL has expired.
    /// A failed reload retains the previous cache until the next attempt.
    fn current_rules(&self) -> Arc<Vec<SuppressionRule>> {
        let mut cache = self.cache.lock();
        let expired = match (cache.rules.as_ref(), cache.loaded_at) {
            (Some(_), Some(at)) => at.elapsed() >= self.cache_ttl,
            _ => true,
        };
        if expired {
            self.reload_into(&mut cache);
        }
        cache.rules.clone().unwrap_or_default()
    }

    fn reload_into(&self, cache: &mut RuleCache) {
        let Some(store) = &self.store else {
            cache.rules = Some(Arc::new(Vec::new()));
            cache.loaded_at = Some(Instant::now());
            return;
        };
        match store.load_active() {
            Ok(rules) => {
                debug!("loaded {} active suppression rules", rules.len());
                cache.rules = Some(Arc::new(rules));
                cache.loaded_at = Some(Instant::now());
            }
            Err(e) => {
                error!("failed to load suppression rules: {e}");
                if cache.rules.is_none() {
                    cache.rules = Some(Arc::new(Vec::new()));
                }
                // Stamp the failed attempt so the store is not hammered on
                // every check while it is unavailable.
                cache.loaded_at = Some(Instant::now());
            }
        }
    }

    /// Bypasses the TTL and reloads the rule set immediately.
    pub fn force_reload(&self) {
        info!("forcing reload of suppression rules");
        let mut cache = self.cache.lock();
        self.reload_into(&mut cache);
    }

    pub fn stats(&self) -> SuppressionStats {
        let checks = self.total_checks.load(Ordering::Relaxed);
        let suppressed = self.total_suppressed.load(Ordering::Relaxed);
        let rate = if checks > 0 {
            (suppressed as f64 / checks as f64) * 100.0
        } else {
            0.0
        };
        SuppressionStats {
            total_checks: checks,
            total_suppressed: suppressed,
            suppression_rate: rate,
            cached_rules: self
                .cache
                .lock()
                .rules
                .as_ref()
                .map(|r| r.len())
                .unwrap_or(0),
        }
    }

    pub fn stats_json(&self) -> serde_json::Value {
        json!(self.stats())
    }
}
