//! RuleStore implementation with a JSONL append log and a SQLite index.
//!
//! - **JSONL file**: append-only log of every rule write and delete (source of truth)
//! - **SQLite database**: query index over `status` and `next_run_at`, rebuilt
//!   from the log when it is missing or behind
//!
//! The index records how many log lines it has applied in its `meta` table,
//! so a crash between the log append and the index write is repaired on the
//! next open. Superseded lines are dropped by compaction, which rewrites the
//! log to one `put` per live rule; `open_at` compacts once the log holds more
//! than twice as many lines as live rules.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use super::traits::RuleStore;
use crate::domain::{RecurrenceRule, RulePatch};
use crate::error::{Result, SchedulerError};

const RULES_LOG: &str = "rules.jsonl";
const RULES_DB: &str = "rules.db";

/// Logs shorter than this are never compacted on open
const COMPACT_MIN_LINES: usize = 64;

/// One line of the rule log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogEntry {
    Put { rule: RecurrenceRule },
    Delete { id: String },
}

#[derive(Debug, Default)]
struct Replay {
    rules: BTreeMap<String, RecurrenceRule>,
    unreadable: Vec<String>,
    lines: usize,
}

struct Inner {
    jsonl_path: PathBuf,
    db: Connection,
}

/// SQLite-indexed, JSONL-backed rule store.
///
/// `rusqlite::Connection` is not `Sync`, so it lives behind a `Mutex`; every
/// operation is a short critical section with no await points inside.
pub struct SqliteRuleStore {
    base_dir: PathBuf,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for SqliteRuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRuleStore")
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

impl SqliteRuleStore {
    /// Open or create a store in `base_dir`.
    pub fn open_at(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;

        let jsonl_path = base_dir.join(RULES_LOG);
        let db = Connection::open(base_dir.join(RULES_DB))?;
        init_schema(&db)?;

        let mut inner = Inner { jsonl_path, db };
        inner.rebuild_index_if_needed()?;
        inner.compact_if_needed()?;

        Ok(Self {
            base_dir,
            inner: Mutex::new(inner),
        })
    }

    /// Directory holding the log and the index.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Drop the index and replay the whole log.
    pub fn rebuild_index(&self) -> Result<usize> {
        self.lock()?.rebuild_index()
    }

    /// Rewrite the log keeping only the latest state of each live rule.
    ///
    /// Returns the number of lines removed.
    pub fn compact(&self) -> Result<usize> {
        self.lock()?.compact()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|e| SchedulerError::Persistence(e.to_string()))
    }
}

fn init_schema(db: &Connection) -> Result<()> {
    db.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS recurrence_rules (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            frequency_type TEXT NOT NULL,
            next_run_at INTEGER NOT NULL,
            last_run_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            json_data TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_rules_due ON recurrence_rules(status, next_run_at);
        CREATE INDEX IF NOT EXISTS idx_rules_created ON recurrence_rules(created_at);

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

impl Inner {
    fn applied_lines(&self) -> Result<usize> {
        let value: Option<String> = self
            .db
            .query_row("SELECT value FROM meta WHERE key = 'applied_lines'", [], |row| row.get(0))
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    fn set_applied_lines(db: &Connection, lines: usize) -> Result<()> {
        db.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES ('applied_lines', ?1)",
            [lines.to_string()],
        )?;
        Ok(())
    }

    fn count_log_lines(&self) -> Result<usize> {
        if !self.jsonl_path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&self.jsonl_path)?);
        Ok(reader.lines().count())
    }

    fn rebuild_index_if_needed(&mut self) -> Result<()> {
        let log_lines = self.count_log_lines()?;
        if log_lines != self.applied_lines()? {
            let count = self.rebuild_index()?;
            info!("Rebuilt rule index from {}: {} rules", self.jsonl_path.display(), count);
        }
        Ok(())
    }

    /// Replay the log. Unreadable lines are returned verbatim.
    fn replay(&self) -> Result<Replay> {
        let mut replay = Replay::default();
        if !self.jsonl_path.exists() {
            return Ok(replay);
        }

        let reader = BufReader::new(File::open(&self.jsonl_path)?);
        for line in reader.lines() {
            let line = line?;
            replay.lines += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(LogEntry::Put { rule }) => {
                    replay.rules.insert(rule.id.clone(), rule);
                }
                Ok(LogEntry::Delete { id }) => {
                    replay.rules.remove(&id);
                }
                Err(e) => {
                    warn!("Skipping unreadable rule log line {}: {}", replay.lines, e);
                    replay.unreadable.push(line);
                }
            }
        }
        Ok(replay)
    }

    fn rebuild_index(&mut self) -> Result<usize> {
        let replay = self.replay()?;

        let tx = self.db.transaction()?;
        tx.execute("DELETE FROM recurrence_rules", [])?;
        for rule in replay.rules.values() {
            upsert_row(&tx, rule)?;
        }
        Self::set_applied_lines(&tx, replay.lines)?;
        tx.commit()?;

        Ok(replay.rules.len())
    }

    fn live_rules(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM recurrence_rules", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn compact_if_needed(&mut self) -> Result<()> {
        let lines = self.applied_lines()?;
        if lines >= COMPACT_MIN_LINES && lines > 2 * self.live_rules()? {
            let removed = self.compact()?;
            info!("Compacted {}: dropped {} superseded lines", self.jsonl_path.display(), removed);
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<usize> {
        let replay = self.replay()?;

        // Unreadable lines are kept so they can still be repaired by hand
        let mut rules: Vec<&RecurrenceRule> = replay.rules.values().collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let tmp_path = self.jsonl_path.with_extension("jsonl.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            for line in &replay.unreadable {
                writeln!(file, "{}", line)?;
            }
            for rule in &rules {
                let entry = LogEntry::Put { rule: (*rule).clone() };
                writeln!(file, "{}", serde_json::to_string(&entry)?)?;
            }
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.jsonl_path)?;

        // A crash before this point leaves applied_lines stale, which the next
        // open repairs with a full rebuild
        self.rebuild_index()?;

        let kept = replay.unreadable.len() + rules.len();
        Ok(replay.lines.saturating_sub(kept))
    }

    /// Append to the log, then mirror into the index.
    fn write(&mut self, entry: &LogEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.jsonl_path)?;
        writeln!(file, "{}", json)?;

        let applied = self.applied_lines()? + 1;
        let tx = self.db.transaction()?;
        match entry {
            LogEntry::Put { rule } => upsert_row(&tx, rule)?,
            LogEntry::Delete { id } => {
                tx.execute("DELETE FROM recurrence_rules WHERE id = ?1", [id])?;
            }
        }
        Self::set_applied_lines(&tx, applied)?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<RecurrenceRule>> {
        let json: Option<String> = self
            .db
            .query_row("SELECT json_data FROM recurrence_rules WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(SchedulerError::from))
            .transpose()
    }

    fn query(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<RecurrenceRule>> {
        let mut stmt = self.db.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            let id: String = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((id, json))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, json) = row?;
            match serde_json::from_str::<RecurrenceRule>(&json) {
                Ok(rule) => records.push(rule),
                // Unschedulable until corrected; keep it out of the result
                Err(e) => warn!("Skipping unreadable rule {}: {}", id, e),
            }
        }
        Ok(records)
    }
}

fn upsert_row(db: &Connection, rule: &RecurrenceRule) -> Result<()> {
    let json_data = serde_json::to_string(rule)?;
    db.execute(
        r#"
        INSERT OR REPLACE INTO recurrence_rules
        (id, status, frequency_type, next_run_at, last_run_at, created_at, updated_at, json_data)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
        params![
            rule.id,
            rule.status.as_str(),
            rule.cadence.frequency.frequency_type().as_str(),
            rule.next_run_at.timestamp_millis(),
            rule.last_run_at.map(|t| t.timestamp_millis()),
            rule.created_at,
            rule.updated_at,
            json_data,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl RuleStore for SqliteRuleStore {
    async fn create(&self, rule: RecurrenceRule) -> Result<RecurrenceRule> {
        let mut inner = self.lock()?;
        if inner.get(&rule.id)?.is_some() {
            return Err(SchedulerError::Conflict(format!("rule {} already exists", rule.id)));
        }
        inner.write(&LogEntry::Put { rule: rule.clone() })?;
        Ok(rule)
    }

    async fn get(&self, id: &str) -> Result<Option<RecurrenceRule>> {
        self.lock()?.get(id)
    }

    async fn update(&self, id: &str, patch: RulePatch) -> Result<RecurrenceRule> {
        let mut inner = self.lock()?;
        let mut rule = inner.get(id)?.ok_or_else(|| SchedulerError::NotFound(id.to_string()))?;
        patch.apply(&mut rule)?;
        inner.write(&LogEntry::Put { rule: rule.clone() })?;
        Ok(rule)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.get(id)?.is_none() {
            return Err(SchedulerError::NotFound(id.to_string()));
        }
        inner.write(&LogEntry::Delete { id: id.to_string() })
    }

    async fn list_all(&self) -> Result<Vec<RecurrenceRule>> {
        self.lock()?
            .query("SELECT id, json_data FROM recurrence_rules ORDER BY created_at, id", [])
    }

    async fn list_due(&self, now: DateTime<Utc>) -> Result<Vec<RecurrenceRule>> {
        self.lock()?.query(
            "SELECT id, json_data FROM recurrence_rules \
             WHERE status = 'active' AND next_run_at <= ?1 \
             ORDER BY next_run_at, id",
            [now.timestamp_millis()],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cadence, DayOfMonth, NewRule, RuleStatus, RuleTemplate};
    use chrono::{Duration, TimeZone};
    use std::num::NonZeroU32;
    use tempfile::TempDir;

    fn template(category: &str) -> RuleTemplate {
        RuleTemplate {
            amount: 1200.0,
            category: category.to_string(),
            currency: "EUR".to_string(),
            note: None,
            device_name: Some("laptop".to_string()),
        }
    }

    fn rule_at(category: &str, next_run_at: DateTime<Utc>) -> RecurrenceRule {
        let cadence = Cadence::monthly_on(NonZeroU32::new(1).unwrap(), DayOfMonth::new(1).unwrap());
        NewRule::new(cadence, template(category))
            .first_run_at(next_run_at)
            .into_rule(next_run_at)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 2, 1, 8, 0, 0).unwrap()
    }

    fn create_temp_store() -> (SqliteRuleStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_open_creates_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = SqliteRuleStore::open_at(temp_dir.path().join("data")).unwrap();
        assert!(temp_dir.path().join("data").join(RULES_DB).exists());
        assert_eq!(store.base_dir(), temp_dir.path().join("data"));
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (store, _temp) = create_temp_store();
        let rule = store.create(rule_at("rent", now())).await.unwrap();

        let retrieved = store.get(&rule.id).await.unwrap().unwrap();
        assert_eq!(retrieved, rule);
        assert!(store.get("nonexistent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_due_uses_index_order() {
        let (store, _temp) = create_temp_store();
        let b = store.create(rule_at("b", now() - Duration::hours(3))).await.unwrap();
        let a = store.create(rule_at("a", now() - Duration::days(3))).await.unwrap();
        store.create(rule_at("future", now() + Duration::minutes(1))).await.unwrap();
        let paused = store.create(rule_at("paused", now() - Duration::days(9))).await.unwrap();
        store.pause(&paused.id).await.unwrap();

        let due = store.list_due(now()).await.unwrap();
        let categories: Vec<&str> = due.iter().map(|r| r.template.category.as_str()).collect();
        assert_eq!(categories, vec!["a", "b"]);
        assert_eq!(due[0].id, a.id);
        assert_eq!(due[1].id, b.id);
    }

    #[tokio::test]
    async fn test_list_due_ties_broken_by_id() {
        let (store, _temp) = create_temp_store();
        let mut first = rule_at("x", now());
        first.id = "rule-b".to_string();
        let mut second = rule_at("y", now());
        second.id = "rule-a".to_string();
        store.create(first).await.unwrap();
        store.create(second).await.unwrap();

        let ids: Vec<String> = store.list_due(now()).await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["rule-a", "rule-b"]);
    }

    #[tokio::test]
    async fn test_update_merges_and_persists() {
        let (store, temp) = create_temp_store();
        let rule = store.create(rule_at("rent", now())).await.unwrap();
        let next = now() + Duration::days(28);

        let updated = store.update(&rule.id, RulePatch::executed(now(), next)).await.unwrap();
        assert_eq!(updated.next_run_at, next);
        assert_eq!(updated.last_run_at, Some(now()));
        assert_eq!(updated.template, rule.template);
        drop(store);

        let reopened = SqliteRuleStore::open_at(temp.path()).unwrap();
        let loaded = reopened.get(&rule.id).await.unwrap().unwrap();
        assert_eq!(loaded.next_run_at, next);
        assert!(reopened.list_due(now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_not_found() {
        let (store, _temp) = create_temp_store();
        let err = store.update("ghost", RulePatch::reschedule(now())).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_guarded_update_conflict_leaves_row() {
        let (store, _temp) = create_temp_store();
        let rule = store.create(rule_at("rent", now())).await.unwrap();

        let patch = RulePatch::reschedule(now() + Duration::days(1)).guarded(now() - Duration::days(1));
        let err = store.update(&rule.id, patch).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Conflict(_)));
        assert_eq!(store.get(&rule.id).await.unwrap().unwrap().next_run_at, now());
    }

    #[tokio::test]
    async fn test_delete_writes_tombstone() {
        let (store, temp) = create_temp_store();
        let rule = store.create(rule_at("rent", now())).await.unwrap();
        store.delete(&rule.id).await.unwrap();
        assert!(store.get(&rule.id).await.unwrap().is_none());
        assert!(matches!(
            store.delete(&rule.id).await.unwrap_err(),
            SchedulerError::NotFound(_)
        ));
        drop(store);

        let log = fs::read_to_string(temp.path().join(RULES_LOG)).unwrap();
        assert!(log.lines().last().unwrap().contains(r#""op":"delete""#));

        let reopened = SqliteRuleStore::open_at(temp.path()).unwrap();
        assert!(reopened.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rebuild_from_log_after_index_loss() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
            store.create(rule_at("one", now())).await.unwrap();
            let two = store.create(rule_at("two", now())).await.unwrap();
            store.pause(&two.id).await.unwrap();
        }

        fs::remove_file(temp_dir.path().join(RULES_DB)).unwrap();

        let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.list_due(now()).await.unwrap().len(), 1);
        assert!(all.iter().any(|r| r.status == RuleStatus::Paused));
    }

    #[tokio::test]
    async fn test_rebuild_catches_up_with_log_written_elsewhere() {
        let temp_dir = TempDir::new().unwrap();
        let extra = rule_at("appended", now());
        {
            let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
            store.create(rule_at("one", now())).await.unwrap();
        }

        // Simulate a crash after the log append but before the index write
        let line = serde_json::to_string(&LogEntry::Put { rule: extra.clone() }).unwrap();
        let mut file = OpenOptions::new()
            .append(true)
            .open(temp_dir.path().join(RULES_LOG))
            .unwrap();
        writeln!(file, "{}", line).unwrap();

        let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
        assert_eq!(store.get(&extra.id).await.unwrap(), Some(extra));
    }

    #[tokio::test]
    async fn test_compact_keeps_only_live_rules() {
        let (store, temp) = create_temp_store();
        let rent = store.create(rule_at("rent", now())).await.unwrap();
        let gone = store.create(rule_at("gone", now())).await.unwrap();
        for days in 1..=5 {
            store
                .update(&rent.id, RulePatch::reschedule(now() + Duration::days(days)))
                .await
                .unwrap();
        }
        store.delete(&gone.id).await.unwrap();

        let log_path = temp.path().join(RULES_LOG);
        assert_eq!(fs::read_to_string(&log_path).unwrap().lines().count(), 8);

        assert_eq!(store.compact().unwrap(), 7);
        assert_eq!(fs::read_to_string(&log_path).unwrap().lines().count(), 1);

        let current = store.get(&rent.id).await.unwrap().unwrap();
        assert_eq!(current.next_run_at, now() + Duration::days(5));
        assert!(store.get(&gone.id).await.unwrap().is_none());

        // Writes after compaction keep the index in step with the log
        store.pause(&rent.id).await.unwrap();
        drop(store);
        let reopened = SqliteRuleStore::open_at(temp.path()).unwrap();
        assert_eq!(reopened.get(&rent.id).await.unwrap().unwrap().status, RuleStatus::Paused);
    }

    #[tokio::test]
    async fn test_open_compacts_long_log() {
        let temp_dir = TempDir::new().unwrap();
        let id = {
            let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
            let rule = store.create(rule_at("coffee", now())).await.unwrap();
            for minutes in 1..=(COMPACT_MIN_LINES as i64) {
                store
                    .update(&rule.id, RulePatch::reschedule(now() + Duration::minutes(minutes)))
                    .await
                    .unwrap();
            }
            rule.id
        };

        let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
        let log = fs::read_to_string(temp_dir.path().join(RULES_LOG)).unwrap();
        assert_eq!(log.lines().count(), 1);
        assert_eq!(
            store.get(&id).await.unwrap().unwrap().next_run_at,
            now() + Duration::minutes(COMPACT_MIN_LINES as i64)
        );
    }

    #[test]
    fn test_compact_preserves_unreadable_lines() {
        let temp_dir = TempDir::new().unwrap();
        let good = rule_at("good", now());
        let good_line = serde_json::to_string(&LogEntry::Put { rule: good.clone() }).unwrap();
        let bad_line = r#"{"op":"put","rule":{"id":"bad"}}"#;
        fs::write(
            temp_dir.path().join(RULES_LOG),
            format!("{}\n{}\n{}\n", good_line, bad_line, good_line),
        )
        .unwrap();

        let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
        assert_eq!(store.compact().unwrap(), 1);

        let log = fs::read_to_string(temp_dir.path().join(RULES_LOG)).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines, vec![bad_line, good_line.as_str()]);
    }

    #[tokio::test]
    async fn test_invalid_log_line_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let good = rule_at("good", now());
        let good_line = serde_json::to_string(&LogEntry::Put { rule: good.clone() }).unwrap();
        let bad_line = r#"{"op":"put","rule":{"id":"bad","frequency_type":"weekly","interval_value":1,"next_run_at":"2025-01-01T00:00:00Z","status":"active","amount":1.0,"category":"c","currency":"USD"}}"#;
        fs::write(
            temp_dir.path().join(RULES_LOG),
            format!("{}\n{}\n", bad_line, good_line),
        )
        .unwrap();

        let store = SqliteRuleStore::open_at(temp_dir.path()).unwrap();
        let all = store.list_all().await.unwrap();
        assert_eq!(all, vec![good]);
        assert_eq!(store.rebuild_index().unwrap(), 1);
    }
}
