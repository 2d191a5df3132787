use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;

use crate::sqlite::configure_connection;

const ACQUISITION_SCHEMA: &str = include_str!("../../../sql/acquisition.sql");

/// Layout of `CURRENT_TIMESTAMP`, so cutoffs compare as text.
const SQLITE_TIMESTAMP: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open acquisition database {path}: {source}")]
    Open {
        source: rusqlite::Error,
        path: PathBuf,
    },
    #[error("failed to execute statement on acquisition database: {0}")]
    Execute(#[from] rusqlite::Error),
    #[error("acquisition database path not configured")]
    MissingStore,
    #[error("invalid acquisition status: {0}")]
    InvalidStatus(String),
    #[error("acquisition entry not found: {0}")]
    NotFound(i64),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionStatus {
    Queued,
    Downloading,
    Transcoding,
    Complete,
    Failed,
}

impl AcquisitionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquisitionStatus::Queued => "queued",
            AcquisitionStatus::Downloading => "downloading",
            AcquisitionStatus::Transcoding => "transcoding",
            AcquisitionStatus::Complete => "complete",
            AcquisitionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AcquisitionStatus::Complete | AcquisitionStatus::Failed)
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            AcquisitionStatus::Downloading | AcquisitionStatus::Transcoding
        )
    }
}

impl std::fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AcquisitionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "downloading" => Ok(Self::Downloading),
            "transcoding" => Ok(Self::Transcoding),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAcquisition {
    pub canonical_id: String,
    pub content_type: String,
    pub priority: i64,
    pub target_quality: String,
    pub job_id: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcquisitionEntry {
    pub id: i64,
    pub canonical_id: String,
    pub content_type: String,
    pub status: AcquisitionStatus,
    pub priority: i64,
    pub target_quality: Option<String>,
    pub job_id: Option<String>,
    pub attempts: i64,
    pub failure_reason: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AcquisitionEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        Ok(Self {
            id: row.get("id")?,
            canonical_id: row.get("canonical_id")?,
            content_type: row.get("content_type")?,
            status: status.parse().unwrap_or(AcquisitionStatus::Failed),
            priority: row.get("priority")?,
            target_quality: row.get("target_quality")?,
            job_id: row.get("job_id")?,
            attempts: row.get("attempts")?,
            failure_reason: row.get("failure_reason")?,
            queued_at: parse_timestamp(row.get("queued_at")?),
            updated_at: parse_timestamp(row.get("updated_at")?),
            completed_at: parse_timestamp(row.get("completed_at")?),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct AcquisitionFilter {
    pub status: Option<AcquisitionStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SqliteAcquisitionStoreBuilder {
    path: Option<PathBuf>,
    create_if_missing: bool,
}

impl Default for SqliteAcquisitionStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            create_if_missing: true,
        }
    }
}

impl SqliteAcquisitionStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> StoreResult<SqliteAcquisitionStore> {
        let path = self.path.ok_or(StoreError::MissingStore)?;
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
        if self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteAcquisitionStore { path, flags })
    }
}

/// Durable acquisition queue. Every call opens its own connection, so the
/// store is cheap to clone into blocking tasks.
#[derive(Debug, Clone)]
pub struct SqliteAcquisitionStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteAcquisitionStore {
    pub fn builder() -> SqliteAcquisitionStoreBuilder {
        SqliteAcquisitionStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        SqliteAcquisitionStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> StoreResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            StoreError::Open {
                source,
                path: self.path.clone(),
            }
        })?;
        configure_connection(&conn).map_err(|source| StoreError::Open {
            source,
            path: self.path.clone(),
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.open()?;
        conn.execute_batch(ACQUISITION_SCHEMA)?;
        Ok(())
    }

    /// Most recent entry for the content, terminal or not.
    pub fn latest_for(&self, canonical_id: &str) -> StoreResult<Option<AcquisitionEntry>> {
        let conn = self.open()?;
        let entry = conn
            .query_row(
                "SELECT * FROM acquisition_queue WHERE canonical_id = ?1 ORDER BY id DESC LIMIT 1",
                params![canonical_id],
                AcquisitionEntry::from_row,
            )
            .optional()?;
        Ok(entry)
    }

    pub fn get(&self, id: i64) -> StoreResult<AcquisitionEntry> {
        let conn = self.open()?;
        conn.query_row(
            "SELECT * FROM acquisition_queue WHERE id = ?1",
            params![id],
            AcquisitionEntry::from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound(id))
    }

    /// Inserts a queued entry unless an active one already exists for the
    /// same content. Returns `None` when another caller got there first.
    pub fn insert_if_absent(&self, entry: &NewAcquisition) -> StoreResult<Option<i64>> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO acquisition_queue (
                canonical_id, content_type, status, priority, target_quality, job_id,
                queued_at, updated_at
            ) VALUES (?1, ?2, 'queued', ?3, ?4, ?5, ?6, ?6)",
            params![
                &entry.canonical_id,
                &entry.content_type,
                entry.priority,
                &entry.target_quality,
                &entry.job_id,
                entry.queued_at.format(SQLITE_TIMESTAMP).to_string()
            ],
        )?;
        if inserted == 0 {
            Ok(None)
        } else {
            Ok(Some(conn.last_insert_rowid()))
        }
    }

    /// Moves an entry to `status`. Only entries still in `from` are
    /// touched, so concurrent workers cannot both claim the same row.
    pub fn transition(
        &self,
        id: i64,
        from: AcquisitionStatus,
        to: AcquisitionStatus,
    ) -> StoreResult<bool> {
        let conn = self.open()?;
        let attempts_bump = i64::from(to == AcquisitionStatus::Downloading);
        let changed = conn.execute(
            "UPDATE acquisition_queue
             SET status = ?3,
                 attempts = attempts + ?4,
                 updated_at = CURRENT_TIMESTAMP,
                 completed_at = CASE WHEN ?3 IN ('complete','failed') THEN CURRENT_TIMESTAMP ELSE completed_at END
             WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), attempts_bump],
        )?;
        Ok(changed > 0)
    }

    /// Hands an in-flight entry back to the queue. Returns false when the
    /// entry was no longer downloading or transcoding.
    pub fn requeue(&self, id: i64) -> StoreResult<bool> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE acquisition_queue
             SET status = 'queued', updated_at = CURRENT_TIMESTAMP
             WHERE id = ?1 AND status IN ('downloading','transcoding')",
            params![id],
        )?;
        Ok(changed > 0)
    }

    /// Requeues in-flight entries whose last update is at or before
    /// `cutoff`. Returns how many rows were reclaimed.
    pub fn reclaim_stale(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.open()?;
        let cutoff = cutoff.format(SQLITE_TIMESTAMP).to_string();
        let changed = conn.execute(
            "UPDATE acquisition_queue
             SET status = 'queued', updated_at = CURRENT_TIMESTAMP
             WHERE status IN ('downloading','transcoding') AND updated_at <= ?1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    pub fn mark_status(&self, id: i64, status: AcquisitionStatus) -> StoreResult<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE acquisition_queue
             SET status = ?2,
                 updated_at = CURRENT_TIMESTAMP,
                 completed_at = CASE WHEN ?2 IN ('complete','failed') THEN CURRENT_TIMESTAMP ELSE completed_at END
             WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    pub fn record_failure(&self, id: i64, reason: &str) -> StoreResult<()> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE acquisition_queue
             SET status = 'failed',
                 failure_reason = ?2,
                 updated_at = CURRENT_TIMESTAMP,
                 completed_at = CURRENT_TIMESTAMP
             WHERE id = ?1",
            params![id, reason],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    /// Raises the priority of the active entry; never lowers it.
    pub fn update_priority(&self, canonical_id: &str, priority: i64) -> StoreResult<bool> {
        let conn = self.open()?;
        let changed = conn.execute(
            "UPDATE acquisition_queue
             SET priority = MAX(priority, ?2), updated_at = CURRENT_TIMESTAMP
             WHERE canonical_id = ?1 AND status NOT IN ('complete','failed')",
            params![canonical_id, priority],
        )?;
        Ok(changed > 0)
    }

    pub fn list(&self, filter: &AcquisitionFilter) -> StoreResult<Vec<AcquisitionEntry>> {
        let conn = self.open()?;
        let mut query = String::from("SELECT * FROM acquisition_queue");
        let mut params: Vec<Value> = Vec::new();
        if let Some(status) = filter.status {
            query.push_str(" WHERE status = ?");
            params.push(Value::Text(status.as_str().to_string()));
        }
        query.push_str(" ORDER BY id DESC");
        if let Some(limit) = filter.limit {
            query.push_str(" LIMIT ?");
            params.push(Value::Integer(limit as i64));
        }
        let mut stmt = conn.prepare(&query)?;
        let mut rows = stmt.query(rusqlite::params_from_iter(
            params.iter().map(|value| value as &dyn rusqlite::ToSql),
        ))?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(AcquisitionEntry::from_row(row)?);
        }
        Ok(entries)
    }

    /// Queued entries, highest aggregate demand first, oldest first on ties.
    pub fn pending_by_priority(&self, limit: usize) -> StoreResult<Vec<AcquisitionEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT * FROM acquisition_queue WHERE status = 'queued'
             ORDER BY priority DESC, queued_at ASC, id ASC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], AcquisitionEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

fn parse_timestamp(value: Option<NaiveDateTime>) -> Option<DateTime<Utc>> {
    value.map(|dt| DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, SqliteAcquisitionStore) {
        let dir = tempdir().unwrap();
        let store = SqliteAcquisitionStore::new(dir.path().join("acq.sqlite")).unwrap();
        store.initialize().unwrap();
        (dir, store)
    }

    fn new_entry(id: &str, priority: i64) -> NewAcquisition {
        NewAcquisition {
            canonical_id: id.into(),
            content_type: "movie".into(),
            priority,
            target_quality: "1080p".into(),
            job_id: format!("job-{id}-{priority}"),
            queued_at: Utc::now(),
        }
    }

    #[test]
    fn second_active_insert_is_ignored() {
        let (_dir, store) = store();
        let first = store.insert_if_absent(&new_entry("tt0133093", 1)).unwrap();
        assert!(first.is_some());
        let second = store.insert_if_absent(&new_entry("tt0133093", 2)).unwrap();
        assert!(second.is_none());
        let all = store.list(&AcquisitionFilter::default()).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn terminal_entries_allow_a_new_attempt() {
        let (_dir, store) = store();
        let id = store.insert_if_absent(&new_entry("tt1", 1)).unwrap().unwrap();
        store.record_failure(id, "source offline").unwrap();
        let retry = store.insert_if_absent(&new_entry("tt1", 1)).unwrap();
        assert!(retry.is_some());

        let latest = store.latest_for("tt1").unwrap().unwrap();
        assert_eq!(Some(latest.id), retry);
        assert_eq!(latest.status, AcquisitionStatus::Queued);

        let failed = store.get(id).unwrap();
        assert_eq!(failed.status, AcquisitionStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("source offline"));
        assert!(failed.completed_at.is_some());
    }

    #[test]
    fn transition_only_claims_from_expected_state() {
        let (_dir, store) = store();
        let id = store.insert_if_absent(&new_entry("tt2", 1)).unwrap().unwrap();
        assert!(store
            .transition(id, AcquisitionStatus::Queued, AcquisitionStatus::Downloading)
            .unwrap());
        assert!(!store
            .transition(id, AcquisitionStatus::Queued, AcquisitionStatus::Downloading)
            .unwrap());
        let entry = store.get(id).unwrap();
        assert_eq!(entry.status, AcquisitionStatus::Downloading);
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn priority_only_rises_and_orders_pending() {
        let (_dir, store) = store();
        store.insert_if_absent(&new_entry("low", 1)).unwrap();
        store.insert_if_absent(&new_entry("high", 1)).unwrap();
        assert!(store.update_priority("high", 5).unwrap());
        assert!(store.update_priority("high", 2).unwrap());
        assert!(!store.update_priority("missing", 9).unwrap());

        let pending = store.pending_by_priority(10).unwrap();
        let ids: Vec<_> = pending.iter().map(|e| e.canonical_id.as_str()).collect();
        assert_eq!(ids, vec!["high", "low"]);
        assert_eq!(pending[0].priority, 5);
    }

    #[test]
    fn requeue_only_touches_in_flight_rows() {
        let (_dir, store) = store();
        let id = store.insert_if_absent(&new_entry("tt3", 1)).unwrap().unwrap();
        assert!(!store.requeue(id).unwrap());
        store
            .transition(id, AcquisitionStatus::Queued, AcquisitionStatus::Downloading)
            .unwrap();
        assert!(store.requeue(id).unwrap());
        assert_eq!(store.get(id).unwrap().status, AcquisitionStatus::Queued);
        store.mark_status(id, AcquisitionStatus::Complete).unwrap();
        assert!(!store.requeue(id).unwrap());
    }

    #[test]
    fn reclaim_stale_respects_cutoff() {
        let (_dir, store) = store();
        let busy = store.insert_if_absent(&new_entry("busy", 1)).unwrap().unwrap();
        let waiting = store.insert_if_absent(&new_entry("waiting", 1)).unwrap().unwrap();
        store
            .transition(busy, AcquisitionStatus::Queued, AcquisitionStatus::Transcoding)
            .unwrap();

        let past = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.reclaim_stale(past).unwrap(), 0);
        assert_eq!(store.get(busy).unwrap().status, AcquisitionStatus::Transcoding);

        let future = Utc::now() + chrono::Duration::minutes(1);
        assert_eq!(store.reclaim_stale(future).unwrap(), 1);
        assert_eq!(store.get(busy).unwrap().status, AcquisitionStatus::Queued);
        assert_eq!(store.get(waiting).unwrap().status, AcquisitionStatus::Queued);
    }

    #[test]
    fn mark_status_reports_missing_rows() {
        let (_dir, store) = store();
        assert!(matches!(
            store.mark_status(42, AcquisitionStatus::Complete),
            Err(StoreError::NotFound(42))
        ));
    }

    #[test]
    fn list_filters_by_status() {
        let (_dir, store) = store();
        let a = store.insert_if_absent(&new_entry("a", 1)).unwrap().unwrap();
        store.insert_if_absent(&new_entry("b", 1)).unwrap();
        store.mark_status(a, AcquisitionStatus::Complete).unwrap();
        let complete = store
            .list(&AcquisitionFilter {
                status: Some(AcquisitionStatus::Complete),
                limit: Some(10),
            })
            .unwrap();
        assert_eq!(complete.len(), 1);
        assert_eq!(complete[0].canonical_id, "a");
    }
}
