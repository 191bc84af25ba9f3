//! Persistent storage for readings.
//!
//! Readings live in a single SQLite table. The poll loop appends and the
//! retention loop deletes. Each operation opens its own connection and runs
//! one statement, so the two loops never share a lock. Rows stay consistent
//! through SQLite's own atomicity (WAL mode, busy timeout).
//!
//! Timestamps are stored as UTC text (`YYYY-MM-DD HH:MM:SS.ffffff`). String
//! order is therefore time order, and the index serves both the retention
//! sweep and history queries.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::reading::Reading;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS sensor_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        temperature REAL NOT NULL,
        humidity INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_timestamp ON sensor_readings (timestamp);
";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLite reported an error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The database directory could not be created.
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A stored timestamp could not be parsed.
    #[error("Row {id} has an unreadable timestamp '{value}'")]
    InvalidTimestamp {
        /// Row id.
        id: i64,
        /// Stored text.
        value: String,
    },

    /// A blocking storage call panicked or was cancelled.
    #[error("Storage call did not complete: {0}")]
    Interrupted(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Run a synchronous storage call on tokio's blocking pool.
///
/// SQLite calls can wait up to the busy timeout for a lock, so async code
/// never calls a sink or store directly.
///
/// # Errors
///
/// Returns the call's own error, or [`StorageError::Interrupted`] if the
/// call panicked or the runtime shut down first.
pub async fn run_blocking<T, F>(call: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| StorageError::Interrupted(e.to_string()))?
}

/// Durable destination for readings.
///
/// Implementations must tolerate calls from the poll and retention loops
/// interleaving without external locking.
pub trait ReadingSink: Send + Sync + 'static {
    /// Persist one reading, returning its record id.
    ///
    /// # Errors
    ///
    /// Returns an error if the reading could not be stored.
    fn append(&self, reading: &Reading) -> StorageResult<i64>;

    /// Delete every reading captured strictly before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete failed.
    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize>;
}

/// Sort direction for history queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first.
    Asc,
    /// Newest first.
    #[default]
    Desc,
}

impl SortOrder {
    const fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// Error parsing a [`SortOrder`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid sort order '{0}'. Use 'asc' or 'desc'.")]
pub struct InvalidSortOrder(pub String);

impl FromStr for SortOrder {
    type Err = InvalidSortOrder;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            _ => Err(InvalidSortOrder(s.to_string())),
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        })
    }
}

/// Parameters for [`SqliteStore::history`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Maximum rows to return; `None` for all.
    pub limit: Option<u32>,
    /// Sort direction by capture time.
    pub order: SortOrder,
}

/// A persisted reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoredReading {
    /// Row id.
    pub id: i64,
    /// The reading.
    pub reading: Reading,
}

/// SQLite-backed reading store.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and ensure the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or schema cannot be created.
    pub fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let store = Self { path };
        let conn = store.connect()?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %store.path.display(), "Database ready");
        Ok(store)
    }

    /// Database file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> StorageResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Readings ordered by capture time.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row is unreadable.
    pub fn history(&self, query: HistoryQuery) -> StorageResult<Vec<StoredReading>> {
        let conn = self.connect()?;
        let order = query.order.as_sql();
        let sql = format!(
            "SELECT id, timestamp, temperature, humidity FROM sensor_readings \
             ORDER BY timestamp {order}, id {order} LIMIT ?1"
        );
        // SQLite treats a negative LIMIT as "no limit".
        let limit = query.limit.map_or(-1, i64::from);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![limit], raw_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(into_stored).collect()
    }

    /// The most recent reading, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the row is unreadable.
    pub fn latest(&self) -> StorageResult<Option<StoredReading>> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT id, timestamp, temperature, humidity FROM sensor_readings \
             ORDER BY timestamp DESC, id DESC LIMIT 1",
            [],
            raw_row,
        )
        .optional()?
        .map(into_stored)
        .transpose()
    }

    /// Number of stored readings.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn count(&self) -> StorageResult<u64> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sensor_readings", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

impl ReadingSink for SqliteStore {
    fn append(&self, reading: &Reading) -> StorageResult<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO sensor_readings (timestamp, temperature, humidity) VALUES (?1, ?2, ?3)",
            params![
                format_timestamp(reading.captured_at()),
                reading.temperature_celsius(),
                reading.humidity_percent(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, "Inserted reading");
        Ok(id)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StorageResult<usize> {
        let conn = self.connect()?;
        let deleted = conn.execute(
            "DELETE FROM sensor_readings WHERE timestamp < ?1",
            params![format_timestamp(cutoff)],
        )?;
        Ok(deleted)
    }
}

type RawRow = (i64, String, f64, u8);

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_stored((id, timestamp, temperature, humidity): RawRow) -> StorageResult<StoredReading> {
    let captured_at = parse_timestamp(&timestamp).ok_or(StorageError::InvalidTimestamp {
        id,
        value: timestamp,
    })?;
    Ok(StoredReading {
        id,
        reading: Reading::new(temperature, humidity, captured_at),
    })
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tokio_test::assert_ok;

    use super::*;

    fn open_temp() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sensor_data.db");
        let store = SqliteStore::open(path).unwrap();
        (dir, store)
    }

    fn reading_at(at: DateTime<Utc>, humidity: u8) -> Reading {
        Reading::new(21.5, humidity, at)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_open_creates_directories_and_schema() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
        assert_eq!(store.count().unwrap(), 0);
        // Reopening an existing database is fine.
        assert_ok!(SqliteStore::open(store.path()));
    }

    #[test]
    fn test_append_returns_increasing_ids() {
        let (_dir, store) = open_temp();
        let first = store.append(&reading_at(now(), 40)).unwrap();
        let second = store.append(&reading_at(now(), 41)).unwrap();
        assert!(second > first);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_append_preserves_values() {
        let (_dir, store) = open_temp();
        let at = now() + ChronoDuration::microseconds(123_456);
        let reading = Reading::new(-3.75, 93, at);
        let id = store.append(&reading).unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.reading, reading);
    }

    #[test]
    fn test_retention_deletes_only_older_rows() {
        let (_dir, store) = open_temp();
        let t = now();
        for days in [10, 8, 1] {
            let at = t - ChronoDuration::days(days);
            store.append(&reading_at(at, 50)).unwrap();
        }

        let cutoff = t - ChronoDuration::days(7);
        let deleted = store.delete_older_than(cutoff).unwrap();
        assert_eq!(deleted, 2);

        let remaining = store.history(HistoryQuery::default()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].reading.captured_at(), t - ChronoDuration::days(1));
    }

    #[test]
    fn test_retention_on_empty_table() {
        let (_dir, store) = open_temp();
        assert_eq!(store.delete_older_than(now()).unwrap(), 0);
    }

    #[test]
    fn test_history_order_and_limit() {
        let (_dir, store) = open_temp();
        for (offset, humidity) in [(3, 30), (1, 10), (2, 20)] {
            store
                .append(&reading_at(now() + ChronoDuration::minutes(offset), humidity))
                .unwrap();
        }

        let humidities = |query| {
            store
                .history(query)
                .unwrap()
                .into_iter()
                .map(|r| r.reading.humidity_percent())
                .collect::<Vec<_>>()
        };

        assert_eq!(humidities(HistoryQuery::default()), vec![30, 20, 10]);
        assert_eq!(
            humidities(HistoryQuery {
                limit: None,
                order: SortOrder::Asc
            }),
            vec![10, 20, 30]
        );
        assert_eq!(
            humidities(HistoryQuery {
                limit: Some(2),
                order: SortOrder::Desc
            }),
            vec![30, 20]
        );
        assert!(humidities(HistoryQuery {
            limit: Some(0),
            order: SortOrder::Asc
        })
        .is_empty());
    }

    #[test]
    fn test_latest_on_empty_table() {
        let (_dir, store) = open_temp();
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_unreadable_timestamp_is_reported() {
        let (_dir, store) = open_temp();
        let conn = store.connect().unwrap();
        conn.execute(
            "INSERT INTO sensor_readings (timestamp, temperature, humidity) \
             VALUES ('yesterday', 1.0, 2)",
            [],
        )
        .unwrap();

        let err = store.latest().unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidTimestamp { ref value, .. } if value == "yesterday"
        ));
    }

    #[test]
    fn test_sort_order_parsing() {
        assert_eq!("asc".parse::<SortOrder>().unwrap(), SortOrder::Asc);
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("sideways".parse::<SortOrder>().is_err());
        assert_eq!(SortOrder::default(), SortOrder::Desc);
        assert_eq!(SortOrder::Asc.to_string(), "asc");
    }

    #[test]
    fn test_timestamp_format_sorts_lexically() {
        let earlier = format_timestamp(now());
        let later = format_timestamp(now() + ChronoDuration::microseconds(1));
        assert!(earlier < later);
        assert_eq!(parse_timestamp(&earlier), Some(now()));
    }

    #[tokio::test]
    async fn test_run_blocking_returns_store_results() {
        let (_dir, store) = open_temp();
        let writer = store.clone();
        let id = run_blocking(move || writer.append(&reading_at(now(), 60)))
            .await
            .unwrap();

        let latest = run_blocking(move || store.latest()).await.unwrap().unwrap();
        assert_eq!(latest.id, id);
    }

    #[tokio::test]
    async fn test_run_blocking_turns_panics_into_errors() {
        let result: StorageResult<()> = run_blocking(|| panic!("disk controller fault")).await;
        assert!(matches!(result, Err(StorageError::Interrupted(_))));
    }
}
