//! SQLite metadata store
//!
//! One row per tracked filesystem object. The store is only ever driven by
//! the manager worker; it has no internal locking of its own.

use crate::args::ArgValue;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// How long a writer waits for a lock held by another process
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Schema version; bumping it changes the database file name
pub const SCHEMA_VERSION: u32 = 1;

/// Owner tag given to untracked objects discovered on disk
pub const ORPHANS_OWNER: &str = "orphans";

/// DDL for the cache table.
pub const CACHE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS cache (
    path          TEXT PRIMARY KEY,
    owner         TEXT NOT NULL,
    args          TEXT NOT NULL,
    creation_date INTEGER NOT NULL,
    last_access   INTEGER NOT NULL,
    accesses      INTEGER NOT NULL DEFAULT 1,
    size          INTEGER,
    type          TEXT,
    parent        TEXT REFERENCES cache(path),
    owner_data    TEXT
);

CREATE INDEX IF NOT EXISTS idx_cache_parent ON cache(parent);
CREATE INDEX IF NOT EXISTS idx_cache_last_access ON cache(last_access);
";

const COLUMNS: &str =
    "path, owner, args, creation_date, last_access, accesses, size, type, parent, owner_data";

/// File name of the metadata store for the current schema
#[must_use]
pub fn database_file_name() -> String {
    format!("cache-{SCHEMA_VERSION}.db")
}

/// Whether `name` belongs to a metadata store (any schema version)
#[must_use]
pub fn is_database_file(name: &str) -> bool {
    let base = name
        .strip_suffix("-wal")
        .or_else(|| name.strip_suffix("-shm"))
        .or_else(|| name.strip_suffix("-journal"))
        .unwrap_or(name);
    base.starts_with("cache-") && base.ends_with(".db")
}

/// Kind of filesystem object behind an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Regular file (or symlink)
    File,
    /// Directory tree
    Directory,
}

impl EntryKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "file" => Some(Self::File),
            "directory" => Some(Self::Directory),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tracked cache entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    /// Absolute path inside the cache directory
    pub path: PathBuf,
    /// Producer of the entry
    pub owner: String,
    /// Recipe arguments, for diagnostics
    pub args: ArgValue,
    /// First registration time
    pub creation_date: DateTime<Utc>,
    /// Most recent resolution time
    pub last_access: DateTime<Utc>,
    /// Number of resolutions
    pub accesses: u64,
    /// Size in bytes; `None` while the artifact is being built
    pub size: Option<u64>,
    /// Object type, known once populated
    #[serde(rename = "type")]
    pub kind: Option<EntryKind>,
    /// Entry this one was derived from
    pub parent: Option<PathBuf>,
    /// Data returned by the recipe callback
    pub owner_data: Option<Value>,
}

impl CacheEntry {
    /// Whether the artifact finished building
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.size.is_some()
    }

    /// Whether this entry was discovered on disk rather than registered
    #[must_use]
    pub fn is_orphan(&self) -> bool {
        self.owner == ORPHANS_OWNER
    }
}

/// Microseconds since the Unix epoch
pub(crate) type Timestamp = i64;

pub(crate) fn now() -> Timestamp {
    Utc::now().timestamp_micros()
}

fn to_datetime(micros: Timestamp) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

#[allow(clippy::cast_possible_wrap)]
const fn to_sql_size(size: u64) -> i64 {
    size as i64
}

#[allow(clippy::cast_sign_loss)]
fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    let args: String = row.get(2)?;
    let kind: Option<String> = row.get(7)?;
    let owner_data: Option<String> = row.get(9)?;
    Ok(CacheEntry {
        path: PathBuf::from(row.get::<_, String>(0)?),
        owner: row.get(1)?,
        args: ArgValue::from_json(&args).unwrap_or_default(),
        creation_date: to_datetime(row.get(3)?),
        last_access: to_datetime(row.get(4)?),
        accesses: row.get::<_, i64>(5)? as u64,
        size: row.get::<_, Option<i64>>(6)?.map(|s| s as u64),
        kind: kind.as_deref().and_then(EntryKind::parse),
        parent: row.get::<_, Option<String>>(8)?.map(PathBuf::from),
        owner_data: owner_data.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

pub(crate) fn path_str(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        Error::configuration(format!(
            "Cache paths must be valid UTF-8: {}",
            path.display()
        ))
    })
}

/// Connection to the metadata store
#[derive(Debug)]
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Open (or create) the store inside `directory`
    pub fn open(directory: &Path) -> Result<Self> {
        let path = directory.join(database_file_name());
        let conn = Connection::open(&path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // Several processes may share one cache directory
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
            warn!(journal_mode = %mode, "SQLite refused WAL journaling, concurrent access will contend");
        }
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert a row, or bump the access counters of an existing one
    pub fn register(
        &self,
        path: &Path,
        owner: &str,
        args: &ArgValue,
        parent: Option<&Path>,
        at: Timestamp,
    ) -> Result<CacheEntry> {
        let path_s = path_str(path)?;
        let parent_s = parent.map(path_str).transpose()?;
        self.conn.execute(
            "INSERT INTO cache(path, owner, args, creation_date, last_access, accesses, parent)
             VALUES (?1, ?2, ?3, ?4, ?4, 1, ?5)
             ON CONFLICT(path) DO UPDATE SET accesses = accesses + 1, last_access = ?4",
            params![path_s, owner, args.to_canonical_json()?, at, parent_s],
        )?;
        self.get(path)?
            .ok_or_else(|| Error::configuration(format!("Entry vanished: {path_s}")))
    }

    /// Fetch one entry
    pub fn get(&self, path: &Path) -> Result<Option<CacheEntry>> {
        let sql = format!("SELECT {COLUMNS} FROM cache WHERE path = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![path_str(path)?], row_to_entry)
            .optional()?)
    }

    /// Whether a row exists for `path`
    pub fn contains(&self, path: &Path) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM cache WHERE path = ?1",
            params![path_str(path)?],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Record size, type and owner data once the artifact exists
    pub fn populate(
        &self,
        path: &Path,
        size: u64,
        kind: EntryKind,
        owner_data: Option<&Value>,
    ) -> Result<()> {
        let owner_data = owner_data
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| Error::serialization(format!("Failed to encode owner data: {e}")))?;
        self.conn.execute(
            "UPDATE cache SET size = ?1, type = ?2, owner_data = ?3 WHERE path = ?4",
            params![to_sql_size(size), kind.as_str(), owner_data, path_str(path)?],
        )?;
        Ok(())
    }

    /// Remove one row
    pub fn remove(&self, path: &Path) -> Result<()> {
        self.conn.execute(
            "DELETE FROM cache WHERE path = ?1",
            params![path_str(path)?],
        )?;
        Ok(())
    }

    /// Direct children of `path`
    pub fn children(&self, path: &Path) -> Result<Vec<CacheEntry>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM cache WHERE parent = ?1"),
            params![path_str(path)?],
        )
    }

    /// Total recorded size in bytes
    #[allow(clippy::cast_sign_loss)]
    pub fn total_size(&self) -> Result<u64> {
        let total: i64 =
            self.conn
                .query_row("SELECT COALESCE(SUM(size), 0) FROM cache", [], |row| {
                    row.get(0)
                })?;
        Ok(total.max(0) as u64)
    }

    /// Every entry, most recently used first
    pub fn entries(&self) -> Result<Vec<CacheEntry>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM cache ORDER BY last_access DESC"),
            [],
        )
    }

    /// Entries whose artifact has not been populated
    pub fn incomplete(&self) -> Result<Vec<CacheEntry>> {
        self.query(
            &format!("SELECT {COLUMNS} FROM cache WHERE size IS NULL"),
            [],
        )
    }

    /// Creation time of the oldest in-flight build
    pub fn oldest_in_flight(&self) -> Result<Option<Timestamp>> {
        Ok(self.conn.query_row(
            "SELECT MIN(creation_date) FROM cache WHERE size IS NULL",
            [],
            |row| row.get(0),
        )?)
    }

    /// Creation time of the newest completed entry
    pub fn newest_complete(&self) -> Result<Option<Timestamp>> {
        Ok(self.conn.query_row(
            "SELECT MAX(creation_date) FROM cache WHERE size IS NOT NULL",
            [],
            |row| row.get(0),
        )?)
    }

    /// Completed orphans created before `watermark`, oldest first
    pub fn orphans_before(&self, watermark: Timestamp) -> Result<Vec<CacheEntry>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM cache
                 WHERE size IS NOT NULL AND owner = ?1 AND creation_date < ?2
                 ORDER BY creation_date ASC"
            ),
            params![ORPHANS_OWNER, watermark],
        )
    }

    /// Completed entries created before `watermark`, least recently used first
    pub fn lru_before(&self, watermark: Timestamp) -> Result<Vec<CacheEntry>> {
        self.query(
            &format!(
                "SELECT {COLUMNS} FROM cache
                 WHERE size IS NOT NULL AND creation_date < ?1
                 ORDER BY last_access ASC"
            ),
            params![watermark],
        )
    }

    /// Longest registered root path that prefixes `path`
    pub fn root_prefix_of(&self, path: &Path) -> Result<Option<PathBuf>> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT path FROM cache
                 WHERE parent IS NULL AND path <> ?1 AND substr(?1, 1, length(path)) = path
                 ORDER BY length(path) DESC LIMIT 1",
                params![path_str(path)?],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.map(PathBuf::from))
    }

    /// Overwrite the timestamps of an entry
    pub fn set_times(&self, path: &Path, created: Timestamp, accessed: Timestamp) -> Result<()> {
        self.conn.execute(
            "UPDATE cache SET creation_date = ?1, last_access = ?2 WHERE path = ?3",
            params![created, accessed, path_str(path)?],
        )?;
        Ok(())
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<CacheEntry>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, row_to_entry)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
