//! Segment version persistence
//!
//! The monitor reads segment stamps after it holds every segment lock and
//! writes new stamps just before commit. Both calls receive the
//! transaction's own connection:
//!
//! - `SqlVersionStore` keeps stamps in a table and runs its statements on that
//!   connection, so new versions commit or roll back together with the data
//! - `MemoryVersionStore` keeps stamps in process memory and ignores the
//!   connection; a save is visible immediately and survives a rollback

use crate::lock_table::LockMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tessera_connection::Connection;
use tessera_core::{Error, Result, Row, SegmentId, SegmentStamp, SqlValue};
use tracing::debug;

/// Default name of the version table
pub const DEFAULT_VERSION_TABLE: &str = "segment_versions";

/// Storage of per-segment version stamps
#[async_trait]
pub trait VersionStore: Send + Sync + 'static {
    /// Load the stamp of every listed segment
    ///
    /// Segments never written map to `SegmentStamp::default()`. The mode
    /// tells a store backed by the database which row lock to request.
    async fn load(
        &self,
        conn: &mut Connection,
        segments: &[(SegmentId, LockMode)],
    ) -> Result<HashMap<SegmentId, SegmentStamp>>;

    /// Store `stamp` for every listed segment
    async fn save(
        &self,
        conn: &mut Connection,
        segments: &[SegmentId],
        stamp: SegmentStamp,
    ) -> Result<()>;
}

/// Process-local version store
#[derive(Debug, Default)]
pub struct MemoryVersionStore {
    stamps: DashMap<SegmentId, SegmentStamp>,
}

impl MemoryVersionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp of one segment
    pub fn get(&self, segment: &SegmentId) -> SegmentStamp {
        self.stamps
            .get(segment)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VersionStore for MemoryVersionStore {
    async fn load(
        &self,
        _conn: &mut Connection,
        segments: &[(SegmentId, LockMode)],
    ) -> Result<HashMap<SegmentId, SegmentStamp>> {
        Ok(segments
            .iter()
            .map(|(segment, _)| (segment.clone(), self.get(segment)))
            .collect())
    }

    async fn save(
        &self,
        _conn: &mut Connection,
        segments: &[SegmentId],
        stamp: SegmentStamp,
    ) -> Result<()> {
        for segment in segments {
            self.stamps.insert(segment.clone(), stamp);
        }
        Ok(())
    }
}

/// Version store backed by a database table
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS `segment_versions` (
///   `segment_id` VARCHAR(255) NOT NULL PRIMARY KEY,
///   `version` BIGINT UNSIGNED NOT NULL,
///   `last_modified` DATETIME(6) NULL
/// ) ENGINE=InnoDB
/// ```
///
/// Loads take `LOCK IN SHARE MODE` row locks on read segments and
/// `FOR UPDATE` locks on write segments, which keeps the stamps consistent
/// between processes sharing the database.
#[derive(Debug, Clone)]
pub struct SqlVersionStore {
    table: String,
}

impl Default for SqlVersionStore {
    fn default() -> Self {
        Self::new(DEFAULT_VERSION_TABLE)
    }
}

impl SqlVersionStore {
    /// Store using `table`
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    /// Table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the version table if it does not exist
    pub async fn ensure_schema(&self, conn: &mut Connection) -> Result<()> {
        let dialect = conn.dialect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) NOT NULL PRIMARY KEY, {} BIGINT UNSIGNED NOT NULL, {} DATETIME(6) NULL) ENGINE=InnoDB",
            dialect.identifier(&self.table),
            dialect.identifier("segment_id"),
            dialect.identifier("version"),
            dialect.identifier("last_modified"),
        );
        conn.execute_statement(&sql).await?;
        debug!(target: "tessera::monitor", table = %self.table, "Version table ready");
        Ok(())
    }

    fn select_sql(&self, conn: &Connection, segment: &SegmentId, mode: LockMode) -> String {
        let dialect = conn.dialect();
        let lock = match mode {
            LockMode::Shared => "LOCK IN SHARE MODE",
            LockMode::Exclusive => "FOR UPDATE",
        };
        format!(
            "SELECT {id}, {version}, {modified} FROM {table} WHERE {id} = {value} {lock}",
            id = dialect.identifier("segment_id"),
            version = dialect.identifier("version"),
            modified = dialect.identifier("last_modified"),
            table = dialect.identifier(&self.table),
            value = dialect.string_literal(segment.as_str()),
            lock = lock,
        )
    }

    fn parse_row(row: &Row) -> Result<(SegmentId, SegmentStamp)> {
        let segment = row
            .get("segment_id")
            .and_then(SqlValue::as_str)
            .ok_or_else(|| Error::version_store("version row without segment_id"))?;
        let version = row
            .get("version")
            .and_then(SqlValue::as_u64)
            .ok_or_else(|| {
                Error::version_store(format!("invalid version for segment '{}'", segment))
            })?;
        let last_modified = match row.get("last_modified") {
            None | Some(SqlValue::Null) => None,
            Some(value) => {
                let naive = value.as_datetime().ok_or_else(|| {
                    Error::version_store(format!(
                        "invalid last_modified for segment '{}'",
                        segment
                    ))
                })?;
                Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
            }
        };
        Ok((
            SegmentId::from_raw(segment),
            SegmentStamp::new(version, last_modified),
        ))
    }
}

#[async_trait]
impl VersionStore for SqlVersionStore {
    async fn load(
        &self,
        conn: &mut Connection,
        segments: &[(SegmentId, LockMode)],
    ) -> Result<HashMap<SegmentId, SegmentStamp>> {
        let mut stamps: HashMap<SegmentId, SegmentStamp> = segments
            .iter()
            .map(|(segment, _)| (segment.clone(), SegmentStamp::default()))
            .collect();

        // Row locks follow ascending segment id, the order of the in-process lock plan
        let mut ordered: Vec<&(SegmentId, LockMode)> = segments.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(&b.0));
        for (segment, mode) in ordered {
            let sql = self.select_sql(conn, segment, *mode);
            for row in conn.execute_query(&sql).await? {
                let (loaded, stamp) = Self::parse_row(&row)?;
                if let Some(slot) = stamps.get_mut(&loaded) {
                    *slot = stamp;
                }
            }
        }
        Ok(stamps)
    }

    async fn save(
        &self,
        conn: &mut Connection,
        segments: &[SegmentId],
        stamp: SegmentStamp,
    ) -> Result<()> {
        if segments.is_empty() {
            return Ok(());
        }
        let dialect = conn.dialect();
        let modified = match stamp.last_modified {
            Some(dt) => dialect.datetime_literal(dt),
            None => "NULL".to_string(),
        };
        let rows: Vec<String> = segments
            .iter()
            .map(|segment| {
                format!(
                    "({}, {}, {})",
                    dialect.string_literal(segment.as_str()),
                    stamp.version,
                    modified
                )
            })
            .collect();
        let sql = format!(
            "INSERT INTO {table} ({id}, {version}, {modified_col}) VALUES {rows} ON DUPLICATE KEY UPDATE {version} = {new_version}, {modified_col} = {new_modified}",
            table = dialect.identifier(&self.table),
            id = dialect.identifier("segment_id"),
            version = dialect.identifier("version"),
            modified_col = dialect.identifier("last_modified"),
            rows = rows.join(", "),
            new_version = dialect.upsert_value("version"),
            new_modified = dialect.upsert_value("last_modified"),
        );
        conn.execute_statement(&sql).await?;
        debug!(target: "tessera::monitor", segments = segments.len(), version = stamp.version, "Segment versions saved");
        Ok(())
    }
}
