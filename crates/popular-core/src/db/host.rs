//! SQLite implementations of the host seams in [`crate::host`].
//!
//! Every adapter borrows a connection. Sharing the store's connection puts
//! the watermark update inside the run's transaction.

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::collections::HashSet;
use std::ops::ControlFlow;

use crate::error::HostError;
use crate::host::{
    ActiveUserDirectory, DirectoryTable, EventSource, Hosts, IdentityRecord, KindDirectory,
    Watermark, WatermarkStore,
};
use crate::model::{TargetKind, ViewEvent};

/// Action recorded for view events in `view_log`.
pub const VIEWED_ACTION: &str = "viewed";

// ---------------------------------------------------------------------------
// Event source
// ---------------------------------------------------------------------------

pub struct SqliteEventSource<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteEventSource<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl EventSource for SqliteEventSource<'_> {
    fn scan(
        &self,
        after: Option<i64>,
        kinds: &[TargetKind],
        visit: &mut dyn FnMut(ViewEvent) -> ControlFlow<()>,
    ) -> Result<u64, HostError> {
        if kinds.is_empty() {
            return Ok(0);
        }

        let placeholders = (0..kinds.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT target, instance_id, user_id, course_id, time_created, ip
             FROM view_log
             WHERE action = ?1
               AND (?2 IS NULL OR time_created > ?2)
               AND target IN ({placeholders})
             ORDER BY time_created, id"
        );

        let mut values: Vec<rusqlite::types::Value> = vec![
            VIEWED_ACTION.to_string().into(),
            after.map_or(rusqlite::types::Value::Null, Into::into),
        ];
        values.extend(kinds.iter().map(|k| k.as_str().to_string().into()));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut delivered = 0_u64;

        while let Some(row) = rows.next()? {
            let target: String = row.get(0)?;
            let kind = target
                .parse::<TargetKind>()
                .map_err(|err| HostError::InvalidRow(err.to_string()))?;
            let event = ViewEvent {
                kind,
                instance_id: row.get(1)?,
                user_id: row.get(2)?,
                course_id: row.get(3)?,
                timestamp: row.get(4)?,
                origin_ip: row.get(5)?,
            };
            delivered += 1;
            if visit(event).is_break() {
                break;
            }
        }

        Ok(delivered)
    }
}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

pub struct SqliteKindDirectory<'c> {
    conn: &'c Connection,
    kind: TargetKind,
}

impl<'c> SqliteKindDirectory<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection, kind: TargetKind) -> Self {
        Self { conn, kind }
    }
}

impl KindDirectory for SqliteKindDirectory<'_> {
    fn exists(&self, instance_id: i64) -> Result<bool, HostError> {
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)",
            self.kind.host_table()
        );
        Ok(self.conn.query_row(&sql, params![instance_id], |row| row.get(0))?)
    }

    fn lookup(&self, instance_id: i64) -> Result<Option<IdentityRecord>, HostError> {
        let sql = format!("SELECT id, name FROM {} WHERE id = ?1", self.kind.host_table());
        Ok(self
            .conn
            .query_row(&sql, params![instance_id], |row| {
                Ok(IdentityRecord {
                    instance_id: row.get(0)?,
                    name: row.get(1)?,
                })
            })
            .optional()?)
    }
}

/// A directory table backed by the three host tables of `conn`.
#[must_use]
pub fn sqlite_directories(conn: &Connection) -> DirectoryTable<'_> {
    DirectoryTable::new(
        Box::new(SqliteKindDirectory::new(conn, TargetKind::Category)),
        Box::new(SqliteKindDirectory::new(conn, TargetKind::Course)),
        Box::new(SqliteKindDirectory::new(conn, TargetKind::Module)),
    )
}

pub struct SqliteUsers<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteUsers<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl ActiveUserDirectory for SqliteUsers<'_> {
    fn active_user_ids(&self) -> Result<HashSet<i64>, HostError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id FROM users WHERE deleted = 0")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<i64>>>()?;
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Watermark
// ---------------------------------------------------------------------------

pub struct SqliteWatermark<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteWatermark<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Forget the watermark so the next run rebuilds from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`HostError`] if the update fails.
    pub fn clear(&self) -> Result<(), HostError> {
        self.conn.execute(
            "UPDATE run_meta SET last_run = NULL, settings_fingerprint = NULL WHERE id = 1",
            [],
        )?;
        Ok(())
    }
}

impl WatermarkStore for SqliteWatermark<'_> {
    fn last_run(&self) -> Result<Option<Watermark>, HostError> {
        let (at, fingerprint): (Option<i64>, Option<String>) = self.conn.query_row(
            "SELECT last_run, settings_fingerprint FROM run_meta WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(at.map(|at| Watermark {
            at,
            settings_fingerprint: fingerprint.unwrap_or_default(),
        }))
    }

    fn set_last_run(&self, mark: &Watermark) -> Result<(), HostError> {
        let updated = self.conn.execute(
            "UPDATE run_meta
             SET last_run = ?1, settings_fingerprint = ?2, last_run_at = ?3
             WHERE id = 1",
            params![mark.at, mark.settings_fingerprint, chrono::Utc::now().timestamp()],
        )?;
        if updated == 0 {
            return Err(HostError::InvalidRow("run_meta row is missing".to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// All four SQLite adapters over one connection.
pub struct SqliteHost<'c> {
    pub events: SqliteEventSource<'c>,
    pub directories: DirectoryTable<'c>,
    pub users: SqliteUsers<'c>,
    pub watermark: SqliteWatermark<'c>,
}

impl<'c> SqliteHost<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            events: SqliteEventSource::new(conn),
            directories: sqlite_directories(conn),
            users: SqliteUsers::new(conn),
            watermark: SqliteWatermark::new(conn),
        }
    }

    #[must_use]
    pub fn hosts(&self) -> Hosts<'_> {
        Hosts {
            events: &self.events,
            directories: &self.directories,
            users: &self.users,
            watermark: &self.watermark,
        }
    }
}

// ---------------------------------------------------------------------------
// Host-side writes (ingest)
// ---------------------------------------------------------------------------

/// Writes to the host tables, used by `popular ingest` and tests.
pub struct HostWriter<'c> {
    conn: &'c Connection,
}

impl<'c> HostWriter<'c> {
    #[must_use]
    pub const fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Append a view event to `view_log`.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails.
    pub fn insert_view(&self, event: &ViewEvent) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO view_log (target, action, instance_id, user_id, course_id, time_created, ip)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.kind.as_str(),
                VIEWED_ACTION,
                event.instance_id,
                event.user_id,
                event.course_id,
                event.timestamp,
                event.origin_ip,
            ],
        )?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn upsert_identity(&self, kind: TargetKind, record: &IdentityRecord) -> rusqlite::Result<()> {
        let sql = format!(
            "INSERT INTO {} (id, name) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name",
            kind.host_table()
        );
        self.conn
            .execute(&sql, params![record.instance_id, record.name])?;
        Ok(())
    }

    /// Returns `true` if a row was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn delete_identity(&self, kind: TargetKind, instance_id: i64) -> rusqlite::Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", kind.host_table());
        Ok(self.conn.execute(&sql, params![instance_id])? > 0)
    }

    /// # Errors
    ///
    /// Returns an error if the upsert fails.
    pub fn upsert_user(&self, user_id: i64, deleted: bool) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO users (id, deleted) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET deleted = excluded.deleted",
            params![user_id, i64::from(deleted)],
        )?;
        Ok(())
    }
}
