//! Persistence gateway for tallies and last visits.
//!
//! [`TallyStore`] owns the connection and the per-kind [`TallyCache`].
//! Writes are upserts keyed by identity (and user for visits), so replaying
//! a run over the same range rewrites the same rows instead of adding to
//! them. A run commits through [`TallyStore::transaction`] and then calls
//! [`TallyStore::replace_cache`]; nothing patches the cache mid-run.

use anyhow::Context;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::BTreeMap;
use std::path::Path;

use super::cache::{KindTallies, KindVisits, TallyCache};
use crate::codec::{decode_tally, encode_tally};
use crate::error::TallyError;
use crate::model::{TallySnapshot, TallyVector, TargetIdentity, TargetKind, TimeWindow, VisitMap};

impl ToSql for TargetKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TargetKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}

/// Row counts written by [`TallyStore::write_snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub tallies: usize,
    pub visits: usize,
}

pub struct TallyStore {
    conn: Connection,
    cache: TallyCache,
}

impl TallyStore {
    #[must_use]
    pub fn new(conn: Connection) -> Self {
        Self {
            conn,
            cache: TallyCache::new(),
        }
    }

    /// Open the database at `path` (creating and migrating it as needed).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = super::open_database(path)
            .with_context(|| format!("open tally store {}", path.display()))?;
        Ok(Self::new(conn))
    }

    /// # Errors
    ///
    /// Returns an error if the in-memory schema cannot be created.
    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(super::open_in_memory()?))
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub const fn cache(&self) -> &TallyCache {
        &self.cache
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert or replace the tally of `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the upsert fails.
    pub fn write_tally(&self, identity: TargetIdentity, vector: &TallyVector) -> Result<(), TallyError> {
        let blob = encode_tally(vector).map_err(|source| TallyError::CorruptTally { identity, source })?;
        self.conn.execute(
            "INSERT INTO tallies (kind, instance_id, tallies, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, instance_id) DO UPDATE SET
                tallies = excluded.tallies,
                updated_at = excluded.updated_at",
            params![
                identity.kind,
                identity.instance_id,
                blob,
                chrono::Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }

    /// Insert or replace one last-visit row.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the upsert fails.
    pub fn write_last_visit(
        &self,
        identity: TargetIdentity,
        user_id: i64,
        timestamp: i64,
    ) -> Result<(), TallyError> {
        self.conn.execute(
            "INSERT INTO last_visits (kind, instance_id, user_id, last_visit)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(kind, instance_id, user_id) DO UPDATE SET
                last_visit = excluded.last_visit",
            params![identity.kind, identity.instance_id, user_id, timestamp],
        )?;
        Ok(())
    }

    /// Remove the tally and every last visit of `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if a delete fails.
    pub fn delete_identity(&self, identity: TargetIdentity) -> Result<usize, TallyError> {
        let tallies = self.conn.execute(
            "DELETE FROM tallies WHERE kind = ?1 AND instance_id = ?2",
            params![identity.kind, identity.instance_id],
        )?;
        let visits = self.delete_visits_for_identity(identity)?;
        Ok(tallies + visits)
    }

    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the delete fails.
    pub fn delete_last_visit(&self, identity: TargetIdentity, user_id: i64) -> Result<bool, TallyError> {
        let removed = self.conn.execute(
            "DELETE FROM last_visits WHERE kind = ?1 AND instance_id = ?2 AND user_id = ?3",
            params![identity.kind, identity.instance_id, user_id],
        )?;
        Ok(removed > 0)
    }

    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the delete fails.
    pub fn delete_visits_for_identity(&self, identity: TargetIdentity) -> Result<usize, TallyError> {
        Ok(self.conn.execute(
            "DELETE FROM last_visits WHERE kind = ?1 AND instance_id = ?2",
            params![identity.kind, identity.instance_id],
        )?)
    }

    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the delete fails.
    pub fn delete_visits_for_kind(&self, kind: TargetKind) -> Result<usize, TallyError> {
        Ok(self
            .conn
            .execute("DELETE FROM last_visits WHERE kind = ?1", params![kind])?)
    }

    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the delete fails.
    pub fn delete_visits_for_user(&self, user_id: i64) -> Result<usize, TallyError> {
        Ok(self
            .conn
            .execute("DELETE FROM last_visits WHERE user_id = ?1", params![user_id])?)
    }

    /// Drop every tally and last visit, as the first step of a full rebuild.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if a delete fails.
    pub fn purge_all(&self) -> Result<(), TallyError> {
        self.conn
            .execute_batch("DELETE FROM tallies; DELETE FROM last_visits;")?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Read every tally of `kind` from durable storage, bypassing the cache.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::CorruptTally`] for an undecodable blob or
    /// [`TallyError::Persistence`] if the query fails.
    pub fn read_kind_tallies(&self, kind: TargetKind) -> Result<BTreeMap<i64, TallyVector>, TallyError> {
        let mut out = BTreeMap::new();
        for (instance_id, raw) in self.raw_tallies(kind)? {
            let identity = TargetIdentity::new(kind, instance_id);
            let vector =
                decode_tally(&raw).map_err(|source| TallyError::CorruptTally { identity, source })?;
            out.insert(instance_id, vector);
        }
        Ok(out)
    }

    /// Read every last visit of `kind` from durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the query fails.
    pub fn read_kind_visits(&self, kind: TargetKind) -> Result<BTreeMap<i64, VisitMap>, TallyError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT instance_id, user_id, last_visit FROM last_visits WHERE kind = ?1",
        )?;
        let rows = stmt.query_map(params![kind], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut out: BTreeMap<i64, VisitMap> = BTreeMap::new();
        for row in rows {
            let (instance_id, user_id, at) = row?;
            out.entry(instance_id).or_default().insert(user_id, at);
        }
        Ok(out)
    }

    /// Read one tally from durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::CorruptTally`] for an undecodable blob or
    /// [`TallyError::Persistence`] if the query fails.
    pub fn read_tally(&self, identity: TargetIdentity) -> Result<Option<TallyVector>, TallyError> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT tallies FROM tallies WHERE kind = ?1 AND instance_id = ?2",
                params![identity.kind, identity.instance_id],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| decode_tally(&raw).map_err(|source| TallyError::CorruptTally { identity, source }))
            .transpose()
    }

    /// Tallies of `kind`, served from the cache and filled from storage on a
    /// miss. Undecodable rows are logged and left out.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the fill query fails.
    pub fn kind_tallies(&self, kind: TargetKind) -> Result<KindTallies, TallyError> {
        if let Some(cached) = self.cache.tallies(kind) {
            return Ok(cached);
        }

        let mut tallies = BTreeMap::new();
        for (instance_id, raw) in self.raw_tallies(kind)? {
            match decode_tally(&raw) {
                Ok(vector) => {
                    tallies.insert(instance_id, vector);
                }
                Err(error) => tracing::warn!(
                    kind = %kind,
                    instance_id,
                    error = %error,
                    "skipping corrupt tally row"
                ),
            }
        }
        tracing::debug!(kind = %kind, rows = tallies.len(), "filled tally cache");
        Ok(self.cache.put_tallies(kind, tallies))
    }

    /// Last visits of `kind`, read through the cache.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Persistence`] if the fill query fails.
    pub fn kind_visits(&self, kind: TargetKind) -> Result<KindVisits, TallyError> {
        if let Some(cached) = self.cache.visits(kind) {
            return Ok(cached);
        }
        let visits = self.read_kind_visits(kind)?;
        Ok(self.cache.put_visits(kind, visits))
    }

    /// Load every kind's durable state into a clean snapshot, conforming
    /// stored vectors to `windows`.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::CorruptTally`] for an undecodable blob or
    /// [`TallyError::Persistence`] if a query fails.
    pub fn load_snapshot(&self, windows: &[TimeWindow]) -> Result<TallySnapshot, TallyError> {
        let mut snapshot = TallySnapshot::default();
        for kind in TargetKind::ALL {
            for (instance_id, mut vector) in self.read_kind_tallies(kind)? {
                vector.conform(windows);
                snapshot.load_tally(TargetIdentity::new(kind, instance_id), vector);
            }
            for (instance_id, visits) in self.read_kind_visits(kind)? {
                let identity = TargetIdentity::new(kind, instance_id);
                for (user_id, at) in visits {
                    snapshot.load_visit(identity, user_id, at);
                }
            }
        }
        Ok(snapshot)
    }

    /// Upsert the rows of `snapshot` that changed since it was loaded.
    ///
    /// # Errors
    ///
    /// Returns the first write failure.
    pub fn write_snapshot(&self, snapshot: &TallySnapshot) -> Result<WriteStats, TallyError> {
        let mut stats = WriteStats::default();
        for (identity, vector) in snapshot.dirty_tallies() {
            self.write_tally(identity, vector)?;
            stats.tallies += 1;
        }
        for (identity, user_id, at) in snapshot.dirty_visits() {
            self.write_last_visit(identity, user_id, at)?;
            stats.visits += 1;
        }
        Ok(stats)
    }

    /// Replace every per-kind cache entry with the committed `snapshot`.
    pub fn replace_cache(&self, snapshot: &TallySnapshot) {
        for kind in TargetKind::ALL {
            self.cache.put_tallies(kind, snapshot.kind_tallies(kind));
            self.cache.put_visits(kind, snapshot.kind_visits(kind));
        }
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Run `f` inside `BEGIN IMMEDIATE` and commit on success. Any error
    /// rolls back every write made by `f`.
    ///
    /// # Errors
    ///
    /// Returns the error from `f`, or [`TallyError::Persistence`] if the
    /// transaction cannot be opened or committed.
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T, TallyError>) -> Result<T, TallyError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(value) => {
                if let Err(err) = self.conn.execute_batch("COMMIT") {
                    self.rollback();
                    return Err(err.into());
                }
                Ok(value)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    fn rollback(&self) {
        if let Err(error) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %error, "rollback failed");
        }
    }

    fn raw_tallies(&self, kind: TargetKind) -> Result<Vec<(i64, String)>, TallyError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT instance_id, tallies FROM tallies WHERE kind = ?1")?;
        let rows = stmt
            .query_map(params![kind], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
