//! Canonical SQLite schema for popular.
//!
//! Two groups of tables share one database:
//! - tally state owned by the gateway: `tallies`, `last_visits`, and the
//!   single-row `run_meta` holding the watermark
//! - host mirror tables the SQLite adapters read: `view_log`,
//!   `course_categories`, `courses`, `course_modules`, `users`

/// Migration v1: tally state and run metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tallies (
    kind TEXT NOT NULL CHECK (kind IN ('course_category', 'course', 'course_module')),
    instance_id INTEGER NOT NULL CHECK (instance_id <> 0),
    tallies TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (kind, instance_id)
);

CREATE TABLE IF NOT EXISTS last_visits (
    kind TEXT NOT NULL CHECK (kind IN ('course_category', 'course', 'course_module')),
    instance_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    last_visit INTEGER NOT NULL,
    PRIMARY KEY (kind, instance_id, user_id)
);

CREATE INDEX IF NOT EXISTS idx_last_visits_user
    ON last_visits(user_id);

CREATE TABLE IF NOT EXISTS run_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    last_run INTEGER,
    settings_fingerprint TEXT,
    last_run_at INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO run_meta (
    id,
    schema_version,
    last_run,
    settings_fingerprint,
    last_run_at
) VALUES (1, 1, NULL, NULL, 0);
";

/// Migration v2: host mirror tables read by the SQLite adapters.
pub const MIGRATION_V2_SQL: &str = r"
CREATE TABLE IF NOT EXISTS view_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    target TEXT NOT NULL,
    action TEXT NOT NULL DEFAULT 'viewed',
    instance_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL,
    course_id INTEGER NOT NULL DEFAULT 0,
    time_created INTEGER NOT NULL,
    ip TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_view_log_time
    ON view_log(time_created, id);

CREATE TABLE IF NOT EXISTS course_categories (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS courses (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS course_modules (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY,
    deleted INTEGER NOT NULL DEFAULT 0 CHECK (deleted IN (0, 1))
);

UPDATE run_meta
SET schema_version = 2
WHERE id = 1;
";

/// Indexes expected by the scan and purge paths.
pub const REQUIRED_INDEXES: &[&str] = &["idx_last_visits_user", "idx_view_log_time"];

#[cfg(test)]
mod tests {
    use crate::db::migrations;
    use rusqlite::{Connection, params};

    #[test]
    fn tally_primary_key_rejects_duplicates() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrations::migrate(&mut conn)?;

        conn.execute(
            "INSERT INTO tallies (kind, instance_id, tallies, updated_at) VALUES (?1, ?2, ?3, 0)",
            params!["course", 5, "{}"],
        )?;
        let dup = conn.execute(
            "INSERT INTO tallies (kind, instance_id, tallies, updated_at) VALUES (?1, ?2, ?3, 0)",
            params!["course", 5, "{}"],
        );
        assert!(dup.is_err());
        Ok(())
    }

    #[test]
    fn tally_kind_and_sentinel_are_checked() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrations::migrate(&mut conn)?;

        let bad_kind = conn.execute(
            "INSERT INTO tallies (kind, instance_id, tallies, updated_at) VALUES ('quiz', 1, '{}', 0)",
            [],
        );
        assert!(bad_kind.is_err());

        let sentinel = conn.execute(
            "INSERT INTO tallies (kind, instance_id, tallies, updated_at) VALUES ('course', 0, '{}', 0)",
            [],
        );
        assert!(sentinel.is_err());
        Ok(())
    }

    #[test]
    fn view_log_scan_uses_time_index() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrations::migrate(&mut conn)?;

        let plan: Vec<String> = conn
            .prepare(
                "EXPLAIN QUERY PLAN
                 SELECT instance_id FROM view_log
                 WHERE time_created > ?1
                 ORDER BY time_created, id",
            )?
            .query_map([0_i64], |row| row.get::<_, String>(3))?
            .collect::<rusqlite::Result<_>>()?;

        assert!(
            plan.iter().any(|detail| detail.contains("idx_view_log_time")),
            "expected time index in plan: {plan:?}"
        );
        Ok(())
    }
}
