//! Integration tests: full tally runs (host tables → reconcile → fold →
//! commit → watermark → cache).
//!
//! Covers:
//!   - Cold start full rebuild and incremental catch-up
//!   - Idempotent re-runs and replay after an aborted run
//!   - Deletion reconciliation and degraded directories
//!   - Settings changes forcing a rebuild
//!   - Deferred future events, cancellation and the run lock

use popular_core::config::TallySettings;
use popular_core::db::host::{HostWriter, SqliteHost};
use popular_core::db::store::TallyStore;
use popular_core::error::{ErrorCode, HostError, TallyError};
use popular_core::host::{
    EventSource, Hosts, IdentityRecord, KindDirectory, DirectoryTable, Watermark, WatermarkStore,
};
use popular_core::lock::RunLock;
use popular_core::model::{TargetIdentity, TargetKind, TimeWindow, ViewEvent};
use popular_core::query;
use popular_core::run::{RebuildReason, RunMode, RunOptions, RunReport, TallyRun};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

const T: i64 = 1_700_000_000;
const COURSE_5: TargetIdentity = TargetIdentity::new(TargetKind::Course, 5);
const COURSE_6: TargetIdentity = TargetIdentity::new(TargetKind::Course, 6);
const MODULE_9: TargetIdentity = TargetIdentity::new(TargetKind::Module, 9);

fn settings(windows: &[TimeWindow], debounce: i64) -> TallySettings {
    TallySettings {
        windows: windows.to_vec(),
        debounce_interval: debounce,
        ..TallySettings::default()
    }
}

/// Store with courses 5 and 6, module 9, and users 1, 7 and 8.
fn seeded_store() -> TallyStore {
    let store = TallyStore::in_memory().expect("in-memory store");
    let writer = HostWriter::new(store.connection());
    for (identity, name) in [(COURSE_5, "Algebra"), (COURSE_6, "Biology"), (MODULE_9, "Quiz")] {
        writer
            .upsert_identity(
                identity.kind,
                &IdentityRecord {
                    instance_id: identity.instance_id,
                    name: name.to_string(),
                },
            )
            .expect("seed identity");
    }
    for user in [1, 7, 8] {
        writer.upsert_user(user, false).expect("seed user");
    }
    store
}

fn view(identity: TargetIdentity, user_id: i64, timestamp: i64) -> ViewEvent {
    ViewEvent {
        kind: identity.kind,
        instance_id: identity.instance_id,
        user_id,
        course_id: 0,
        timestamp,
        origin_ip: "192.0.2.10".to_string(),
    }
}

fn log(store: &TallyStore, events: &[ViewEvent]) {
    let writer = HostWriter::new(store.connection());
    for event in events {
        writer.insert_view(event).expect("insert view");
    }
}

fn run_at(store: &TallyStore, settings: &TallySettings, now: i64) -> Result<RunReport, TallyError> {
    let host = SqliteHost::new(store.connection());
    TallyRun::new(store, host.hosts(), settings).execute(&RunOptions {
        now: Some(now),
        ..RunOptions::default()
    })
}

fn count(store: &TallyStore, identity: TargetIdentity, window: TimeWindow) -> u64 {
    store
        .read_tally(identity)
        .expect("read tally")
        .map_or(0, |v| v.count(window))
}

fn watermark(store: &TallyStore) -> Option<i64> {
    let host = SqliteHost::new(store.connection());
    host.watermark
        .last_run()
        .expect("read watermark")
        .map(|mark| mark.at)
}

// ---------------------------------------------------------------------------
// Modes and watermark
// ---------------------------------------------------------------------------

#[test]
fn repeat_views_within_interval_count_once() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 3600);
    log(&store, &[view(COURSE_5, 7, 100), view(COURSE_5, 7, 200)]);

    run_at(&store, &settings, 1_000).expect("run");
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 1);
}

#[test]
fn first_run_rebuilds_then_catches_up() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME, TimeWindow::DAY], 3600);
    log(&store, &[view(COURSE_5, 7, T - 90_000), view(COURSE_5, 8, T - 100)]);

    let first = run_at(&store, &settings, T).expect("first run");
    assert_eq!(
        first.mode,
        RunMode::Full {
            reason: RebuildReason::NoWatermark
        }
    );
    assert_eq!(first.watermark_from, None);
    assert_eq!(first.watermark_to, T);
    assert_eq!(watermark(&store), Some(T));
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 2);
    assert_eq!(count(&store, COURSE_5, TimeWindow::DAY), 1);

    log(&store, &[view(COURSE_5, 7, T + 50)]);
    let second = run_at(&store, &settings, T + 100).expect("second run");
    assert_eq!(second.mode, RunMode::Incremental { after: T });
    assert_eq!(second.scanned, 1);
    assert_eq!(second.events.tallied, 1);
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 3);
    assert_eq!(watermark(&store), Some(T + 100));
}

#[test]
fn rerun_over_same_range_changes_nothing() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    log(&store, &[view(COURSE_5, 7, T - 10), view(MODULE_9, 8, T - 5)]);

    run_at(&store, &settings, T).expect("first run");
    let before = store.read_kind_tallies(TargetKind::Course).expect("read");

    let again = run_at(&store, &settings, T + 1).expect("second run");
    assert_eq!(again.scanned, 0);
    assert_eq!(again.tallies_written, 0);
    assert_eq!(store.read_kind_tallies(TargetKind::Course).expect("read"), before);
}

#[test]
fn debounce_state_carries_across_runs() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 3600);

    log(&store, &[view(COURSE_5, 7, T)]);
    run_at(&store, &settings, T + 10).expect("first run");

    log(&store, &[view(COURSE_5, 7, T + 500)]);
    let report = run_at(&store, &settings, T + 600).expect("second run");
    assert_eq!(report.events.debounced, 1);
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 1);
}

#[test]
fn future_events_are_left_for_the_next_run() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    log(&store, &[view(COURSE_5, 7, T - 1), view(COURSE_5, 8, T + 30)]);

    let first = run_at(&store, &settings, T).expect("first run");
    assert_eq!(first.events.tallied, 1);
    assert_eq!(first.events.deferred, 1);

    let second = run_at(&store, &settings, T + 60).expect("second run");
    assert_eq!(second.events.tallied, 1);
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 2);
}

#[test]
fn settings_change_forces_rebuild() {
    let store = seeded_store();
    log(&store, &[view(COURSE_5, 7, T - 100), view(COURSE_5, 7, T - 50)]);

    run_at(&store, &settings(&[TimeWindow::ALL_TIME], 3600), T).expect("first run");
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 1);

    let report = run_at(&store, &settings(&[TimeWindow::ALL_TIME], 0), T + 10).expect("rebuild");
    assert_eq!(
        report.mode,
        RunMode::Full {
            reason: RebuildReason::SettingsChanged
        }
    );
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 2);
}

#[test]
fn forced_rebuild_matches_incremental_history() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME, TimeWindow::YEAR], 3600);

    log(&store, &[view(COURSE_5, 7, T), view(COURSE_6, 8, T + 10)]);
    run_at(&store, &settings, T + 100).expect("run 1");
    log(&store, &[view(COURSE_5, 7, T + 200), view(COURSE_5, 7, T + 4000)]);
    run_at(&store, &settings, T + 5000).expect("run 2");
    let incremental = store.read_kind_tallies(TargetKind::Course).expect("read");

    let host = SqliteHost::new(store.connection());
    let report = TallyRun::new(&store, host.hosts(), &settings)
        .execute(&RunOptions {
            now: Some(T + 5000),
            force_rebuild: true,
            ..RunOptions::default()
        })
        .expect("rebuild");
    assert!(report.mode.is_full());
    assert_eq!(store.read_kind_tallies(TargetKind::Course).expect("read"), incremental);
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[test]
fn deleted_identity_is_purged_and_not_resurrected() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    log(&store, &[view(COURSE_6, 7, T - 10)]);
    run_at(&store, &settings, T).expect("first run");
    assert_eq!(count(&store, COURSE_6, TimeWindow::ALL_TIME), 1);

    HostWriter::new(store.connection())
        .delete_identity(TargetKind::Course, 6)
        .expect("delete course");
    log(&store, &[view(COURSE_6, 8, T + 5)]);

    let report = run_at(&store, &settings, T + 10).expect("second run");
    assert_eq!(report.deleted, vec![COURSE_6]);
    assert_eq!(report.events.skipped_deleted, 1);
    assert!(store.read_tally(COURSE_6).expect("read").is_none());
    assert!(
        !store
            .read_kind_visits(TargetKind::Course)
            .expect("read")
            .contains_key(&6)
    );
}

#[test]
fn deleted_user_loses_visits_but_counts_stay() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 3600);
    log(&store, &[view(COURSE_5, 8, T - 10)]);
    run_at(&store, &settings, T).expect("first run");

    HostWriter::new(store.connection())
        .upsert_user(8, true)
        .expect("delete user");
    let report = run_at(&store, &settings, T + 10).expect("second run");

    assert_eq!(report.purged_visits, 1);
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 1);
    assert!(query::last_visits_for(&store, COURSE_5).expect("visits").is_empty());
}

struct Offline;

impl KindDirectory for Offline {
    fn exists(&self, _: i64) -> Result<bool, HostError> {
        Err(HostError::Unavailable("directory offline".into()))
    }

    fn lookup(&self, _: i64) -> Result<Option<IdentityRecord>, HostError> {
        Err(HostError::Unavailable("directory offline".into()))
    }
}

#[test]
fn unreachable_directory_degrades_the_run() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    log(&store, &[view(COURSE_5, 7, T - 10)]);
    run_at(&store, &settings, T).expect("first run");

    log(&store, &[view(COURSE_5, 7, T + 5)]);
    let host = SqliteHost::new(store.connection());
    let offline = DirectoryTable::new(Box::new(Offline), Box::new(Offline), Box::new(Offline));
    let hosts = Hosts {
        directories: &offline,
        ..host.hosts()
    };
    let report = TallyRun::new(&store, hosts, &settings)
        .execute(&RunOptions {
            now: Some(T + 10),
            ..RunOptions::default()
        })
        .expect("degraded run still commits");

    assert!(report.degraded);
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 2);
    assert_eq!(watermark(&store), Some(T + 10));
}

// ---------------------------------------------------------------------------
// Failure and abort
// ---------------------------------------------------------------------------

struct BrokenLog;

impl EventSource for BrokenLog {
    fn scan(
        &self,
        _: Option<i64>,
        _: &[TargetKind],
        visit: &mut dyn FnMut(ViewEvent) -> ControlFlow<()>,
    ) -> Result<u64, HostError> {
        let _ = visit(view(COURSE_5, 7, T - 1));
        Err(HostError::Unavailable("log offline".into()))
    }
}

struct ReadOnlyMark<'a>(&'a dyn WatermarkStore);

impl WatermarkStore for ReadOnlyMark<'_> {
    fn last_run(&self) -> Result<Option<Watermark>, HostError> {
        self.0.last_run()
    }

    fn set_last_run(&self, _: &Watermark) -> Result<(), HostError> {
        Err(HostError::Unavailable("watermark store is read-only".into()))
    }
}

#[test]
fn source_failure_aborts_without_writes() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    let host = SqliteHost::new(store.connection());
    let hosts = Hosts {
        events: &BrokenLog,
        ..host.hosts()
    };

    let err = TallyRun::new(&store, hosts, &settings)
        .execute(&RunOptions {
            now: Some(T),
            ..RunOptions::default()
        })
        .expect_err("run must fail");
    assert_eq!(err.code(), ErrorCode::SourceReadFailed);
    assert!(err.code().is_retryable());
    assert_eq!(watermark(&store), None);
    assert!(store.read_tally(COURSE_5).expect("read").is_none());
}

#[test]
fn failed_watermark_write_rolls_back_and_replays_cleanly() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    log(&store, &[view(COURSE_5, 7, T - 10), view(COURSE_5, 8, T - 5)]);

    let host = SqliteHost::new(store.connection());
    let read_only = ReadOnlyMark(&host.watermark);
    let hosts = Hosts {
        watermark: &read_only,
        ..host.hosts()
    };
    let err = TallyRun::new(&store, hosts, &settings)
        .execute(&RunOptions {
            now: Some(T),
            ..RunOptions::default()
        })
        .expect_err("run must fail");
    assert_eq!(err.code(), ErrorCode::WatermarkFailed);
    assert!(store.read_tally(COURSE_5).expect("read").is_none());
    assert!(store.cache().tallies(TargetKind::Course).is_none());

    run_at(&store, &settings, T).expect("replay");
    assert_eq!(count(&store, COURSE_5, TimeWindow::ALL_TIME), 2);
}

#[test]
fn cancelled_run_commits_nothing() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    log(&store, &[view(COURSE_5, 7, T - 10)]);

    let host = SqliteHost::new(store.connection());
    let err = TallyRun::new(&store, host.hosts(), &settings)
        .execute(&RunOptions {
            now: Some(T),
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..RunOptions::default()
        })
        .expect_err("cancelled");
    assert!(matches!(err, TallyError::Cancelled));
    assert_eq!(watermark(&store), None);
}

#[test]
fn held_run_lock_blocks_a_second_run() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    let dir = tempfile::tempdir().expect("temp dir");
    let lock_path = dir.path().join("popular.sqlite3.lock");
    let _held = RunLock::acquire(&lock_path, Duration::from_millis(10)).expect("first lock");

    let host = SqliteHost::new(store.connection());
    let err = TallyRun::new(&store, host.hosts(), &settings)
        .execute(&RunOptions {
            now: Some(T),
            lock_path: Some(lock_path),
            lock_timeout: Duration::from_millis(50),
            ..RunOptions::default()
        })
        .expect_err("lock held");
    assert_eq!(err.code(), ErrorCode::LockContention);
}

// ---------------------------------------------------------------------------
// Cache and queries
// ---------------------------------------------------------------------------

#[test]
fn committed_run_replaces_cached_rankings() {
    let store = seeded_store();
    let settings = settings(&[TimeWindow::ALL_TIME], 0);
    log(&store, &[view(COURSE_5, 7, T - 10)]);
    run_at(&store, &settings, T).expect("first run");

    let ranked = query::top_tallies(&store, TargetKind::Course, TimeWindow::ALL_TIME, 0, 1)
        .expect("top tallies");
    assert_eq!(ranked.len(), 1);

    log(&store, &[view(COURSE_6, 7, T + 1), view(COURSE_6, 8, T + 2)]);
    run_at(&store, &settings, T + 10).expect("second run");

    let host = SqliteHost::new(store.connection());
    let items = query::top_items(
        &store,
        &host.directories,
        TargetKind::Course,
        TimeWindow::ALL_TIME,
        0,
        1,
    )
    .expect("top items");
    let names: Vec<&str> = items.iter().map(|i| i.record.name.as_str()).collect();
    assert_eq!(names, vec!["Biology", "Algebra"]);
}
