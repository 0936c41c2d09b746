//! One tally run: pick the mode, reconcile, fold new events, commit, and
//! advance the watermark.
//!
//! Everything a run writes (purges, tallies, last visits, watermark) goes
//! through one `BEGIN IMMEDIATE` transaction on the store. Any failure or
//! cancellation rolls it back, so the watermark and the tallies never
//! disagree. The per-kind cache is replaced only after the commit.

use serde::Serialize;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::aggregate::{Aggregator, EventCounts, Outcome};
use crate::config::TallySettings;
use crate::db::store::{TallyStore, WriteStats};
use crate::error::TallyError;
use crate::host::{Hosts, Watermark};
use crate::lock::RunLock;
use crate::model::{DeltaReport, TallySnapshot, TargetIdentity, TargetKind, ViewEvent};
use crate::reconcile::{ReconcileReport, Reconciler};

/// Why a run rebuilt from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    /// No run has completed yet.
    NoWatermark,
    /// Windows, debounce, blacklist or anonymous counting changed.
    SettingsChanged,
    /// The caller asked for it.
    Requested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RunMode {
    Full { reason: RebuildReason },
    Incremental { after: i64 },
}

impl RunMode {
    /// Exclusive lower bound of the scan.
    #[must_use]
    pub const fn scan_after(self) -> Option<i64> {
        match self {
            Self::Full { .. } => None,
            Self::Incremental { after } => Some(after),
        }
    }

    #[must_use]
    pub const fn is_full(self) -> bool {
        matches!(self, Self::Full { .. })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Reference time for windows and the new watermark; defaults to the
    /// wall clock.
    pub now: Option<i64>,
    /// Rebuild even when the watermark is current.
    pub force_rebuild: bool,
    /// Hold this advisory lock file for the duration of the run.
    pub lock_path: Option<PathBuf>,
    pub lock_timeout: Duration,
    /// Checked before each event; a set flag aborts the run.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// One non-zero line of the delta report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeltaLine {
    pub identity: TargetIdentity,
    pub tallied: u64,
}

/// Outcome of a committed run, for the scheduler and operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    #[serde(flatten)]
    pub mode: RunMode,
    pub now: i64,
    pub watermark_from: Option<i64>,
    pub watermark_to: i64,
    pub scanned: u64,
    pub events: EventCounts,
    pub deleted: Vec<TargetIdentity>,
    pub purged_visits: usize,
    pub degraded: bool,
    pub tallies_written: usize,
    pub visits_written: usize,
    pub elapsed_ms: u64,
    /// Identities seen this run, including those with nothing tallied.
    pub touched: usize,
    /// Identities that gained tallies, in identity order.
    pub delta: Vec<DeltaLine>,
}

/// A configured run over one store and one set of hosts.
pub struct TallyRun<'a> {
    store: &'a TallyStore,
    hosts: Hosts<'a>,
    settings: &'a TallySettings,
}

struct Committed {
    snapshot: TallySnapshot,
    delta: DeltaReport,
    counts: EventCounts,
    scanned: u64,
    reconcile: ReconcileReport,
    written: WriteStats,
    watermark_to: i64,
}

impl<'a> TallyRun<'a> {
    #[must_use]
    pub const fn new(store: &'a TallyStore, hosts: Hosts<'a>, settings: &'a TallySettings) -> Self {
        Self {
            store,
            hosts,
            settings,
        }
    }

    /// Decide between a full rebuild and an incremental catch-up.
    ///
    /// # Errors
    ///
    /// Returns [`TallyError::Watermark`] if the watermark cannot be read.
    pub fn plan(&self, force_rebuild: bool) -> Result<(RunMode, Option<Watermark>), TallyError> {
        let previous = self.hosts.watermark.last_run().map_err(TallyError::Watermark)?;
        let mode = match &previous {
            _ if force_rebuild => RunMode::Full {
                reason: RebuildReason::Requested,
            },
            None => RunMode::Full {
                reason: RebuildReason::NoWatermark,
            },
            Some(mark) if mark.settings_fingerprint != self.settings.fingerprint() => RunMode::Full {
                reason: RebuildReason::SettingsChanged,
            },
            Some(mark) => RunMode::Incremental { after: mark.at },
        };
        Ok((mode, previous))
    }

    /// Execute one run.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; nothing is committed in that case
    /// and the watermark is unchanged.
    pub fn execute(&self, options: &RunOptions) -> Result<RunReport, TallyError> {
        let started = Instant::now();
        let _lock = options
            .lock_path
            .as_deref()
            .map(|path| RunLock::acquire(path, options.lock_timeout))
            .transpose()?;

        let now = options.now.unwrap_or_else(|| chrono::Utc::now().timestamp());
        let (mode, previous) = self.plan(options.force_rebuild)?;
        tracing::info!(?mode, now, "starting tally run");

        let active_users = self
            .hosts
            .users
            .active_user_ids()
            .map_err(TallyError::SourceRead)?;

        let committed = self.store.transaction(|store| {
            let mut snapshot;
            let reconcile;
            if mode.is_full() {
                store.purge_all()?;
                snapshot = TallySnapshot::default();
                reconcile = ReconcileReport::default();
            } else {
                snapshot = store.load_snapshot(&self.settings.windows)?;
                reconcile = Reconciler::new(self.hosts.directories, &active_users)
                    .reconcile(store, &mut snapshot)?;
            }

            let aggregator = Aggregator::new(self.settings, &active_users, &reconcile.deleted, now);
            let mut delta = DeltaReport::default();
            let mut counts = EventCounts::default();
            let mut cancelled = false;

            let scanned = self
                .hosts
                .events
                .scan(mode.scan_after(), &TargetKind::ALL, &mut |event: ViewEvent| {
                    if options
                        .cancel
                        .as_ref()
                        .is_some_and(|flag| flag.load(Ordering::Relaxed))
                    {
                        cancelled = true;
                        return ControlFlow::Break(());
                    }
                    let outcome = aggregator.apply(&mut snapshot, &mut delta, &event);
                    counts.record(outcome);
                    if outcome == Outcome::Deferred {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                })
                .map_err(TallyError::SourceRead)?;

            if cancelled {
                return Err(TallyError::Cancelled);
            }

            let written = store.write_snapshot(&snapshot)?;

            let watermark_to = match mode {
                RunMode::Incremental { after } if now <= after => {
                    tracing::warn!(now, watermark = after, "clock did not advance; keeping watermark");
                    after
                }
                _ => now,
            };
            self.hosts
                .watermark
                .set_last_run(&Watermark {
                    at: watermark_to,
                    settings_fingerprint: self.settings.fingerprint(),
                })
                .map_err(TallyError::Watermark)?;

            snapshot.clear_dirty();
            Ok(Committed {
                snapshot,
                delta,
                counts,
                scanned,
                reconcile,
                written,
                watermark_to,
            })
        })?;

        self.store.replace_cache(&committed.snapshot);

        let report = RunReport {
            mode,
            now,
            watermark_from: previous.map(|mark| mark.at),
            watermark_to: committed.watermark_to,
            scanned: committed.scanned,
            events: committed.counts,
            deleted: committed.reconcile.deleted.into_iter().collect(),
            purged_visits: committed.reconcile.purged_visits,
            degraded: committed.reconcile.degraded,
            tallies_written: committed.written.tallies,
            visits_written: committed.written.visits,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            touched: committed.delta.len(),
            delta: committed
                .delta
                .nonzero()
                .map(|(identity, tallied)| DeltaLine { identity, tallied })
                .collect(),
        };

        tracing::info!(
            full = mode.is_full(),
            scanned = report.scanned,
            tallied = report.events.tallied,
            debounced = report.events.debounced,
            blacklisted = report.events.blacklisted,
            deferred = report.events.deferred,
            deleted = report.deleted.len(),
            purged_visits = report.purged_visits,
            degraded = report.degraded,
            watermark = report.watermark_to,
            elapsed_ms = report.elapsed_ms,
            "tally run complete"
        );

        Ok(report)
    }
}
