use anyhow::Result;
use clap::Args;
use popular_core::db::host::SqliteHost;
use popular_core::lock::RunLock;
use popular_core::run::{RebuildReason, RunMode, RunOptions, RunReport, TallyRun};
use std::io::{self, Write};

use super::Context;
use crate::output::{format_timestamp, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Reference time in Unix seconds instead of the wall clock.
    #[arg(long, value_name = "SECS")]
    pub now: Option<i64>,

    /// Rebuild every tally from the whole log, even if the watermark is current.
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct RebuildArgs {
    /// Reference time in Unix seconds instead of the wall clock.
    #[arg(long, value_name = "SECS")]
    pub now: Option<i64>,
}

/// Run `popular run`: catch tallies up from the watermark.
///
/// # Errors
///
/// Returns an error if settings are invalid, the database cannot be opened,
/// or the run aborts. A degraded run is not an error.
pub fn run_tally(args: &RunArgs, ctx: &Context) -> Result<()> {
    execute(ctx, args.now, args.force)
}

/// Run `popular rebuild`: purge and recompute every tally.
///
/// # Errors
///
/// Same as [`run_tally`].
pub fn run_rebuild(args: &RebuildArgs, ctx: &Context) -> Result<()> {
    execute(ctx, args.now, true)
}

fn execute(ctx: &Context, now: Option<i64>, force_rebuild: bool) -> Result<()> {
    let settings = ctx.settings()?;
    let store = ctx.open_store()?;
    let host = SqliteHost::new(store.connection());

    let options = RunOptions {
        now,
        force_rebuild,
        lock_path: Some(RunLock::path_for(&ctx.db_path)),
        lock_timeout: ctx.config.storage.lock_timeout(),
        cancel: None,
    };
    let report = TallyRun::new(&store, host.hosts(), &settings).execute(&options)?;

    render_mode(ctx.output, &report, render_text, render_pretty)
}

fn mode_text(mode: RunMode) -> String {
    match mode {
        RunMode::Full { reason } => format!("full reason={}", reason_name(reason)),
        RunMode::Incremental { after } => format!("incremental after={after}"),
    }
}

const fn reason_name(reason: RebuildReason) -> &'static str {
    match reason {
        RebuildReason::NoWatermark => "no_watermark",
        RebuildReason::SettingsChanged => "settings_changed",
        RebuildReason::Requested => "requested",
    }
}

fn render_text(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    let events = &report.events;
    writeln!(
        w,
        "run: mode={} now={} watermark={} scanned={} tallied={} debounced={} blacklisted={} \
         skipped_sentinel={} skipped_deleted={} deferred={} deleted={} purged_visits={} degraded={} \
         elapsed_ms={}",
        mode_text(report.mode),
        report.now,
        report.watermark_to,
        report.scanned,
        events.tallied,
        events.debounced,
        events.blacklisted,
        events.skipped_sentinel,
        events.skipped_deleted,
        events.deferred,
        report.deleted.len(),
        report.purged_visits,
        report.degraded,
        report.elapsed_ms,
    )?;
    for line in &report.delta {
        writeln!(w, "delta {} {}", line.identity, line.tallied)?;
    }
    Ok(())
}

fn render_pretty(report: &RunReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, "Tally run")?;
    match report.mode {
        RunMode::Full { reason } => {
            pretty_kv(w, "Mode", format!("full rebuild ({})", reason_name(reason)))?;
        }
        RunMode::Incremental { after } => {
            pretty_kv(w, "Mode", format!("incremental since {}", format_timestamp(after)))?;
        }
    }
    pretty_kv(w, "Now", format_timestamp(report.now))?;
    pretty_kv(w, "Watermark", format_timestamp(report.watermark_to))?;
    pretty_kv(w, "Scanned", report.scanned.to_string())?;
    pretty_kv(w, "Tallied", report.events.tallied.to_string())?;
    pretty_kv(w, "Debounced", report.events.debounced.to_string())?;
    pretty_kv(w, "Blacklisted", report.events.blacklisted.to_string())?;
    pretty_kv(
        w,
        "Skipped",
        format!(
            "{} sentinel, {} deleted",
            report.events.skipped_sentinel, report.events.skipped_deleted
        ),
    )?;
    pretty_kv(w, "Deferred", report.events.deferred.to_string())?;
    pretty_kv(w, "Deleted", report.deleted.len().to_string())?;
    pretty_kv(w, "Purged visits", report.purged_visits.to_string())?;
    if report.degraded {
        pretty_kv(w, "Reconciliation", "degraded (directory unavailable)")?;
    }
    pretty_kv(w, "Elapsed", format!("{} ms", report.elapsed_ms))?;

    if !report.delta.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Delta")?;
        for line in &report.delta {
            writeln!(w, "{:<24} +{}", line.identity.to_string(), line.tallied)?;
        }
    }
    Ok(())
}
