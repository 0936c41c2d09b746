use anyhow::{Result, bail};
use clap::Args;
use popular_core::db::host::sqlite_directories;
use popular_core::model::{TargetKind, TimeWindow};
use popular_core::query::{RankedTally, TopItem, top_items, top_tallies};
use serde::Serialize;
use std::io::{self, Write};

use super::Context;
use crate::output::{pretty_rule, pretty_section, render_mode, window_label};

#[derive(Args, Debug)]
pub struct TopArgs {
    /// Kind to rank: category, course or module.
    pub kind: TargetKind,

    /// Window to rank by: all, day, week, month, year, or seconds.
    /// Defaults to the shortest configured window.
    #[arg(short, long, value_parser = parse_window)]
    pub window: Option<TimeWindow>,

    /// Maximum rows to return (0 for no limit).
    #[arg(short = 'n', long, default_value_t = 10)]
    pub limit: usize,

    /// Rank raw tallies by id, without host names or zero-count filtering.
    #[arg(long)]
    pub ids: bool,
}

/// Parse a window given by name or as seconds.
pub fn parse_window(raw: &str) -> Result<TimeWindow, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "all" | "all-time" | "alltime" => Ok(TimeWindow::ALL_TIME),
        "day" => Ok(TimeWindow::DAY),
        "week" => Ok(TimeWindow::WEEK),
        "month" => Ok(TimeWindow::MONTH),
        "year" => Ok(TimeWindow::YEAR),
        other => other
            .parse::<TimeWindow>()
            .map_err(|_| format!("invalid window '{raw}': expected all, day, week, month, year or seconds")),
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Ranking {
    Items(Vec<TopItem>),
    Tallies(Vec<RankedTally>),
}

#[derive(Debug, Serialize)]
struct TopOutput {
    kind: TargetKind,
    window: TimeWindow,
    rows: Ranking,
}

/// Run `popular top`.
///
/// # Errors
///
/// Returns an error if the window is not configured, the database cannot
/// be opened, or a host directory lookup fails.
pub fn run_top(args: &TopArgs, ctx: &Context) -> Result<()> {
    let settings = ctx.settings()?;
    let window = match args.window {
        Some(window) => window,
        None => settings.windows.first().copied().unwrap_or(TimeWindow::ALL_TIME),
    };
    if !settings.windows.contains(&window) {
        let configured: Vec<String> = settings.windows.iter().map(ToString::to_string).collect();
        bail!(
            "window {window} is not tallied (configured: {})",
            configured.join(", ")
        );
    }

    let store = ctx.open_store()?;
    let rows = if args.ids {
        Ranking::Tallies(top_tallies(
            &store,
            args.kind,
            window,
            args.limit,
            settings.site_course_id,
        )?)
    } else {
        let directories = sqlite_directories(store.connection());
        Ranking::Items(top_items(
            &store,
            &directories,
            args.kind,
            window,
            args.limit,
            settings.site_course_id,
        )?)
    };

    let output = TopOutput {
        kind: args.kind,
        window,
        rows,
    };
    render_mode(ctx.output, &output, render_text, render_pretty)
}

fn render_text(output: &TopOutput, w: &mut dyn Write) -> io::Result<()> {
    match &output.rows {
        Ranking::Items(items) => {
            for item in items {
                writeln!(w, "{}\t{}\t{}", item.identity.instance_id, item.count, item.record.name)?;
            }
        }
        Ranking::Tallies(tallies) => {
            for tally in tallies {
                writeln!(w, "{}\t{}", tally.identity.instance_id, tally.count)?;
            }
        }
    }
    Ok(())
}

fn render_pretty(output: &TopOutput, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(
        w,
        &format!("Top {} ({})", output.kind.short_name(), window_label(output.window)),
    )?;
    match &output.rows {
        Ranking::Items(items) if items.is_empty() => writeln!(w, "(no views)")?,
        Ranking::Tallies(tallies) if tallies.is_empty() => writeln!(w, "(no tallies)")?,
        Ranking::Items(items) => {
            for (rank, item) in items.iter().enumerate() {
                writeln!(
                    w,
                    "{:>3}. {:<48} {:>8}  #{}",
                    rank + 1,
                    item.record.name,
                    item.count,
                    item.identity.instance_id
                )?;
            }
        }
        Ranking::Tallies(tallies) => {
            for (rank, tally) in tallies.iter().enumerate() {
                writeln!(w, "{:>3}. #{:<46} {:>8}", rank + 1, tally.identity.instance_id, tally.count)?;
            }
        }
    }
    pretty_rule(w)
}
