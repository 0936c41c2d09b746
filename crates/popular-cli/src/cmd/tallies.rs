use anyhow::Result;
use clap::Args;
use popular_core::model::{TallyVector, TargetKind, TimeWindow};
use serde::Serialize;
use std::io::{self, Write};

use super::Context;
use crate::output::{pretty_section, render_mode, window_label};

#[derive(Args, Debug)]
pub struct TalliesArgs {
    /// Kind to list: category, course or module.
    pub kind: TargetKind,

    /// Show only this instance id.
    #[arg(long)]
    pub id: Option<i64>,
}

#[derive(Debug, Serialize)]
struct TallyRow {
    instance_id: i64,
    tallies: TallyVector,
}

#[derive(Debug, Serialize)]
struct TalliesOutput {
    kind: TargetKind,
    windows: Vec<TimeWindow>,
    rows: Vec<TallyRow>,
}

/// Run `popular tallies`: dump committed tally vectors of one kind.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or read.
pub fn run_tallies(args: &TalliesArgs, ctx: &Context) -> Result<()> {
    let settings = ctx.settings()?;
    let store = ctx.open_store()?;
    let tallies = store.kind_tallies(args.kind)?;

    let rows = tallies
        .iter()
        .filter(|(id, _)| args.id.is_none_or(|wanted| wanted == **id))
        .map(|(id, vector)| TallyRow {
            instance_id: *id,
            tallies: vector.clone(),
        })
        .collect();

    let output = TalliesOutput {
        kind: args.kind,
        windows: settings.windows,
        rows,
    };
    render_mode(ctx.output, &output, render_text, render_pretty)
}

fn render_text(output: &TalliesOutput, w: &mut dyn Write) -> io::Result<()> {
    for row in &output.rows {
        let counts: Vec<String> = output
            .windows
            .iter()
            .map(|window| format!("{window}={}", row.tallies.count(*window)))
            .collect();
        writeln!(w, "{}\t{}", row.instance_id, counts.join(" "))?;
    }
    Ok(())
}

fn render_pretty(output: &TalliesOutput, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("Tallies: {}", output.kind.short_name()))?;
    if output.rows.is_empty() {
        return writeln!(w, "(none)");
    }
    write!(w, "{:>10}", "id")?;
    for window in &output.windows {
        write!(w, " {:>12}", window_label(*window))?;
    }
    writeln!(w)?;
    for row in &output.rows {
        write!(w, "{:>10}", row.instance_id)?;
        for window in &output.windows {
            write!(w, " {:>12}", row.tallies.count(*window))?;
        }
        writeln!(w)?;
    }
    Ok(())
}
