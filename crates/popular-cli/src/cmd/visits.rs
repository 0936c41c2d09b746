use anyhow::Result;
use clap::Args;
use popular_core::model::{TargetIdentity, TargetKind};
use popular_core::query::{VisitRow, last_visits_for};
use serde::Serialize;
use std::io::{self, Write};

use super::Context;
use crate::output::{format_timestamp, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct VisitsArgs {
    /// Kind of the content node: category, course or module.
    pub kind: TargetKind,

    /// Instance id of the content node.
    pub id: i64,
}

#[derive(Debug, Serialize)]
struct VisitsOutput {
    identity: TargetIdentity,
    visits: Vec<VisitRow>,
}

/// Run `popular visits`: last visit of each tracked user on one node.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or read.
pub fn run_visits(args: &VisitsArgs, ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    let identity = TargetIdentity::new(args.kind, args.id);
    let output = VisitsOutput {
        identity,
        visits: last_visits_for(&store, identity)?,
    };
    render_mode(ctx.output, &output, render_text, render_pretty)
}

fn render_text(output: &VisitsOutput, w: &mut dyn Write) -> io::Result<()> {
    for row in &output.visits {
        writeln!(w, "{}\t{}", row.user_id, row.last_visit)?;
    }
    Ok(())
}

fn render_pretty(output: &VisitsOutput, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("Last visits: {}", output.identity))?;
    if output.visits.is_empty() {
        return writeln!(w, "(none)");
    }
    for row in &output.visits {
        writeln!(w, "{:>10}  {}", row.user_id, format_timestamp(row.last_visit))?;
    }
    Ok(())
}
