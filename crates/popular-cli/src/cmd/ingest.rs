//! Load host data (view log, identity directories, users) from JSON lines.
//!
//! One record per line, tagged by `type`:
//!
//! ```text
//! {"type":"view","kind":"course","instance_id":5,"user_id":7,"timestamp":1700000000,"origin_ip":"192.0.2.1"}
//! {"type":"identity","kind":"course","instance_id":5,"name":"Algebra"}
//! {"type":"remove_identity","kind":"course","instance_id":5}
//! {"type":"user","user_id":7,"deleted":false}
//! ```

use anyhow::{Context as _, Result};
use clap::Args;
use popular_core::db::host::HostWriter;
use popular_core::host::IdentityRecord;
use popular_core::model::{TargetKind, ViewEvent};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use super::Context;
use crate::output::{pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct IngestArgs {
    /// JSON-lines file to load, or `-` for stdin.
    #[arg(value_name = "FILE")]
    pub input: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record {
    View(ViewEvent),
    Identity {
        kind: TargetKind,
        instance_id: i64,
        name: String,
    },
    RemoveIdentity {
        kind: TargetKind,
        instance_id: i64,
    },
    User {
        user_id: i64,
        #[serde(default)]
        deleted: bool,
    },
}

#[derive(Debug, Default, Serialize)]
struct IngestReport {
    views: usize,
    identities: usize,
    removed_identities: usize,
    users: usize,
}

fn parse_records(reader: impl BufRead) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read line {}", index + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let record = serde_json::from_str::<Record>(trimmed)
            .with_context(|| format!("Invalid record on line {}", index + 1))?;
        records.push(record);
    }
    Ok(records)
}

/// Run `popular ingest`. Every record is parsed before anything is
/// written, and all writes land in one transaction.
///
/// # Errors
///
/// Returns an error if the input cannot be read, a line is malformed, or
/// a write fails.
pub fn run_ingest(args: &IngestArgs, ctx: &Context) -> Result<()> {
    let records = if args.input.as_os_str() == "-" {
        parse_records(io::stdin().lock())?
    } else {
        let file = File::open(&args.input)
            .with_context(|| format!("Failed to open {}", args.input.display()))?;
        parse_records(BufReader::new(file))?
    };

    let store = ctx.open_store()?;
    let report = store.transaction(|store| {
        let writer = HostWriter::new(store.connection());
        let mut report = IngestReport::default();
        for record in &records {
            match record {
                Record::View(event) => {
                    writer.insert_view(event)?;
                    report.views += 1;
                }
                Record::Identity {
                    kind,
                    instance_id,
                    name,
                } => {
                    writer.upsert_identity(
                        *kind,
                        &IdentityRecord {
                            instance_id: *instance_id,
                            name: name.clone(),
                        },
                    )?;
                    report.identities += 1;
                }
                Record::RemoveIdentity { kind, instance_id } => {
                    if writer.delete_identity(*kind, *instance_id)? {
                        report.removed_identities += 1;
                    }
                }
                Record::User { user_id, deleted } => {
                    writer.upsert_user(*user_id, *deleted)?;
                    report.users += 1;
                }
            }
        }
        Ok(report)
    })?;

    tracing::info!(
        views = report.views,
        identities = report.identities,
        removed = report.removed_identities,
        users = report.users,
        "ingested host records"
    );
    render_mode(ctx.output, &report, render_text, render_pretty)
}

fn render_text(report: &IngestReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "ingest: views={} identities={} removed_identities={} users={}",
        report.views, report.identities, report.removed_identities, report.users
    )
}

fn render_pretty(report: &IngestReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, "Ingest")?;
    pretty_kv(w, "Views", report.views.to_string())?;
    pretty_kv(w, "Identities", report.identities.to_string())?;
    pretty_kv(w, "Removed", report.removed_identities.to_string())?;
    pretty_kv(w, "Users", report.users.to_string())
}
