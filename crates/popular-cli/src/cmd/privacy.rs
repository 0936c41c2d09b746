use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use popular_core::model::{TargetIdentity, TargetKind};
use popular_core::privacy::{
    UserVisit, delete_for_identity, delete_for_kind, delete_user, delete_users_for_identity,
    export_user,
};
use serde::Serialize;
use std::io::{self, Write};

use super::Context;
use crate::output::{format_timestamp, pretty_kv, pretty_section, render_mode};

#[derive(Subcommand, Debug)]
pub enum PrivacyCommand {
    #[command(
        about = "Export a user's last visits",
        after_help = "EXAMPLES:\n    # Everything recorded about user 7\n    popular privacy export --user 7 --json"
    )]
    Export(ExportArgs),

    #[command(
        about = "Erase last visits",
        long_about = "Erase last-visit rows by user, by content node, or by kind. Tallies are anonymous and are never touched.",
        after_help = "EXAMPLES:\n    # Forget user 7 everywhere\n    popular privacy forget --user 7\n\n    # Forget users 7 and 8 on course 5\n    popular privacy forget --kind course --id 5 --users 7,8\n\n    # Forget every visit on modules\n    popular privacy forget --kind module"
    )]
    Forget(ForgetArgs),
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// User id to export.
    #[arg(long)]
    pub user: i64,
}

#[derive(Args, Debug)]
pub struct ForgetArgs {
    /// Erase every last visit of this user.
    #[arg(long, conflicts_with = "kind")]
    pub user: Option<i64>,

    /// Erase last visits of this kind (narrow with --id).
    #[arg(long)]
    pub kind: Option<TargetKind>,

    /// Instance id within --kind.
    #[arg(long, requires = "kind")]
    pub id: Option<i64>,

    /// Only these users on --kind/--id.
    #[arg(long, requires = "id", value_delimiter = ',')]
    pub users: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct ExportOutput {
    user_id: i64,
    visits: Vec<UserVisit>,
}

#[derive(Debug, Serialize)]
struct ForgetOutput {
    scope: String,
    removed: usize,
}

/// Run `popular privacy <export|forget>`.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or a query fails.
pub fn run_privacy(command: &PrivacyCommand, ctx: &Context) -> Result<()> {
    match command {
        PrivacyCommand::Export(args) => run_export(args, ctx),
        PrivacyCommand::Forget(args) => run_forget(args, ctx),
    }
}

fn run_export(args: &ExportArgs, ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    let output = ExportOutput {
        user_id: args.user,
        visits: export_user(&store, args.user)?,
    };
    render_mode(
        ctx.output,
        &output,
        |output, w| {
            for visit in &output.visits {
                writeln!(w, "{}\t{}", visit.identity, visit.last_visit)?;
            }
            Ok(())
        },
        |output, w| {
            pretty_section(w, &format!("Last visits of user {}", output.user_id))?;
            if output.visits.is_empty() {
                return writeln!(w, "(none)");
            }
            for visit in &output.visits {
                writeln!(w, "{:<24} {}", visit.identity.to_string(), format_timestamp(visit.last_visit))?;
            }
            Ok(())
        },
    )
}

fn run_forget(args: &ForgetArgs, ctx: &Context) -> Result<()> {
    let store = ctx.open_store()?;
    let (scope, removed) = match (args.user, args.kind, args.id) {
        (Some(user), None, None) => (format!("user {user}"), delete_user(&store, user)?),
        (None, Some(kind), Some(id)) => {
            let identity = TargetIdentity::new(kind, id);
            if args.users.is_empty() {
                (identity.to_string(), delete_for_identity(&store, identity)?)
            } else {
                let removed = delete_users_for_identity(&store, identity, &args.users)?;
                (format!("{identity} users {:?}", args.users), removed)
            }
        }
        (None, Some(kind), None) => (kind.to_string(), delete_for_kind(&store, kind)?),
        _ => bail!("pass either --user or --kind [--id [--users]]"),
    };

    let output = ForgetOutput { scope, removed };
    render_mode(ctx.output, &output, render_forget, |output, w| {
        pretty_section(w, "Forget")?;
        pretty_kv(w, "Scope", &output.scope)?;
        pretty_kv(w, "Removed rows", output.removed.to_string())
    })
}

fn render_forget(output: &ForgetOutput, w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "forget: scope={} removed={}", output.scope, output.removed)
}
