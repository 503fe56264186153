//! ferret history - Inspect and manage search history

use clap::{Args, Subcommand};
use colored::Colorize;
use serde::Serialize;

use crate::app::AppContext;
use crate::cli::output::{emit_json, robot_ok};
use crate::error::{FerretError, Result};
use crate::storage::{HistoryEntry, HistoryResult};

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[command(subcommand)]
    pub command: HistoryCommand,
}

#[derive(Subcommand, Debug)]
pub enum HistoryCommand {
    /// List past searches, most recently used first
    List {
        #[arg(long, short, default_value = "50")]
        limit: usize,
    },
    /// Show one entry with its stored result snapshot
    Show { id: i64 },
    /// Pin an entry (keeps it out of retention and makes it a saved view)
    Pin { id: i64 },
    /// Unpin an entry
    Unpin { id: i64 },
    /// Delete an entry and its snapshot
    Rm { id: i64 },
}

#[derive(Debug, Serialize)]
struct EntryWithResults {
    #[serde(flatten)]
    entry: HistoryEntry,
    results: Vec<HistoryResult>,
}

pub fn run(ctx: &AppContext, args: &HistoryArgs) -> Result<()> {
    match &args.command {
        HistoryCommand::List { limit } => list(ctx, *limit),
        HistoryCommand::Show { id } => show(ctx, *id),
        HistoryCommand::Pin { id } => set_pinned(ctx, *id, true),
        HistoryCommand::Unpin { id } => set_pinned(ctx, *id, false),
        HistoryCommand::Rm { id } => remove(ctx, *id),
    }
}

fn list(ctx: &AppContext, limit: usize) -> Result<()> {
    let entries = ctx.db.read(|db| db.list_history(limit))?;
    if ctx.robot_mode {
        return emit_json(&robot_ok(entries));
    }

    if entries.is_empty() {
        println!("{}", "No searches yet".yellow());
        return Ok(());
    }
    for entry in &entries {
        let pin = if entry.pinned { "*" } else { " " };
        println!(
            "{pin} {:>4}  {}  {}",
            entry.id.to_string().dimmed(),
            entry.raw_query.bold(),
            format!(
                "{} results, used {}x, last {}",
                entry.result_count, entry.use_count, entry.last_used_at
            )
            .dimmed()
        );
    }
    Ok(())
}

fn show(ctx: &AppContext, id: i64) -> Result<()> {
    let (entry, results) = ctx.db.read(|db| {
        let entry = db
            .get_history(id)?
            .ok_or_else(|| FerretError::NotFound(format!("history entry {id}")))?;
        let results = db.history_results(id)?;
        Ok((entry, results))
    })?;

    if ctx.robot_mode {
        return emit_json(&robot_ok(EntryWithResults { entry, results }));
    }

    println!("{} {}", "Query".bold(), entry.raw_query.cyan());
    println!("  normalized: {}", entry.normalized_query);
    println!("  backend: {}  took {} ms", entry.backend, entry.duration_ms);
    println!("  pinned: {}  used {}x", entry.pinned, entry.use_count);
    println!();
    let ids: Vec<_> = results.iter().map(|row| row.item_id).collect();
    let items = ctx.db.read(|db| db.get_items(&ids))?;
    for row in &results {
        let title = items
            .iter()
            .find(|item| item.id == row.item_id)
            .map_or("(deleted)", |item| item.title.as_str());
        println!("{:>3}. {}", row.rank, title);
    }
    Ok(())
}

fn set_pinned(ctx: &AppContext, id: i64, pinned: bool) -> Result<()> {
    if !ctx.db.write(|db| db.set_pinned(id, pinned))? {
        return Err(FerretError::NotFound(format!("history entry {id}")));
    }
    tracing::info!(id, pinned, "history pin changed");
    report(ctx, id, if pinned { "pinned" } else { "unpinned" })
}

fn remove(ctx: &AppContext, id: i64) -> Result<()> {
    if !ctx.db.write(|db| db.delete_history(id))? {
        return Err(FerretError::NotFound(format!("history entry {id}")));
    }
    report(ctx, id, "deleted")
}

fn report(ctx: &AppContext, id: i64, action: &str) -> Result<()> {
    if ctx.robot_mode {
        emit_json(&robot_ok(serde_json::json!({ "id": id, "action": action })))
    } else {
        println!("{} history entry {id}", action.green());
        Ok(())
    }
}
