//! ferret import - Load feed items from a JSON file
//!
//! Accepts either a JSON array of items or an object with an `items` array.
//! Items are upserted by `guid`; re-importing a file updates in place.

use std::path::PathBuf;

use clap::Args;
use colored::Colorize;
use serde::{Deserialize, Serialize};

use crate::app::AppContext;
use crate::cli::output::{emit_json, robot_ok};
use crate::error::{FerretError, Result};
use crate::storage::NewItem;

#[derive(Args, Debug)]
pub struct ImportArgs {
    /// JSON file with items
    pub file: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ImportFile {
    Items(Vec<NewItem>),
    Wrapped { items: Vec<NewItem> },
}

#[derive(Debug, Serialize)]
struct ImportReport {
    file: String,
    imported: usize,
    skipped: usize,
    total_items: u64,
}

pub fn run(ctx: &AppContext, args: &ImportArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.file)?;
    let items = parse_items(&raw)?;

    let (valid, skipped): (Vec<NewItem>, Vec<NewItem>) = items
        .into_iter()
        .partition(|item| !item.guid.trim().is_empty() && !item.title.trim().is_empty());
    for item in &skipped {
        tracing::warn!(guid = %item.guid, "skipping item without guid or title");
    }

    let ids = ctx.db.write(|db| db.upsert_items(&valid))?;
    let total_items = ctx.db.read(|db| db.count_items())?;
    ctx.corpus.invalidate();
    tracing::info!(imported = ids.len(), skipped = skipped.len(), "items imported");

    let report = ImportReport {
        file: args.file.display().to_string(),
        imported: ids.len(),
        skipped: skipped.len(),
        total_items,
    };
    if ctx.robot_mode {
        return emit_json(&robot_ok(report));
    }

    println!(
        "{} {} items from {} ({} skipped, {} total)",
        "Imported".green().bold(),
        report.imported,
        report.file,
        report.skipped,
        report.total_items
    );
    if report.imported > 0 {
        println!("Run {} to enable semantic search for them.", "ferret embed".cyan());
    }
    Ok(())
}

fn parse_items(raw: &str) -> Result<Vec<NewItem>> {
    match serde_json::from_str::<ImportFile>(raw) {
        Ok(ImportFile::Items(items) | ImportFile::Wrapped { items }) => Ok(items),
        Err(err) => Err(FerretError::Import(format!("invalid item file: {err}"))),
    }
}
