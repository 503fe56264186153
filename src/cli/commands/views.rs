//! ferret views - Saved views (pinned searches)

use clap::{Args, Subcommand};
use colored::Colorize;

use crate::app::AppContext;
use crate::cli::output::{emit_json, robot_ok};
use crate::error::Result;
use crate::views::{RefreshOutcome, RefreshReport};

#[derive(Args, Debug)]
pub struct ViewsArgs {
    #[command(subcommand)]
    pub command: ViewsCommand,
}

#[derive(Subcommand, Debug)]
pub enum ViewsCommand {
    /// List saved views
    List,
    /// Re-run saved views in the background and store fresh snapshots
    Refresh {
        /// Refresh only this history entry
        id: Option<i64>,
    },
}

pub fn run(ctx: &AppContext, args: &ViewsArgs) -> Result<()> {
    let views = ctx.saved_views();
    match &args.command {
        ViewsCommand::List => {
            let entries = views.list()?;
            if ctx.robot_mode {
                return emit_json(&robot_ok(entries));
            }
            if entries.is_empty() {
                println!("{}", "No saved views. Pin a search with `ferret history pin <id>`.".yellow());
            }
            for entry in &entries {
                println!(
                    "{:>4}  {}  {}",
                    entry.id.to_string().dimmed(),
                    entry.raw_query.bold(),
                    format!("{} results, refreshed {}", entry.result_count, entry.last_used_at)
                        .dimmed()
                );
            }
            Ok(())
        }
        ViewsCommand::Refresh { id } => {
            let reports = match id {
                Some(id) => vec![ctx.runtime.block_on(views.refresh(*id))?],
                None => ctx.runtime.block_on(views.refresh_all())?,
            };
            if ctx.robot_mode {
                return emit_json(&robot_ok(reports));
            }
            print_reports(&reports);
            Ok(())
        }
    }
}

fn print_reports(reports: &[RefreshReport]) {
    if reports.is_empty() {
        println!("{}", "No saved views to refresh".yellow());
        return;
    }
    for report in reports {
        let outcome = match &report.outcome {
            RefreshOutcome::Updated { rows } => format!("updated ({rows} results)").green(),
            RefreshOutcome::Superseded => "superseded".yellow(),
            RefreshOutcome::Failed { reason } => format!("failed: {reason}").red(),
        };
        println!("{:>4}  {}  {outcome}", report.history_id, report.query.bold());
    }
}
