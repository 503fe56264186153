//! CLI command implementations
//!
//! Each subcommand has its own module with:
//! - Args struct for command-line arguments
//! - `run()` function to execute the command

use crate::app::AppContext;
use crate::cli::Commands;
use crate::error::Result;

pub mod embed;
pub mod history;
pub mod import;
pub mod search;
pub mod tui;
pub mod views;

/// Dispatch a command to its handler
pub fn run(ctx: &AppContext, command: Option<&Commands>) -> Result<()> {
    match command {
        None => tui::run(ctx, &tui::TuiArgs::default()),
        Some(Commands::Tui(args)) => tui::run(ctx, args),
        Some(Commands::Search(args)) => search::run(ctx, args),
        Some(Commands::History(args)) => history::run(ctx, args),
        Some(Commands::Import(args)) => import::run(ctx, args),
        Some(Commands::Embed(args)) => embed::run(ctx, args),
        Some(Commands::Views(args)) => views::run(ctx, args),
    }
}
