//! CLI module - Command-line interface definitions and handlers
//!
//! Uses clap v4 with derive macros for argument parsing.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod commands;
pub mod output;

/// Ferret - terminal feed reader with progressive search
#[derive(Parser, Debug)]
#[command(name = "ferret")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Emit JSON on stdout and JSON logs on stderr
    #[arg(long, global = true)]
    pub robot: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file path (default: ~/.config/ferret/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory (default: ~/.local/share/ferret)
    #[arg(long, global = true, env = "FERRET_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Database file, overrides storage.db_path
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Commands that own the terminal must not log to it.
    #[must_use]
    pub const fn is_interactive(&self) -> bool {
        matches!(self.command, None | Some(Commands::Tui(_)))
    }
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Open the interactive reader (default)
    Tui(commands::tui::TuiArgs),

    /// Run a search headlessly and print the ranked results
    Search(commands::search::SearchArgs),

    /// Inspect and manage search history
    History(commands::history::HistoryArgs),

    /// Import feed items from a JSON file
    Import(commands::import::ImportArgs),

    /// Attach embeddings to items that have none
    Embed(commands::embed::EmbedArgs),

    /// List and refresh saved views (pinned searches)
    Views(commands::views::ViewsArgs),
}
