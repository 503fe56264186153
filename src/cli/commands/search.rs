//! ferret search - Headless search
//!
//! Runs the same pipeline as the interactive reader (lexical, then query
//! embedding and cosine, then rerank) and prints the final ordering. The
//! search is recorded in history like an interactive one.

use std::time::Duration;

use clap::Args;
use colored::Colorize;
use serde::Serialize;

use crate::app::AppContext;
use crate::cli::output::{emit_json, robot_ok};
use crate::error::Result;
use crate::pipeline::{ListSnapshot, StageFlags, StageStatus};
use crate::search::{Provenance, ScoreKind};
use crate::storage::ItemId;

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Search query
    pub query: String,

    /// Maximum number of results to print
    #[arg(long, short, default_value = "20")]
    pub limit: usize,

    /// Run a user-gated (sequential) rerank before printing
    #[arg(long)]
    pub rerank: bool,

    /// Seconds to wait for background stages
    #[arg(long, default_value = "60")]
    pub wait: u64,
}

#[derive(Debug, Serialize)]
struct SearchOutput {
    query: String,
    stages: StageFlags,
    status: String,
    cached: bool,
    results: Vec<SearchHit>,
}

#[derive(Debug, Serialize)]
struct SearchHit {
    rank: usize,
    id: ItemId,
    title: String,
    feed: String,
    published_at: String,
    lexical: Option<f32>,
    cosine: Option<f32>,
    rerank: Option<f32>,
    provenance: String,
}

pub fn run(ctx: &AppContext, args: &SearchArgs) -> Result<()> {
    let (mut orchestrator, mut events) = ctx.orchestrator();
    let limit = Duration::from_secs(args.wait);

    let output = ctx.runtime.block_on(async {
        orchestrator.submit(&args.query, &ListSnapshot::default())?;
        orchestrator.drive_until_idle(&mut events, limit).await?;

        let rerank_available = orchestrator
            .session()
            .is_some_and(|session| session.stages().rerank == StageStatus::Available);
        if args.rerank && rerank_available && orchestrator.start_rerank() {
            orchestrator.drive_until_idle(&mut events, limit).await?;
        }

        let stages = orchestrator
            .session()
            .map(|session| *session.stages())
            .unwrap_or_default();
        let rows = orchestrator.visible();
        let cached = rows.first().is_some_and(|row| row.cached);
        let results = rows
            .iter()
            .take(args.limit)
            .enumerate()
            .map(|(idx, row)| SearchHit {
                rank: idx + 1,
                id: row.item.id,
                title: row.item.title.clone(),
                feed: row.item.feed.clone(),
                published_at: row.item.published_at.clone(),
                lexical: row.score.and_then(|s| s.lexical()),
                cosine: row.score.and_then(|s| s.cosine()),
                rerank: row.score.and_then(|s| s.rerank()),
                provenance: row
                    .score
                    .map_or_else(|| Provenance::empty().to_string(), |s| s.provenance().to_string()),
            })
            .collect();

        Ok::<_, crate::error::FerretError>(SearchOutput {
            query: args.query.clone(),
            stages,
            status: orchestrator.status().to_string(),
            cached,
            results,
        })
    })?;

    if ctx.robot_mode {
        emit_json(&robot_ok(output))
    } else {
        print_human(&output);
        Ok(())
    }
}

fn print_human(output: &SearchOutput) {
    let stages = &output.stages;
    println!(
        "{} {}  lexical:{} embedding:{} corpus:{} rerank:{}",
        "Search".bold(),
        format!("\"{}\"", output.query).cyan(),
        stages.lexical.label(),
        stages.embedding.label(),
        stages.corpus.label(),
        stages.rerank.label(),
    );
    if !output.status.is_empty() {
        println!("{}", output.status.dimmed());
    }
    println!();

    if output.results.is_empty() {
        println!("{}", "No results".yellow());
        return;
    }

    for hit in &output.results {
        let (kind, score) = best_score(hit);
        println!(
            "{:>3}. {} {} {}",
            hit.rank,
            format!("[{kind}] {score:>6.2}").green(),
            hit.title.bold(),
            format!("({}, {})", hit.feed, hit.provenance).dimmed()
        );
    }
}

fn best_score(hit: &SearchHit) -> (&'static str, f32) {
    let kind = if hit.rerank.is_some() {
        ScoreKind::Reranked
    } else if hit.cosine.is_some() {
        ScoreKind::Cosine
    } else {
        ScoreKind::Lexical
    };
    let score = hit.rerank.or(hit.cosine).or(hit.lexical).unwrap_or(0.0);
    (kind.label(), score)
}
