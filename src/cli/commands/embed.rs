//! ferret embed - Attach embeddings to items that have none
//!
//! Uses the configured query embedder so item and query vectors live in the
//! same space.

use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::app::AppContext;
use crate::backend::{QueryEmbedder, guarded};
use crate::cli::output::{emit_json, robot_ok};
use crate::error::{FerretError, Result};

#[derive(Args, Debug)]
pub struct EmbedArgs {
    /// Items per embedder call
    #[arg(long, default_value = "32")]
    pub batch: usize,

    /// Stop after this many items (default: all)
    #[arg(long)]
    pub max: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbedReport {
    backend: String,
    embedded: usize,
    remaining: u64,
}

pub fn run(ctx: &AppContext, args: &EmbedArgs) -> Result<()> {
    let batch = args.batch.max(1);
    let max = args.max.unwrap_or(usize::MAX);
    let embedder = &ctx.backends.embedder;
    let timeout = ctx.backends.timeouts.embed;
    let cancel = CancellationToken::new();

    let mut embedded = 0;
    while embedded < max {
        let take = batch.min(max - embedded);
        let items = ctx.db.read(|db| db.items_missing_embedding(take))?;
        if items.is_empty() {
            break;
        }
        let texts: Vec<String> = items.iter().map(|item| item.document_text()).collect();
        let vectors = ctx
            .runtime
            .block_on(guarded("embed", &cancel, timeout, embed_all(embedder.as_ref(), &texts)))?;
        if vectors.len() != items.len() {
            return Err(FerretError::backend(
                embedder.name(),
                format!("expected {} vectors, got {}", items.len(), vectors.len()),
            ));
        }

        ctx.db.write(|db| {
            for (item, vector) in items.iter().zip(&vectors) {
                db.set_item_embedding(item.id, vector)?;
            }
            Ok(())
        })?;
        embedded += items.len();
        tracing::debug!(embedded, "embedded batch");
    }

    ctx.corpus.invalidate();
    let remaining = ctx.db.read(|db| db.count_missing_embeddings())?;
    let report = EmbedReport {
        backend: embedder.name().to_string(),
        embedded,
        remaining,
    };

    if ctx.robot_mode {
        return emit_json(&robot_ok(report));
    }
    println!(
        "{} {} items with {} ({} still without embeddings)",
        "Embedded".green().bold(),
        report.embedded,
        report.backend.cyan(),
        report.remaining
    );
    Ok(())
}

async fn embed_all(embedder: &dyn QueryEmbedder, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    embedder.embed_batch(texts).await
}
