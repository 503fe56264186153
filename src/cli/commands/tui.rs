//! ferret tui - Interactive reader

use clap::Args;

use crate::app::AppContext;
use crate::error::Result;
use crate::ui::App;

#[derive(Args, Debug, Default)]
pub struct TuiArgs {
    /// Start with this search instead of the item list
    #[arg(long, short)]
    pub query: Option<String>,
}

pub fn run(ctx: &AppContext, args: &TuiArgs) -> Result<()> {
    let (orchestrator, events) = ctx.orchestrator();
    let mut app = App::new(std::sync::Arc::clone(&ctx.db), orchestrator, events)?;
    if let Some(query) = args.query.as_deref() {
        app.search(query);
    }
    crate::tui::run(&mut app)
}
