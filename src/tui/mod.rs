//! Terminal presentation for ferret.
//!
//! Renders an [`App`] with ratatui and feeds it crossterm key events. Each
//! tick first applies pending pipeline events, then draws, then waits briefly
//! for input, so results stream in while the user types.

pub mod render;

use std::io::{self, IsTerminal, Stdout};
use std::time::Duration;

use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};

use crate::error::{FerretError, Result};
use crate::ui::{App, AppAction};

const TICK: Duration = Duration::from_millis(50);

/// RAII Guard to ensure terminal state is restored even on panic.
struct TerminalGuard;

impl TerminalGuard {
    fn new() -> Result<Self> {
        enable_raw_mode()?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen, DisableMouseCapture);
    }
}

/// Run the interactive reader until the user quits.
pub fn run(app: &mut App) -> Result<()> {
    if !io::stdout().is_terminal() {
        return Err(FerretError::Io(io::Error::other(
            "the reader requires an interactive terminal",
        )));
    }

    let _guard = TerminalGuard::new()?;
    let mut terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
    tracing::info!("tui started");
    let outcome = event_loop(&mut terminal, app);
    tracing::info!(ok = outcome.is_ok(), "tui stopped");
    outcome
}

fn event_loop(terminal: &mut Terminal<CrosstermBackend<Stdout>>, app: &mut App) -> Result<()> {
    loop {
        app.pump();
        terminal.draw(|f| render::draw(f, app))?;

        if event::poll(TICK)? {
            if let Event::Key(key) = event::read()? {
                if app.handle_key(key) == AppAction::Quit {
                    return Ok(());
                }
            }
        }
    }
}
