//! Interactive state: modes, key bindings and the [`App`] state machine.
//!
//! Nothing here touches the terminal. The `tui` module renders an [`App`]
//! and feeds it key events.

pub mod app;
pub mod keys;
pub mod mode;

pub use app::{App, AppAction};
pub use keys::{GlobalAction, global_action};
pub use mode::{Mode, ModeStack};
