use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// Bindings checked before any mode-specific handling. No mode may shadow
/// them, including text entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalAction {
    Quit,
    Cancel,
    ToggleDiagnostics,
}

pub fn global_action(key: &KeyEvent) -> Option<GlobalAction> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    match key.code {
        KeyCode::Char('q' | 'Q') if ctrl => Some(GlobalAction::Quit),
        KeyCode::Char('c' | 'C') if ctrl => Some(GlobalAction::Cancel),
        KeyCode::F(12) => Some(GlobalAction::ToggleDiagnostics),
        _ => None,
    }
}

/// Footer hint per mode.
pub const fn help_line(mode: crate::ui::Mode) -> &'static str {
    use crate::ui::Mode;
    match mode {
        Mode::Browsing => "j/k move  /: search  H: history  p: more like this  s: save  Enter: read  q: quit",
        Mode::Composing => "Enter: search  Esc: back  Backspace: delete",
        Mode::ViewingResults => {
            "j/k move  /: refine  r: rerank  p: more like this  H: history  Enter: read  Esc: cancel/back"
        }
        Mode::BrowsingHistory => "j/k move  Enter: re-run  P: pin  d: delete  Esc: back",
        Mode::ReadingArticle => "p: more like this  s: save  Esc: back",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(code: KeyCode, modifiers: KeyModifiers) -> KeyEvent {
        KeyEvent::new(code, modifiers)
    }

    #[test]
    fn control_bindings_are_global() {
        assert_eq!(
            global_action(&key(KeyCode::Char('q'), KeyModifiers::CONTROL)),
            Some(GlobalAction::Quit)
        );
        assert_eq!(
            global_action(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(GlobalAction::Cancel)
        );
        assert_eq!(
            global_action(&key(KeyCode::F(12), KeyModifiers::NONE)),
            Some(GlobalAction::ToggleDiagnostics)
        );
    }

    #[test]
    fn plain_letters_are_not_global() {
        assert_eq!(global_action(&key(KeyCode::Char('q'), KeyModifiers::NONE)), None);
        assert_eq!(global_action(&key(KeyCode::Char('c'), KeyModifiers::SHIFT)), None);
    }
}
