use serde::Serialize;

/// Hard cap on remembered return targets. Oldest frames are dropped first.
pub const MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Browsing,
    Composing,
    ViewingResults,
    BrowsingHistory,
    ReadingArticle,
}

impl Mode {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Browsing => "browse",
            Self::Composing => "search",
            Self::ViewingResults => "results",
            Self::BrowsingHistory => "history",
            Self::ReadingArticle => "read",
        }
    }
}

/// Current mode plus the stack of modes to return to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeStack {
    current: Mode,
    stack: Vec<Mode>,
}

impl ModeStack {
    pub const fn new(initial: Mode) -> Self {
        Self {
            current: initial,
            stack: Vec::new(),
        }
    }

    pub const fn current(&self) -> Mode {
        self.current
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Mode that [`leave`](Self::leave) would return to.
    pub fn parent(&self) -> Option<Mode> {
        self.stack.last().copied()
    }

    /// Push the current mode and switch. Entering the current mode is a no-op.
    pub fn enter(&mut self, mode: Mode) -> bool {
        if mode == self.current {
            return false;
        }
        if self.stack.len() == MAX_DEPTH {
            self.stack.remove(0);
        }
        self.stack.push(self.current);
        self.current = mode;
        true
    }

    /// Pop back to the previous mode, or `default` when the stack is empty.
    /// Returns the mode that was left.
    pub fn leave(&mut self, default: Mode) -> Mode {
        let left = self.current;
        self.current = self.stack.pop().unwrap_or(default);
        left
    }

    /// Swap the current mode without growing the stack. A return frame equal
    /// to `mode` is collapsed so enter/replace cycles stay flat.
    pub fn replace(&mut self, mode: Mode) -> Mode {
        let left = self.current;
        if self.stack.last() == Some(&mode) {
            self.stack.pop();
        }
        self.current = mode;
        left
    }

    /// Drop every frame and switch to `mode`.
    pub fn reset(&mut self, mode: Mode) {
        self.stack.clear();
        self.current = mode;
    }
}

impl Default for ModeStack {
    fn default() -> Self {
        Self::new(Mode::Browsing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn enter_same_mode_is_noop() {
        let mut modes = ModeStack::default();
        assert!(!modes.enter(Mode::Browsing));
        assert_eq!(modes.depth(), 0);
    }

    #[test]
    fn leave_falls_back_to_default() {
        let mut modes = ModeStack::new(Mode::ViewingResults);
        assert_eq!(modes.leave(Mode::Browsing), Mode::ViewingResults);
        assert_eq!(modes.current(), Mode::Browsing);
    }

    #[test]
    fn compose_from_results_collapses_on_commit() {
        let mut modes = ModeStack::default();
        modes.enter(Mode::ViewingResults);
        for _ in 0..50 {
            modes.enter(Mode::Composing);
            modes.replace(Mode::ViewingResults);
        }
        assert_eq!(modes.current(), Mode::ViewingResults);
        assert_eq!(modes.depth(), 1);
        assert_eq!(modes.parent(), Some(Mode::Browsing));
    }

    #[test]
    fn history_rerun_cycle_stays_flat() {
        let mut modes = ModeStack::default();
        modes.enter(Mode::BrowsingHistory);
        modes.replace(Mode::ViewingResults);
        for _ in 0..50 {
            modes.enter(Mode::BrowsingHistory);
            modes.replace(Mode::ViewingResults);
        }
        assert_eq!(modes.depth(), 1);
    }

    #[test]
    fn depth_is_capped() {
        let mut modes = ModeStack::default();
        let cycle = [Mode::Composing, Mode::ReadingArticle, Mode::BrowsingHistory];
        for mode in cycle.iter().cycle().take(100) {
            modes.enter(*mode);
        }
        assert_eq!(modes.depth(), MAX_DEPTH);
    }

    fn mode_strategy() -> impl Strategy<Value = Mode> {
        prop_oneof![
            Just(Mode::Browsing),
            Just(Mode::Composing),
            Just(Mode::ViewingResults),
            Just(Mode::BrowsingHistory),
            Just(Mode::ReadingArticle),
        ]
    }

    proptest! {
        #[test]
        fn enter_replace_pairs_never_grow(
            modal in prop::collection::vec(mode_strategy(), 1..64),
        ) {
            let mut modes = ModeStack::default();
            modes.enter(Mode::ViewingResults);
            let start = modes.depth();
            for mode in modal {
                if mode == Mode::ViewingResults {
                    continue;
                }
                modes.enter(mode);
                modes.replace(Mode::ViewingResults);
                prop_assert_eq!(modes.depth(), start);
            }
        }

        #[test]
        fn depth_never_exceeds_cap(
            ops in prop::collection::vec((0u8..3, mode_strategy()), 0..200),
        ) {
            let mut modes = ModeStack::default();
            for (op, mode) in ops {
                match op {
                    0 => { modes.enter(mode); }
                    1 => { modes.leave(Mode::Browsing); }
                    _ => { modes.replace(mode); }
                }
                prop_assert!(modes.depth() <= MAX_DEPTH);
            }
        }
    }
}
