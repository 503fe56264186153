//! The interactive state machine.
//!
//! [`App`] owns the [`ModeStack`], the [`Orchestrator`] and the receiving end
//! of the pipeline channel. Key handling is synchronous and never waits on a
//! backend; the presentation loop calls [`App::pump`] every tick to apply
//! whatever the pipeline tasks reported.

use std::sync::Arc;
use std::time::Duration;

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{ErrorClass, FerretError, Result};
use crate::pipeline::{ListSnapshot, Orchestrator, PipelineEvent, ResultRow};
use crate::storage::{HistoryEntry, ItemRecord, Store};
use crate::ui::keys::{GlobalAction, global_action};
use crate::ui::mode::{Mode, ModeStack};

/// Items loaded into the browse list.
pub const BROWSE_LIMIT: usize = 500;
const HISTORY_LIMIT: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppAction {
    Continue,
    Quit,
}

pub struct App {
    store: Arc<Store>,
    orchestrator: Orchestrator,
    events: UnboundedReceiver<PipelineEvent>,
    modes: ModeStack,
    browse: ListSnapshot,
    results_selected: usize,
    history: Vec<HistoryEntry>,
    history_selected: usize,
    input: String,
    reading: Option<ItemRecord>,
    show_diagnostics: bool,
    notice: Option<String>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("mode", &self.modes.current())
            .field("depth", &self.modes.depth())
            .field("orchestrator", &self.orchestrator)
            .finish_non_exhaustive()
    }
}

impl App {
    pub fn new(
        store: Arc<Store>,
        orchestrator: Orchestrator,
        events: UnboundedReceiver<PipelineEvent>,
    ) -> Result<Self> {
        let items = store.read(|db| db.list_items(BROWSE_LIMIT, 0))?;
        Ok(Self {
            store,
            orchestrator,
            events,
            modes: ModeStack::default(),
            browse: ListSnapshot { items, selected: 0 },
            results_selected: 0,
            history: Vec::new(),
            history_selected: 0,
            input: String::new(),
            reading: None,
            show_diagnostics: false,
            notice: None,
        })
    }

    pub const fn mode(&self) -> Mode {
        self.modes.current()
    }

    pub const fn modes(&self) -> &ModeStack {
        &self.modes
    }

    pub const fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub const fn browse(&self) -> &ListSnapshot {
        &self.browse
    }

    pub fn results(&self) -> Vec<ResultRow<'_>> {
        self.orchestrator.visible()
    }

    pub const fn results_selected(&self) -> usize {
        self.results_selected
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub const fn history_selected(&self) -> usize {
        self.history_selected
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub const fn reading(&self) -> Option<&ItemRecord> {
        self.reading.as_ref()
    }

    pub const fn show_diagnostics(&self) -> bool {
        self.show_diagnostics
    }

    /// One-line status: the last UI notice, else the pipeline status.
    pub fn status(&self) -> &str {
        self.notice
            .as_deref()
            .unwrap_or_else(|| self.orchestrator.status())
    }

    /// Apply queued pipeline events. Returns how many were current.
    pub fn pump(&mut self) -> usize {
        let applied = self.orchestrator.drain(&mut self.events);
        self.clamp_results();
        applied
    }

    /// Apply pipeline events until nothing is in flight.
    pub async fn settle(&mut self, limit: Duration) -> Result<()> {
        self.orchestrator
            .drive_until_idle(&mut self.events, limit)
            .await?;
        self.clamp_results();
        Ok(())
    }

    /// Ingestion notification: reload the browse list and drop corpus caches.
    pub fn items_changed(&mut self) -> Result<()> {
        self.orchestrator.items_changed();
        let items = self.store.read(|db| db.list_items(BROWSE_LIMIT, 0))?;
        self.browse.selected = self.browse.selected.min(items.len().saturating_sub(1));
        self.browse.items = items;
        Ok(())
    }

    /// Start a search as if it had been typed and committed.
    pub fn search(&mut self, query: &str) {
        self.input = query.to_string();
        self.run_query(query);
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppAction {
        if key.kind == KeyEventKind::Release {
            return AppAction::Continue;
        }
        self.notice = None;

        if let Some(action) = global_action(&key) {
            return self.handle_global(action);
        }

        match self.modes.current() {
            Mode::Browsing => self.browse_key(key),
            Mode::Composing => self.compose_key(key),
            Mode::ViewingResults => self.results_key(key),
            Mode::BrowsingHistory => self.history_key(key),
            Mode::ReadingArticle => self.article_key(key),
        }
    }

    fn handle_global(&mut self, action: GlobalAction) -> AppAction {
        match action {
            GlobalAction::Quit => {
                self.orchestrator.leave_results();
                return AppAction::Quit;
            }
            GlobalAction::Cancel => {
                if !self.orchestrator.cancel() {
                    self.notice = Some("nothing to cancel".to_string());
                }
            }
            GlobalAction::ToggleDiagnostics => {
                self.show_diagnostics = !self.show_diagnostics;
            }
        }
        AppAction::Continue
    }

    fn browse_key(&mut self, key: KeyEvent) -> AppAction {
        let len = self.browse.items.len();
        match key.code {
            KeyCode::Char('q') => return AppAction::Quit,
            KeyCode::Down | KeyCode::Char('j') => self.browse.selected = step(self.browse.selected, len, 1),
            KeyCode::Up | KeyCode::Char('k') => self.browse.selected = step(self.browse.selected, len, -1),
            KeyCode::Char('g') => self.browse.selected = 0,
            KeyCode::Char('G') => self.browse.selected = len.saturating_sub(1),
            KeyCode::Char('/') => {
                self.input.clear();
                self.modes.enter(Mode::Composing);
            }
            KeyCode::Char('H') => self.open_history(),
            KeyCode::Char('p') => {
                if let Some(item) = self.browse.items.get(self.browse.selected).cloned() {
                    self.pivot(&item);
                }
            }
            KeyCode::Char('s') => {
                if let Some(item) = self.browse.items.get(self.browse.selected).cloned() {
                    self.toggle_saved(&item);
                }
            }
            KeyCode::Enter => {
                if let Some(item) = self.browse.items.get(self.browse.selected).cloned() {
                    self.open_article(item);
                }
            }
            _ => {}
        }
        AppAction::Continue
    }

    fn compose_key(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Enter => self.commit(),
            KeyCode::Esc => self.leave(),
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.input.push(c);
            }
            _ => {}
        }
        AppAction::Continue
    }

    fn results_key(&mut self, key: KeyEvent) -> AppAction {
        let len = self.orchestrator.visible().len();
        match key.code {
            KeyCode::Down | KeyCode::Char('j') => self.results_selected = step(self.results_selected, len, 1),
            KeyCode::Up | KeyCode::Char('k') => self.results_selected = step(self.results_selected, len, -1),
            KeyCode::Esc => {
                if self.orchestrator.in_flight() {
                    self.orchestrator.cancel();
                } else {
                    self.leave();
                }
            }
            KeyCode::Char('r') => {
                if !self.orchestrator.start_rerank() && !self.orchestrator.in_flight() {
                    self.notice = Some("no rerank to start".to_string());
                }
            }
            KeyCode::Char('/') => {
                self.input = self
                    .orchestrator
                    .session()
                    .map(|s| s.query_text().to_string())
                    .unwrap_or_default();
                self.modes.enter(Mode::Composing);
            }
            KeyCode::Char('H') => self.open_history(),
            KeyCode::Char('p') => {
                if let Some(item) = self.selected_result() {
                    self.pivot(&item);
                }
            }
            KeyCode::Char('s') => {
                if let Some(item) = self.selected_result() {
                    self.toggle_saved(&item);
                }
            }
            KeyCode::Enter => {
                if let Some(item) = self.selected_result() {
                    self.open_article(item);
                }
            }
            _ => {}
        }
        AppAction::Continue
    }

    fn history_key(&mut self, key: KeyEvent) -> AppAction {
        let len = self.history.len();
        match key.code {
            KeyCode::Down | KeyCode::Char('j') => self.history_selected = step(self.history_selected, len, 1),
            KeyCode::Up | KeyCode::Char('k') => self.history_selected = step(self.history_selected, len, -1),
            KeyCode::Esc => self.leave(),
            KeyCode::Enter => {
                if let Some(entry) = self.history.get(self.history_selected) {
                    let query = entry.raw_query.clone();
                    self.run_query(&query);
                }
            }
            KeyCode::Char('P') => self.toggle_pin(),
            KeyCode::Char('d') => self.delete_history(),
            _ => {}
        }
        AppAction::Continue
    }

    fn article_key(&mut self, key: KeyEvent) -> AppAction {
        match key.code {
            KeyCode::Esc => self.leave(),
            KeyCode::Char('p') => {
                if let Some(item) = self.reading.clone() {
                    self.pivot(&item);
                }
            }
            KeyCode::Char('s') => {
                if let Some(item) = self.reading.clone() {
                    self.toggle_saved(&item);
                }
            }
            _ => {}
        }
        AppAction::Continue
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn commit(&mut self) {
        let query = self.input.trim().to_string();
        if query.is_empty() {
            self.notice = Some("type a query first".to_string());
            return;
        }
        self.run_query(&query);
    }

    fn run_query(&mut self, query: &str) {
        match self.orchestrator.submit(query, &self.browse) {
            Ok(_) => {
                self.modes.replace(Mode::ViewingResults);
                self.results_selected = 0;
            }
            Err(FerretError::QueryParse(reason)) => {
                self.notice = Some(format!("invalid query: {reason}"));
            }
            Err(err) => {
                if err.class() == ErrorClass::Storage {
                    tracing::error!(error = %err, "search abandoned");
                }
                self.restore_browse();
                self.modes.reset(Mode::Browsing);
                self.notice = Some(format!("search failed: {err}"));
            }
        }
    }

    fn pivot(&mut self, seed: &ItemRecord) {
        self.orchestrator.pivot(seed, &self.browse);
        self.results_selected = 0;
        match self.modes.current() {
            Mode::ViewingResults => {}
            Mode::Browsing => {
                self.modes.enter(Mode::ViewingResults);
            }
            _ => {
                self.modes.replace(Mode::ViewingResults);
            }
        }
    }

    /// Pop the current mode. Leaving results restores the pre-search list;
    /// leaving the composer stops whatever is still running.
    fn leave(&mut self) {
        match self.modes.leave(Mode::Browsing) {
            Mode::ViewingResults => self.restore_browse(),
            Mode::Composing => {
                self.orchestrator.cancel();
            }
            _ => {}
        }
        if self.modes.current() == Mode::Browsing && self.orchestrator.session().is_some() {
            self.restore_browse();
        }
    }

    fn restore_browse(&mut self) {
        let Some(mut snapshot) = self.orchestrator.leave_results() else {
            return;
        };
        let ids: Vec<_> = snapshot.items.iter().map(|item| item.id).collect();
        match self.store.read(|db| db.get_items(&ids)) {
            Ok(fresh) => {
                for item in &mut snapshot.items {
                    if let Some(updated) = fresh.iter().find(|f| f.id == item.id) {
                        item.clone_from(updated);
                    }
                }
            }
            Err(err) => tracing::warn!(error = %err, "could not refresh restored list"),
        }
        self.browse = snapshot;
        self.results_selected = 0;
    }

    fn open_history(&mut self) {
        match self.store.read(|db| db.list_history(HISTORY_LIMIT)) {
            Ok(entries) => {
                self.history = entries;
                self.history_selected = 0;
                self.modes.enter(Mode::BrowsingHistory);
            }
            Err(err) => self.report(&err),
        }
    }

    fn toggle_pin(&mut self) {
        let Some(entry) = self.history.get(self.history_selected) else {
            return;
        };
        let (id, pinned) = (entry.id, !entry.pinned);
        match self.store.write(|db| db.set_pinned(id, pinned)) {
            Ok(_) => {
                self.notice = Some(if pinned { "pinned" } else { "unpinned" }.to_string());
                self.reload_history();
            }
            Err(err) => self.report(&err),
        }
    }

    fn delete_history(&mut self) {
        let Some(entry) = self.history.get(self.history_selected) else {
            return;
        };
        let id = entry.id;
        match self.store.write(|db| db.delete_history(id)) {
            Ok(_) => self.reload_history(),
            Err(err) => self.report(&err),
        }
    }

    fn reload_history(&mut self) {
        match self.store.read(|db| db.list_history(HISTORY_LIMIT)) {
            Ok(entries) => {
                self.history_selected = self.history_selected.min(entries.len().saturating_sub(1));
                self.history = entries;
            }
            Err(err) => self.report(&err),
        }
    }

    fn open_article(&mut self, item: ItemRecord) {
        let id = item.id;
        let updated = self.store.write(|db| {
            db.set_read(id, true)?;
            db.get_item(id)
        });
        let item = match updated {
            Ok(Some(fresh)) => fresh,
            Ok(None) => item,
            Err(err) => {
                self.report(&err);
                item
            }
        };
        self.update_item(&item);
        self.reading = Some(item);
        self.modes.enter(Mode::ReadingArticle);
    }

    fn toggle_saved(&mut self, item: &ItemRecord) {
        let (id, saved) = (item.id, !item.is_saved);
        match self.store.write(|db| {
            db.set_saved(id, saved)?;
            db.get_item(id)
        }) {
            Ok(Some(fresh)) => {
                self.notice = Some(if saved { "saved" } else { "unsaved" }.to_string());
                self.update_item(&fresh);
            }
            Ok(None) => {}
            Err(err) => self.report(&err),
        }
    }

    /// Propagate a flag change to every list holding the item.
    fn update_item(&mut self, item: &ItemRecord) {
        if let Some(slot) = self.browse.items.iter_mut().find(|i| i.id == item.id) {
            slot.clone_from(item);
        }
        if self.reading.as_ref().is_some_and(|r| r.id == item.id) {
            self.reading = Some(item.clone());
        }
        self.orchestrator.refresh_item(item.clone());
    }

    fn selected_result(&self) -> Option<ItemRecord> {
        self.orchestrator
            .visible()
            .get(self.results_selected)
            .map(|row| row.item.clone())
    }

    fn clamp_results(&mut self) {
        let len = self.orchestrator.visible().len();
        self.results_selected = self.results_selected.min(len.saturating_sub(1));
    }

    fn report(&mut self, err: &FerretError) {
        tracing::warn!(error = %err, "storage operation failed");
        self.notice = Some(err.to_string());
    }
}

/// Move a selection by `delta`, wrapping at both ends.
fn step(current: usize, len: usize, delta: isize) -> usize {
    if len == 0 {
        return 0;
    }
    let len = len as isize;
    (current as isize + delta).rem_euclid(len) as usize
}
