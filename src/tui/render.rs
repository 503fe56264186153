//! Drawing. Reads [`App`] state, never mutates it beyond list selection.

use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
};

use crate::pipeline::{SearchSession, StageStatus};
use crate::search::ScoreKind;
use crate::storage::ItemRecord;
use crate::ui::keys::help_line;
use crate::ui::{App, Mode};

const DIAGNOSTIC_ROWS: u16 = 10;

pub fn draw(f: &mut Frame, app: &App) {
    let mut constraints = vec![
        Constraint::Length(1), // Title bar
        Constraint::Length(3), // Query / stage bar
        Constraint::Min(6),    // Main content
    ];
    if app.show_diagnostics() {
        constraints.push(Constraint::Length(DIAGNOSTIC_ROWS));
    }
    constraints.push(Constraint::Length(1)); // Help bar

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(f.area());

    draw_title_bar(f, app, chunks[0]);
    draw_query_bar(f, app, chunks[1]);
    draw_main(f, app, chunks[2]);
    if app.show_diagnostics() {
        draw_diagnostics(f, app, chunks[3]);
    }
    draw_help_bar(f, app, chunks[chunks.len() - 1]);
}

fn draw_title_bar(f: &mut Frame, app: &App, area: Rect) {
    let status = app.status();
    let status = if status.is_empty() {
        String::new()
    } else {
        format!(" | {status}")
    };
    let title = Line::from(vec![
        Span::styled("ferret", Style::default().add_modifier(Modifier::BOLD)),
        Span::raw(format!(" | {}{status}", app.mode().label())),
    ]);
    f.render_widget(
        Paragraph::new(title).style(Style::default().fg(Color::Cyan)),
        area,
    );
}

fn draw_query_bar(f: &mut Frame, app: &App, area: Rect) {
    let composing = app.mode() == Mode::Composing;
    let (text, title) = if composing {
        (format!("{}_", app.input()), " Search ")
    } else if let Some(session) = app.orchestrator().session() {
        (stage_line(session), " Pipeline ")
    } else {
        ("Type / to search...".to_string(), " Search ")
    };

    let border = if composing {
        Style::default().fg(Color::Yellow)
    } else {
        Style::default()
    };
    let paragraph = Paragraph::new(text).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(border)
            .title(title),
    );
    f.render_widget(paragraph, area);
}

/// `"climate risk" lexical:ready embedding:running ...`
pub fn stage_line(session: &SearchSession) -> String {
    let stages = session.stages();
    let subject = match session.seed() {
        Some(seed) => format!("like #{seed}"),
        None => format!("\"{}\"", session.query_text()),
    };
    let mut rerank = stages.rerank.label().to_string();
    if let Some(progress) = session.rerank_progress() {
        if stages.rerank == StageStatus::Pending {
            rerank = format!("{}/{}", progress.done, progress.total);
        }
    }
    format!(
        "{subject}  lexical:{}  embedding:{}  corpus:{}  rerank:{rerank}",
        stages.lexical.label(),
        stages.embedding.label(),
        stages.corpus.label(),
    )
}

fn draw_main(f: &mut Frame, app: &App, area: Rect) {
    match app.mode() {
        Mode::ReadingArticle => draw_article(f, app.reading(), area),
        Mode::BrowsingHistory => draw_history(f, app, area),
        Mode::ViewingResults => draw_results(f, app, area),
        Mode::Composing => {
            if app.orchestrator().session().is_some() {
                draw_results(f, app, area);
            } else {
                draw_browse(f, app, area);
            }
        }
        Mode::Browsing => draw_browse(f, app, area),
    }
}

fn split_columns(area: Rect) -> (Rect, Rect) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(area);
    (columns[0], columns[1])
}

fn item_line(item: &ItemRecord) -> Line<'static> {
    let marker = if item.is_saved { "* " } else { "  " };
    let style = if item.is_read {
        Style::default().fg(Color::DarkGray)
    } else {
        Style::default()
    };
    Line::from(vec![
        Span::styled(marker.to_string(), Style::default().fg(Color::Yellow)),
        Span::styled(truncate(&item.title, 60), style),
    ])
}

fn draw_browse(f: &mut Frame, app: &App, area: Rect) {
    let (left, right) = split_columns(area);
    let browse = app.browse();
    let items: Vec<ListItem> = browse.items.iter().map(|item| ListItem::new(item_line(item))).collect();
    let title = format!(" Items ({}) ", browse.items.len());
    render_list(f, items, &title, browse.selected, left);
    draw_article(f, browse.items.get(browse.selected), right);
}

fn draw_results(f: &mut Frame, app: &App, area: Rect) {
    let (left, right) = split_columns(area);
    let rows = app.results();
    let cached = rows.first().is_some_and(|row| row.cached);

    let items: Vec<ListItem> = rows
        .iter()
        .map(|row| {
            let (tag, score) = match row.score.and_then(|s| s.display_score()) {
                Some((kind, score)) => (kind_tag(kind), format!("{score:>6.2}")),
                None => ("-", "      ".to_string()),
            };
            let provenance = row
                .score
                .map(|s| s.provenance().to_string())
                .unwrap_or_default();
            let mut line = item_line(row.item);
            line.spans.insert(
                0,
                Span::styled(
                    format!("[{tag}] {score} {provenance:<5} "),
                    Style::default().fg(kind_color(tag)),
                ),
            );
            ListItem::new(line)
        })
        .collect();

    let title = if cached {
        format!(" Results ({}, cached) ", rows.len())
    } else {
        format!(" Results ({}) ", rows.len())
    };
    render_list(f, items, &title, app.results_selected(), left);
    draw_article(f, rows.get(app.results_selected()).map(|row| row.item), right);
}

fn draw_history(f: &mut Frame, app: &App, area: Rect) {
    let items: Vec<ListItem> = app
        .history()
        .iter()
        .map(|entry| {
            let pin = if entry.pinned { "[pinned] " } else { "" };
            ListItem::new(Line::from(vec![
                Span::styled(pin.to_string(), Style::default().fg(Color::Magenta)),
                Span::styled(
                    entry.raw_query.clone(),
                    Style::default().add_modifier(Modifier::BOLD),
                ),
                Span::styled(
                    format!(
                        "  {} results, used {}x, {}",
                        entry.result_count,
                        entry.use_count,
                        short_time(&entry.last_used_at)
                    ),
                    Style::default().fg(Color::DarkGray),
                ),
            ]))
        })
        .collect();
    let title = format!(" History ({}) ", app.history().len());
    render_list(f, items, &title, app.history_selected(), area);
}

fn draw_article(f: &mut Frame, item: Option<&ItemRecord>, area: Rect) {
    let Some(item) = item else {
        f.render_widget(
            Paragraph::new("Nothing selected").block(Block::default().borders(Borders::ALL)),
            area,
        );
        return;
    };

    let bold = Style::default().add_modifier(Modifier::BOLD);
    let mut lines: Vec<Line<'static>> = vec![
        Line::from(Span::styled(item.title.clone(), bold)),
        Line::from(format!("{} | {}", item.feed, short_time(&item.published_at))),
    ];
    if let Some(author) = &item.author {
        lines.push(Line::from(format!("by {author}")));
    }
    if let Some(link) = &item.link {
        lines.push(Line::from(Span::styled(
            link.clone(),
            Style::default().fg(Color::Blue),
        )));
    }
    lines.push(Line::from(""));
    for line in item.summary.lines() {
        lines.push(Line::from(line.to_string()));
    }

    let paragraph = Paragraph::new(Text::from(lines))
        .block(Block::default().borders(Borders::ALL).title(" Article "))
        .wrap(Wrap { trim: false });
    f.render_widget(paragraph, area);
}

fn draw_diagnostics(f: &mut Frame, app: &App, area: Rect) {
    let lines: Vec<&str> = app.orchestrator().diagnostics().collect();
    let visible = usize::from(DIAGNOSTIC_ROWS.saturating_sub(2));
    let start = lines.len().saturating_sub(visible);
    let text: Vec<Line> = lines[start..].iter().map(|line| Line::from(*line)).collect();

    f.render_widget(Clear, area);
    let paragraph = Paragraph::new(text).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Cyan))
            .title(" Diagnostics "),
    );
    f.render_widget(paragraph, area);
}

fn draw_help_bar(f: &mut Frame, app: &App, area: Rect) {
    let paragraph =
        Paragraph::new(help_line(app.mode())).style(Style::default().fg(Color::DarkGray));
    f.render_widget(paragraph, area);
}

fn render_list(f: &mut Frame, items: Vec<ListItem>, title: &str, selected: usize, area: Rect) {
    let mut state = ListState::default();
    if !items.is_empty() {
        state.select(Some(selected));
    }
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(title.to_string()))
        .highlight_style(Style::default().add_modifier(Modifier::REVERSED))
        .highlight_symbol("> ");
    f.render_stateful_widget(list, area, &mut state);
}

const fn kind_tag(kind: ScoreKind) -> &'static str {
    match kind {
        ScoreKind::Lexical => "L",
        ScoreKind::Cosine => "C",
        ScoreKind::Reranked => "R",
    }
}

fn kind_color(tag: &str) -> Color {
    match tag {
        "R" => Color::Green,
        "C" => Color::Cyan,
        "L" => Color::Yellow,
        _ => Color::DarkGray,
    }
}

fn short_time(rfc3339: &str) -> String {
    chrono::DateTime::parse_from_rfc3339(rfc3339).map_or_else(
        |_| rfc3339.to_string(),
        |time| time.format("%Y-%m-%d %H:%M").to_string(),
    )
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() > max_len {
        format!("{}...", s.chars().take(max_len - 3).collect::<String>())
    } else {
        s.to_string()
    }
}
