use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use std::io::stdout;

use crate::db::{Database, StatusUpdate};
use crate::models::{Posting, Status};

const WRAP_WIDTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pane {
    Description,
    Resume,
}

struct AppState {
    postings: Vec<Posting>,
    counts: Vec<(Status, usize)>,
    selected: usize,
    scroll_offset: u16,
    pane: Pane,
    message: Option<String>,
}

impl AppState {
    fn new(postings: Vec<Posting>, counts: Vec<(Status, usize)>) -> Self {
        Self {
            postings,
            counts,
            selected: 0,
            scroll_offset: 0,
            pane: Pane::Description,
            message: None,
        }
    }

    fn current(&self) -> Option<&Posting> {
        self.postings.get(self.selected)
    }

    fn next(&mut self) {
        if !self.postings.is_empty() && self.selected < self.postings.len() - 1 {
            self.selected += 1;
            self.scroll_offset = 0;
        }
    }

    fn prev(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
            self.scroll_offset = 0;
        }
    }

    fn scroll_down(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_add(3);
    }

    fn scroll_up(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_sub(3);
    }

    fn toggle_pane(&mut self) {
        self.pane = match self.pane {
            Pane::Description => Pane::Resume,
            Pane::Resume => Pane::Description,
        };
        self.scroll_offset = 0;
    }

    /// Applies a manual transition through the store and mirrors it locally.
    fn mark(&mut self, db: &Database, status: Status) {
        let Some(posting) = self.postings.get_mut(self.selected) else {
            return;
        };
        match db.update_status(&posting.id, StatusUpdate::status(status)) {
            Ok(()) => {
                self.message = Some(format!("{} marked {}", posting.id, status));
                posting.status = status;
                if let Ok(counts) = db.count_by_status() {
                    self.counts = counts;
                }
            }
            Err(e) => self.message = Some(e.to_string()),
        }
    }
}

pub fn run_dashboard(db: &Database, status: Option<Status>) -> Result<()> {
    let postings = db.list(status, None)?;
    if postings.is_empty() {
        println!("No postings found. Run `jobpilot run` first.");
        return Ok(());
    }
    let mut state = AppState::new(postings, db.count_by_status()?);

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state, db);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut AppState,
    db: &Database,
) -> Result<()> {
    let mut list_state = ListState::default();
    list_state.select(Some(0));

    loop {
        terminal.draw(|frame| draw(frame, state, &mut list_state))?;

        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Down | KeyCode::Char('j') => state.next(),
                KeyCode::Up | KeyCode::Char('k') => state.prev(),
                KeyCode::Char('J') | KeyCode::PageDown => state.scroll_down(),
                KeyCode::Char('K') | KeyCode::PageUp => state.scroll_up(),
                KeyCode::Tab => state.toggle_pane(),
                KeyCode::Char('r') => state.mark(db, Status::Responded),
                KeyCode::Char('x') => state.mark(db, Status::Rejected),
                _ => {}
            }
            list_state.select(Some(state.selected));
        }
    }
    Ok(())
}

fn status_marker(status: Status) -> &'static str {
    match status {
        Status::Scraped => " ",
        Status::Test => "~",
        Status::Applied => "+",
        Status::Responded => "!",
        Status::Rejected => "x",
    }
}

fn status_style(status: Status) -> Style {
    match status {
        Status::Scraped => Style::default().fg(Color::Green),
        Status::Test => Style::default().fg(Color::Yellow),
        Status::Applied => Style::default().fg(Color::Cyan),
        Status::Responded => Style::default().fg(Color::Magenta),
        Status::Rejected => Style::default().fg(Color::Red),
    }
}

fn summary_line(counts: &[(Status, usize)]) -> String {
    let total: usize = counts.iter().map(|(_, n)| n).sum();
    let parts: Vec<String> = counts.iter().map(|(s, n)| format!("{}: {}", s, n)).collect();
    format!(" Total: {}  |  {}", total, parts.join("  "))
}

fn draw(frame: &mut Frame, state: &AppState, list_state: &mut ListState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Min(0), Constraint::Length(1)])
        .split(frame.area());

    let header = Paragraph::new(summary_line(&state.counts))
        .style(Style::default().add_modifier(Modifier::BOLD));
    frame.render_widget(header, rows[0]);

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(rows[1]);

    let items: Vec<ListItem> = state
        .postings
        .iter()
        .map(|p| {
            let title: String = if p.title.chars().count() > 35 {
                format!("{}...", p.title.chars().take(32).collect::<String>())
            } else {
                p.title.clone()
            };
            ListItem::new(format!("{} {} | {}", status_marker(p.status), title, p.company))
        })
        .collect();

    let list = List::new(items)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" Postings ({}) ", state.postings.len())),
        )
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");
    frame.render_stateful_widget(list, chunks[0], list_state);

    let pane_title = match state.pane {
        Pane::Description => " Detail ",
        Pane::Resume => " Adapted CV ",
    };
    let detail = Paragraph::new(build_detail(state))
        .block(Block::default().borders(Borders::ALL).title(pane_title))
        .wrap(Wrap { trim: false })
        .scroll((state.scroll_offset, 0));
    frame.render_widget(detail, chunks[1]);

    let footer = state.message.clone().unwrap_or_else(|| {
        " j/k:navigate  J/K:scroll  Tab:description/CV  r:responded x:rejected  q:quit".to_string()
    });
    frame.render_widget(
        Paragraph::new(footer).style(Style::default().fg(Color::DarkGray)),
        rows[2],
    );
}

fn build_detail(state: &AppState) -> Text<'_> {
    let Some(posting) = state.current() else {
        return Text::raw("No posting selected");
    };
    let bold = Style::default().add_modifier(Modifier::BOLD);

    if state.pane == Pane::Resume {
        return match &posting.cv_adapted {
            Some(cv) => Text::from(cv.lines().map(|l| Line::from(l.to_string())).collect::<Vec<_>>()),
            None => Text::from(Line::from(Span::styled(
                "(No adapted CV yet)",
                Style::default().fg(Color::DarkGray),
            ))),
        };
    }

    let mut lines: Vec<Line> = Vec::new();
    lines.push(Line::from(Span::styled(posting.title.clone(), bold)));
    lines.push(Line::from(format!("at {} ({})", posting.company, posting.location)));
    lines.push(Line::from(Span::styled(
        format!("Status: {}", posting.status),
        status_style(posting.status),
    )));
    lines.push(Line::from(format!("Source: {}  |  ID: {}", posting.source, posting.id)));
    lines.push(Line::from(format!("URL: {}", posting.url)));
    if let Some(salary) = &posting.salary {
        lines.push(Line::from(format!("Salary: {}", salary)));
    }
    lines.push(Line::from(format!(
        "Scraped: {}",
        posting.date_scraped.format("%Y-%m-%d %H:%M")
    )));
    if let Some(applied) = posting.application_date {
        lines.push(Line::from(format!("Applied: {}", applied.format("%Y-%m-%d %H:%M"))));
    }
    lines.push(Line::from(""));

    if posting.keywords.is_empty() {
        lines.push(Line::from(Span::styled(
            "(Not classified yet)",
            Style::default().fg(Color::DarkGray),
        )));
    } else {
        lines.push(Line::from(Span::styled("Keywords", bold)));
        lines.push(Line::from(Span::styled(
            format!("  {}", posting.keywords.join(", ")),
            Style::default().fg(Color::Cyan),
        )));
    }
    lines.push(Line::from(""));

    lines.push(Line::from(Span::styled("Description", bold)));
    for paragraph in posting.description.lines() {
        for line in textwrap::fill(paragraph, WRAP_WIDTH).lines() {
            lines.push(Line::from(format!("  {}", line)));
        }
    }

    Text::from(lines)
}
