mod poller;
mod store;

use crate::poller::{HttpSubscribeClient, PollContext, PollError, Poller};
use crate::store::{shuttle_store, ShuttleSnapshot};
use chrono::{DateTime, Local, Utc};
use clap::Parser;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use futures_util::StreamExt;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, Paragraph, Wrap},
    Terminal,
};
use shuttle_core::motion::{PositionAnimator, RACK_PITCH_PX};
use shuttle_core::viewport::{AutoScroller, ViewportMetrics};
use shuttle_core::{ShuttleAction, ShuttleState};
use std::{
    error::Error,
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const FRAME_INTERVAL_MS: u64 = 16;
const COMPACT_WIDTH: u16 = 92;
const HEADER_HEIGHT: u16 = 4;
const KPI_HEIGHT: u16 = 3;
const SCROLL_PAGE_RACKS: i64 = 10;

#[derive(Parser, Debug)]
#[command(name = "shuttle-mission-control")]
struct Args {
    #[arg(long, env = "SHUTTLE_PUBSUB_URL", default_value = "http://127.0.0.1:8000/pubsub")]
    pubsub_url: String,
    #[arg(long, env = "SHUTTLE_API_NAME")]
    api_name: Option<String>,
    #[arg(long, env = "SHUTTLE_ROBOTS", value_delimiter = ',')]
    robots: Vec<String>,
    #[arg(long, env = "SHUTTLE_AUTH_TOKEN")]
    token: Option<String>,
    #[arg(long, env = "SHUTTLE_AUTH_TOKEN_FILE")]
    token_file: Option<PathBuf>,
    #[arg(long, env = "SHUTTLE_RACKS", default_value_t = 40)]
    racks: u16,
    #[arg(long, env = "SHUTTLE_DEPTHS", default_value_t = 2)]
    depths: u16,
    #[arg(long, env = "SHUTTLE_REQUEST_TIMEOUT_SECS", default_value_t = 5)]
    request_timeout_secs: u64,
    #[arg(long, env = "SHUTTLE_LOG_FILE")]
    log_file: Option<PathBuf>,
    #[arg(long, env = "SHUTTLE_DEBUG", default_value_t = false)]
    debug: bool,
}

#[derive(Clone, Debug)]
struct Config {
    pubsub_url: String,
    api_name: Option<String>,
    robots: Vec<String>,
    token: Option<String>,
    token_file: Option<PathBuf>,
    racks: i64,
    depths: i64,
    request_timeout: Duration,
    log_file: Option<PathBuf>,
    debug: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CellMark {
    Empty,
    Target(Option<ShuttleAction>),
}

struct App {
    config: Config,
    context_tx: watch::Sender<PollContext>,
    snapshot: Arc<ShuttleSnapshot>,
    animator: PositionAnimator,
    scroller: AutoScroller,
    robot_index: usize,
    grid_rows: u16,
    follow: bool,
    help_open: bool,
    status_note: Option<String>,
}

impl App {
    fn new(
        config: Config,
        context_tx: watch::Sender<PollContext>,
        snapshot: Arc<ShuttleSnapshot>,
    ) -> Self {
        Self {
            config,
            context_tx,
            snapshot,
            animator: PositionAnimator::new(),
            scroller: AutoScroller::new(),
            robot_index: 0,
            grid_rows: 0,
            follow: true,
            help_open: false,
            status_note: None,
        }
    }

    fn selected_robot(&self) -> Option<&str> {
        self.config.robots.get(self.robot_index).map(String::as_str)
    }

    fn metrics(&self) -> ViewportMetrics {
        ViewportMetrics {
            viewport_height: f64::from(self.grid_rows) * RACK_PITCH_PX,
            content_height: self.config.racks as f64 * RACK_PITCH_PX,
        }
    }

    fn set_grid_rows(&mut self, rows: u16) {
        if rows == self.grid_rows {
            return;
        }
        self.grid_rows = rows;
        let top = self.scroller.scroll_top();
        let metrics = self.metrics();
        self.scroller.set_scroll_top(top, metrics);
    }

    fn first_visible_rack(&self) -> i64 {
        (self.scroller.scroll_top() / RACK_PITCH_PX).floor() as i64
    }

    /// Take a new published snapshot. The animator only reacts when the
    /// shuttle state itself changed.
    fn apply_snapshot(&mut self, snapshot: Arc<ShuttleSnapshot>, now: Instant) {
        if snapshot.topic != self.snapshot.topic {
            self.reset_view();
        }
        if snapshot.state != self.snapshot.state {
            self.animator.observe(&snapshot.state, now);
            // a snap has no frames for on_frame to follow
            if self.follow && !self.animator.is_animating() && snapshot.state.is_shuttle_visible() {
                let metrics = self.metrics();
                self.scroller
                    .follow(self.animator.position_px(), metrics, now);
            }
        }
        self.snapshot = snapshot;
    }

    /// Advance the animation by one frame. Returns whether anything moved.
    fn on_frame(&mut self, now: Instant) -> bool {
        let Some(frame) = self.animator.step(now) else {
            return false;
        };
        if self.follow {
            let metrics = self.metrics();
            self.scroller.follow(frame.position_px, metrics, now);
        }
        true
    }

    fn reset_view(&mut self) {
        self.animator.reset();
        self.scroller = AutoScroller::new();
    }

    fn select_next_robot(&mut self) {
        if self.config.robots.len() < 2 {
            self.status_note = Some("no other robot configured".to_string());
            return;
        }
        self.robot_index = (self.robot_index + 1) % self.config.robots.len();
        let robot = self.selected_robot().map(str::to_string);
        self.context_tx
            .send_modify(|context| context.robot_name = robot.clone());
        self.reset_view();
        self.status_note = Some(format!(
            "switched to robot {}",
            robot.unwrap_or_default()
        ));
    }

    fn reload_token(&mut self) {
        let Some(path) = self.config.token_file.clone() else {
            self.status_note = Some("no token file configured".to_string());
            return;
        };
        match read_token_file(&path) {
            Some(token) => {
                self.context_tx
                    .send_modify(|context| context.token = Some(token.clone()));
                self.status_note = Some("auth token reloaded".to_string());
            }
            None => {
                warn!(event = "token_reload_failed", path = %path.display());
                self.status_note = Some(format!("no token in {}", path.display()));
            }
        }
    }

    fn scroll_by(&mut self, racks: i64) {
        let top = self.scroller.scroll_top() + racks as f64 * RACK_PITCH_PX;
        let metrics = self.metrics();
        self.scroller.set_scroll_top(top, metrics);
    }

    fn toggle_follow(&mut self) {
        self.follow = !self.follow;
        self.status_note = Some(if self.follow {
            "following shuttle".to_string()
        } else {
            "follow paused".to_string()
        });
    }

    fn poll_health_label(&self) -> String {
        match self.snapshot.error.as_ref() {
            None if self.snapshot.applied_at.is_some() || self.snapshot.stats.empty > 0 => {
                "live".to_string()
            }
            None => "waiting".to_string(),
            Some(PollError::Unauthenticated) => "no auth token".to_string(),
            Some(PollError::TopicNotConfigured) => "no topic".to_string(),
            Some(PollError::Transport(_)) => "stale (transport)".to_string(),
            Some(PollError::MalformedMessage(_)) => "stale (decode)".to_string(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = load_config();
    init_logging(&config);

    let (writer, mut reader) = shuttle_store();
    let (context_tx, context_rx) = watch::channel(initial_poll_context(&config));
    let client = Arc::new(HttpSubscribeClient::new(
        &config.pubsub_url,
        config.request_timeout,
    )?);
    let poller = Poller::new(client, context_rx, writer).start();
    info!(
        event = "mission_control_start",
        pubsub_url = %config.pubsub_url,
        robots = config.robots.len()
    );

    let mut app = App::new(config, context_tx, reader.snapshot());

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    let mut events = EventStream::new();
    let mut frame_ticker = tokio::time::interval(Duration::from_millis(FRAME_INTERVAL_MS));
    frame_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut store_open = true;
    let mut dirty = true;

    loop {
        if dirty {
            let size = terminal.size()?;
            app.set_grid_rows(grid_rows_for_height(size.height));
            terminal.draw(|frame| render_ui(frame, &app))?;
            dirty = false;
        }

        tokio::select! {
            _ = frame_ticker.tick() => {
                dirty = app.on_frame(Instant::now());
            }
            changed = reader.changed(), if store_open => {
                match changed {
                    Ok(snapshot) => {
                        app.apply_snapshot(snapshot, Instant::now());
                        dirty = true;
                    }
                    Err(_) => {
                        store_open = false;
                        app.status_note = Some("poller stopped".to_string());
                        dirty = true;
                    }
                }
            }
            maybe_event = events.next() => {
                if let Some(Ok(event)) = maybe_event {
                    if handle_input(event, &mut app) {
                        break;
                    }
                    dirty = true;
                }
            }
        }
    }

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    let stats = poller.stop().await;
    info!(
        event = "mission_control_stop",
        ticks = stats.ticks,
        applied = stats.applied,
        aborted = stats.aborted
    );
    Ok(())
}

#[derive(Clone, Copy)]
struct ShuttleTheme {
    bg: Color,
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
    info: Color,
}

fn shuttle_theme() -> ShuttleTheme {
    ShuttleTheme {
        bg: Color::Rgb(11, 18, 32),
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
        info: Color::Rgb(59, 130, 246),
    }
}

fn grid_rows_for_height(height: u16) -> u16 {
    // two border lines around the grid
    height.saturating_sub(HEADER_HEIGHT + KPI_HEIGHT + 2)
}

fn render_ui(frame: &mut ratatui::Frame, app: &App) {
    let size = frame.size();
    let theme = shuttle_theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(HEADER_HEIGHT),
            Constraint::Length(KPI_HEIGHT),
            Constraint::Min(0),
        ])
        .split(size);
    frame.render_widget(render_header(app, theme, size.width), layout[0]);
    frame.render_widget(render_kpis(app, theme, size.width), layout[1]);
    frame.render_widget(render_grid(app, theme), layout[2]);
    if app.help_open {
        render_help_overlay(frame, theme);
    }
}

fn render_header(app: &App, theme: ShuttleTheme, width: u16) -> Paragraph<'static> {
    let compact = is_compact(width);
    let inner_width = width.saturating_sub(4) as usize;
    let snapshot = &app.snapshot;
    let robot = app.selected_robot().unwrap_or("(none)");
    let topic = snapshot.topic.as_deref().unwrap_or("(unresolved)");
    let mut fields = vec![
        format!("Robot: {}", ellipsize(robot, if compact { 12 } else { 24 })),
        format!("Topic: {}", ellipsize(topic, if compact { 18 } else { 36 })),
        format!("Poll: {}", app.poll_health_label()),
    ];
    if !compact {
        fields.push(format!("Last record: {}", format_clock(snapshot.record_at)));
        fields.push(format!("Follow: {}", if app.follow { "on" } else { "off" }));
    }
    let status_line = fit_fields(&fields, inner_width.max(12));

    let (detail, detail_color) = if let Some(err) = snapshot.error.as_ref() {
        (format!("Error: {err}"), error_color(err, theme))
    } else if let Some(note) = app.status_note.as_deref() {
        (format!("Last Action: {note}"), theme.info)
    } else if compact {
        ("Last Action: ready".to_string(), theme.muted)
    } else {
        (
            "Last Action: ready (Tab robot, f follow, ? help)".to_string(),
            theme.muted,
        )
    };

    Paragraph::new(Text::from(vec![
        Line::from(Span::styled(status_line, Style::default().fg(theme.text))),
        Line::from(Span::styled(
            ellipsize(&detail, inner_width.max(12)),
            Style::default().fg(detail_color),
        )),
    ]))
    .style(Style::default().fg(theme.text).bg(theme.bg))
    .block(panel_block("Status", theme, theme.bg))
}

fn render_kpis(app: &App, theme: ShuttleTheme, width: u16) -> Paragraph<'static> {
    let compact = is_compact(width);
    let inner_width = width.saturating_sub(4) as usize;
    let state = &app.snapshot.state;
    let mut fields = vec![
        format!("State: {}", state.store_data_display),
        format!(
            "Destination: {}",
            state
                .destination_name
                .map(|slot| format!("slot {slot}"))
                .unwrap_or_else(|| "-".to_string())
        ),
        format!("Speed: {}", format_speed(app.animator.speed())),
    ];
    if !compact {
        fields.push(format!(
            "Tray: {}",
            state.shuttle_move_tray.as_deref().unwrap_or("-")
        ));
        fields.push(format!("Avg: {}", format_speed(app.animator.average_speed())));
        fields.push(format!(
            "Distance: {:.0} racks",
            app.animator.total_distance()
        ));
    }
    let line = fit_fields(&fields, inner_width.max(12));
    let color = action_color(state.shuttle_action, theme);

    Paragraph::new(Line::from(Span::styled(line, Style::default().fg(color))))
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .block(panel_block("Shuttle", theme, theme.surface))
}

fn render_grid(app: &App, theme: ShuttleTheme) -> Paragraph<'static> {
    let lines = rack_grid_lines(app, theme, app.grid_rows as usize);
    Paragraph::new(Text::from(lines))
        .style(Style::default().fg(theme.text).bg(theme.surface))
        .block(panel_block("Racks", theme, theme.surface))
}

fn panel_block(title: &'static str, theme: ShuttleTheme, bg: Color) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.border))
        .style(Style::default().bg(bg))
        .title(Span::styled(
            title,
            Style::default()
                .fg(theme.title)
                .add_modifier(Modifier::BOLD),
        ))
}

/// Row 0 depths run right-to-left toward the aisle, row 1 left-to-right.
fn rack_grid_lines(app: &App, theme: ShuttleTheme, rows: usize) -> Vec<Line<'static>> {
    let state = &app.snapshot.state;
    let visible = state.is_shuttle_visible();
    let shuttle_rack = visible.then(|| app.animator.current_rack());
    let color = action_color(state.shuttle_action, theme);
    let first = app.first_visible_rack().max(0);
    let last = (first + rows as i64).min(app.config.racks);

    let mut lines = Vec::with_capacity(rows);
    for rack in first..last {
        let mut spans = vec![Span::styled(
            format!("{rack:>3} "),
            Style::default().fg(theme.muted),
        )];
        for depth in (0..app.config.depths).rev() {
            spans.push(cell_span(cell_mark(state, 0, rack, depth), theme, color));
        }
        if shuttle_rack == Some(rack) {
            spans.push(Span::styled(
                " ◆ ",
                Style::default().fg(color).add_modifier(Modifier::BOLD),
            ));
        } else {
            spans.push(Span::styled(" │ ", Style::default().fg(theme.border)));
        }
        for depth in 0..app.config.depths {
            spans.push(cell_span(cell_mark(state, 1, rack, depth), theme, color));
        }
        if visible && state.store_rack == Some(rack) {
            if let Some(slot) = state.destination_name {
                spans.push(Span::styled(
                    format!("  ← slot {slot}"),
                    Style::default().fg(color),
                ));
            }
        }
        lines.push(Line::from(spans));
    }
    if lines.is_empty() {
        lines.push(Line::from(Span::styled(
            "(no racks configured)",
            Style::default().fg(theme.muted),
        )));
    }
    lines
}

fn cell_mark(state: &ShuttleState, row: i64, rack: i64, depth: i64) -> CellMark {
    let targeted = state.is_shuttle_visible()
        && state.store_row == row
        && state.store_rack == Some(rack)
        && state.store_depth.unwrap_or(0) == depth;
    if targeted {
        CellMark::Target(state.shuttle_action)
    } else {
        CellMark::Empty
    }
}

fn cell_span(mark: CellMark, theme: ShuttleTheme, color: Color) -> Span<'static> {
    match mark {
        CellMark::Empty => Span::styled("[  ]", Style::default().fg(theme.border)),
        CellMark::Target(_) => Span::styled(
            "[##]",
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        ),
    }
}

fn action_color(action: Option<ShuttleAction>, theme: ShuttleTheme) -> Color {
    match action {
        Some(ShuttleAction::Storing) => theme.warn,
        Some(ShuttleAction::Stored) => theme.ok,
        Some(ShuttleAction::Retrieved) => theme.info,
        Some(ShuttleAction::Retrieve) => theme.accent,
        Some(ShuttleAction::Backward | ShuttleAction::Forward) | None => theme.muted,
    }
}

fn error_color(error: &PollError, theme: ShuttleTheme) -> Color {
    if error.is_tick_skip() {
        theme.warn
    } else {
        theme.critical
    }
}

fn render_help_overlay(frame: &mut ratatui::Frame, theme: ShuttleTheme) {
    let area = centered_rect(60, 60, frame.size());
    let key = |k: &'static str| Span::styled(k, Style::default().fg(theme.accent));
    let lines = vec![
        Line::from(vec![key("q"), Span::raw("        quit")]),
        Line::from(vec![key("?"), Span::raw("        toggle help")]),
        Line::from(vec![key("Tab"), Span::raw("      next robot")]),
        Line::from(vec![key("f"), Span::raw("        follow shuttle on/off")]),
        Line::from(vec![key("↑/↓"), Span::raw("      scroll one rack")]),
        Line::from(vec![key("PgUp/PgDn"), Span::raw(" scroll a page")]),
        Line::from(vec![key("g"), Span::raw("        jump to shuttle")]),
        Line::from(vec![key("t"), Span::raw("        reload token file")]),
    ];
    frame.render_widget(Clear, area);
    frame.render_widget(
        Paragraph::new(Text::from(lines))
            .wrap(Wrap { trim: false })
            .style(Style::default().fg(theme.text).bg(theme.bg))
            .block(panel_block("Help", theme, theme.bg)),
        area,
    );
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);
    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(vertical[1])[1]
}

fn format_speed(speed: f64) -> String {
    format!("{speed:.1} r/s")
}

fn format_clock(at: Option<DateTime<Utc>>) -> String {
    at.map(|value| value.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn ellipsize(input: &str, max: usize) -> String {
    if input.chars().count() <= max {
        return input.to_string();
    }
    if max <= 3 {
        return input.chars().take(max).collect();
    }
    let mut out: String = input.chars().take(max - 3).collect();
    out.push_str("...");
    out
}

fn fit_fields(fields: &[String], max: usize) -> String {
    let mut out = String::new();
    for field in fields {
        let candidate = if out.is_empty() {
            field.clone()
        } else {
            format!("{out} | {field}")
        };
        if candidate.chars().count() > max {
            if out.is_empty() {
                return ellipsize(field, max);
            }
            break;
        }
        out = candidate;
    }
    out
}

fn is_compact(width: u16) -> bool {
    width < COMPACT_WIDTH
}

fn handle_input(event: Event, app: &mut App) -> bool {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => handle_key(key, app),
        _ => false,
    }
}

fn handle_key(key: KeyEvent, app: &mut App) -> bool {
    if matches!(key.code, KeyCode::Char('?') | KeyCode::F(1)) {
        app.help_open = !app.help_open;
        return false;
    }
    if key.code == KeyCode::Esc && app.help_open {
        app.help_open = false;
        return false;
    }
    if app.help_open {
        return false;
    }

    match key.code {
        KeyCode::Char('q') => true,
        KeyCode::Tab => {
            app.select_next_robot();
            false
        }
        KeyCode::Char('f') => {
            app.toggle_follow();
            false
        }
        KeyCode::Char('t') => {
            app.reload_token();
            false
        }
        KeyCode::Down | KeyCode::Char('j') => {
            app.scroll_by(1);
            false
        }
        KeyCode::Up | KeyCode::Char('k') => {
            app.scroll_by(-1);
            false
        }
        KeyCode::PageDown => {
            app.scroll_by(SCROLL_PAGE_RACKS);
            false
        }
        KeyCode::PageUp => {
            app.scroll_by(-SCROLL_PAGE_RACKS);
            false
        }
        KeyCode::Char('g') => {
            let rack = app.animator.current_rack();
            let rows = i64::from(app.grid_rows);
            let metrics = app.metrics();
            app.scroller
                .set_scroll_top((rack - rows / 2) as f64 * RACK_PITCH_PX, metrics);
            false
        }
        _ => false,
    }
}

fn load_config() -> Config {
    let args = Args::parse();
    let robots = args
        .robots
        .iter()
        .map(|robot| robot.trim().to_string())
        .filter(|robot| !robot.is_empty())
        .collect();
    let token = args
        .token
        .filter(|value| !value.trim().is_empty())
        .or_else(|| args.token_file.as_deref().and_then(read_token_file));
    Config {
        pubsub_url: args.pubsub_url,
        api_name: args.api_name.filter(|value| !value.trim().is_empty()),
        robots,
        token,
        token_file: args.token_file,
        racks: i64::from(args.racks),
        depths: i64::from(args.depths.max(1)),
        request_timeout: Duration::from_secs(args.request_timeout_secs.max(1)),
        log_file: args.log_file,
        debug: args.debug,
    }
}

fn initial_poll_context(config: &Config) -> PollContext {
    PollContext {
        token: config.token.clone(),
        api_name: config.api_name.clone(),
        robot_name: config.robots.first().cloned(),
    }
}

fn read_token_file(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn init_logging(config: &Config) {
    let level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let file = config.log_file.as_ref().map(|path| {
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
    });
    match file {
        Some(Ok(file)) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        other => {
            if let Some(Err(err)) = other {
                eprintln!("log_file_error: {err}");
            }
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::sink)
                .try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::KeyModifiers;
    use shuttle_core::motion::ANIMATION_DURATION;
    use shuttle_core::{CellCoord, DisplayLabel};

    fn test_config() -> Config {
        Config {
            pubsub_url: "http://127.0.0.1:9/pubsub".to_string(),
            api_name: Some("Nanostore".to_string()),
            robots: vec!["r1".to_string(), "r2".to_string()],
            token: Some("tok".to_string()),
            token_file: None,
            racks: 40,
            depths: 2,
            request_timeout: Duration::from_secs(1),
            log_file: None,
            debug: false,
        }
    }

    fn test_app() -> (App, watch::Receiver<PollContext>) {
        let config = test_config();
        let (tx, rx) = watch::channel(initial_poll_context(&config));
        let mut app = App::new(config, tx, Arc::new(ShuttleSnapshot::default()));
        app.set_grid_rows(10);
        (app, rx)
    }

    fn snapshot_at(row: i64, rack: i64, action: ShuttleAction, topic: &str) -> Arc<ShuttleSnapshot> {
        let mut state = ShuttleState::default();
        state.set_target(
            CellCoord {
                row,
                rack,
                slot: 4,
                depth: 1,
            },
            action,
            DisplayLabel::Storing,
        );
        Arc::new(ShuttleSnapshot {
            state,
            topic: Some(topic.to_string()),
            ..ShuttleSnapshot::default()
        })
    }

    fn press(code: KeyCode) -> Event {
        Event::Key(KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn line_text(line: &Line<'_>) -> String {
        line.spans.iter().map(|span| span.content.as_ref()).collect()
    }

    #[test]
    fn rack_change_animates_and_follows_shuttle() {
        let (mut app, _rx) = test_app();
        let start = Instant::now();
        app.apply_snapshot(snapshot_at(0, 1, ShuttleAction::Storing, "nanostore_r1"), start);
        assert!(!app.animator.is_animating());

        let moved = start + Duration::from_secs(2);
        app.apply_snapshot(snapshot_at(0, 30, ShuttleAction::Storing, "nanostore_r1"), moved);
        assert!(app.animator.is_animating());
        assert!(app.animator.speed() > 0.0);

        let mut tick = moved;
        while tick <= moved + ANIMATION_DURATION {
            app.on_frame(tick);
            tick += Duration::from_millis(FRAME_INTERVAL_MS);
        }
        app.on_frame(moved + ANIMATION_DURATION);
        assert_eq!(app.animator.current_rack(), 30);
        assert!(!app.animator.is_animating());
        assert!(app.first_visible_rack() > 0);
    }

    #[test]
    fn first_snapshot_scrolls_shuttle_into_view() {
        let (mut app, _rx) = test_app();
        app.apply_snapshot(snapshot_at(0, 30, ShuttleAction::Storing, "nanostore_r1"), Instant::now());
        assert!(!app.animator.is_animating());
        let metrics = app.metrics();
        assert!(app.scroller.is_in_view(app.animator.position_px(), metrics));
        assert!(app.first_visible_rack() > 20);

        handle_input(press(KeyCode::Tab), &mut app);
        assert_eq!(app.first_visible_rack(), 0);
        app.apply_snapshot(snapshot_at(1, 30, ShuttleAction::Stored, "nanostore_r2"), Instant::now());
        assert!(app.first_visible_rack() > 20);
    }

    #[test]
    fn unchanged_state_does_not_restart_animation() {
        let (mut app, _rx) = test_app();
        let start = Instant::now();
        app.apply_snapshot(snapshot_at(0, 1, ShuttleAction::Storing, "t"), start);
        app.apply_snapshot(snapshot_at(0, 5, ShuttleAction::Storing, "t"), start + Duration::from_secs(1));
        let distance = app.animator.total_distance();
        app.apply_snapshot(snapshot_at(0, 5, ShuttleAction::Storing, "t"), start + Duration::from_secs(2));
        assert_eq!(app.animator.total_distance(), distance);
    }

    #[test]
    fn topic_change_resets_animation() {
        let (mut app, _rx) = test_app();
        let start = Instant::now();
        app.apply_snapshot(snapshot_at(0, 1, ShuttleAction::Storing, "nanostore_r1"), start);
        app.apply_snapshot(snapshot_at(0, 9, ShuttleAction::Storing, "nanostore_r1"), start + Duration::from_secs(1));
        assert_eq!(app.animator.total_distance(), 8.0);
        app.apply_snapshot(snapshot_at(1, 3, ShuttleAction::Stored, "nanostore_r2"), start + Duration::from_secs(2));
        assert_eq!(app.animator.total_distance(), 0.0);
        assert_eq!(app.animator.current_rack(), 3);
    }

    #[test]
    fn grid_marks_shuttle_and_target_cell() {
        let (mut app, _rx) = test_app();
        app.apply_snapshot(snapshot_at(1, 3, ShuttleAction::Stored, "t"), Instant::now());
        let lines = rack_grid_lines(&app, shuttle_theme(), 10);
        assert_eq!(lines.len(), 10);
        let shuttle_line = line_text(&lines[3]);
        assert!(shuttle_line.contains('◆'));
        assert!(shuttle_line.ends_with("  ← slot 4"));
        assert_eq!(shuttle_line.matches("[##]").count(), 1);
        assert!(!line_text(&lines[2]).contains('◆'));

        assert_eq!(
            cell_mark(&app.snapshot.state, 1, 3, 1),
            CellMark::Target(Some(ShuttleAction::Stored))
        );
        assert_eq!(cell_mark(&app.snapshot.state, 0, 3, 1), CellMark::Empty);
    }

    #[test]
    fn hidden_shuttle_is_not_drawn() {
        let (mut app, _rx) = test_app();
        let snapshot = snapshot_at(2, 3, ShuttleAction::Stored, "t");
        app.apply_snapshot(snapshot, Instant::now());
        let lines = rack_grid_lines(&app, shuttle_theme(), 10);
        assert!(lines.iter().all(|line| !line_text(line).contains('◆')));
        assert!(lines.iter().all(|line| !line_text(line).contains("[##]")));
    }

    #[test]
    fn tab_cycles_robots_and_updates_poll_context() {
        let (mut app, rx) = test_app();
        assert_eq!(rx.borrow().robot_name.as_deref(), Some("r1"));
        assert!(!handle_input(press(KeyCode::Tab), &mut app));
        assert_eq!(rx.borrow().robot_name.as_deref(), Some("r2"));
        assert_eq!(app.selected_robot(), Some("r2"));
        handle_input(press(KeyCode::Tab), &mut app);
        assert_eq!(rx.borrow().robot_name.as_deref(), Some("r1"));
    }

    #[test]
    fn keys_toggle_follow_help_and_quit() {
        let (mut app, _rx) = test_app();
        handle_input(press(KeyCode::Char('f')), &mut app);
        assert!(!app.follow);
        handle_input(press(KeyCode::Char('?')), &mut app);
        assert!(app.help_open);
        // swallowed while help is open
        assert!(!handle_input(press(KeyCode::Char('q')), &mut app));
        handle_input(press(KeyCode::Esc), &mut app);
        assert!(!app.help_open);
        assert!(handle_input(press(KeyCode::Char('q')), &mut app));
    }

    #[test]
    fn manual_scroll_is_bounded_by_rack_count() {
        let (mut app, _rx) = test_app();
        handle_input(press(KeyCode::Up), &mut app);
        assert_eq!(app.first_visible_rack(), 0);
        for _ in 0..10 {
            handle_input(press(KeyCode::PageDown), &mut app);
        }
        assert_eq!(app.first_visible_rack(), 30);
    }

    #[test]
    fn poll_health_reflects_errors() {
        let (mut app, _rx) = test_app();
        assert_eq!(app.poll_health_label(), "waiting");
        app.snapshot = Arc::new(ShuttleSnapshot {
            error: Some(PollError::Unauthenticated),
            ..ShuttleSnapshot::default()
        });
        assert_eq!(app.poll_health_label(), "no auth token");
        app.snapshot = Arc::new(ShuttleSnapshot {
            applied_at: Some(Utc::now()),
            ..ShuttleSnapshot::default()
        });
        assert_eq!(app.poll_health_label(), "live");
    }

    #[test]
    fn fit_fields_truncates_on_field_boundaries() {
        let fields = vec![
            "Robot: r1".to_string(),
            "Topic: nanostore_r1".to_string(),
            "Poll: live".to_string(),
        ];
        assert_eq!(fit_fields(&fields, 32), "Robot: r1 | Topic: nanostore_r1");
        assert_eq!(fit_fields(&fields, 6), "Rob...");
        assert_eq!(format_speed(3.456), "3.5 r/s");
    }
}
