use clap::Parser;
use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyModifiers,
    MouseButton, MouseEvent, MouseEventKind,
};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use fragmap::aggregator::FileHighlight;
use fragmap::config::{Cli, FragmapConfig, ModelSource};
use fragmap::fiemap::FiemapSource;
use fragmap::scanner::{ExtentSource, FragScanner, ProgressReporter, ScanPhase, ScanProgress, ScanStats};
use fragmap::view::GridSummary;
use fragmap::watcher::ModelWatcher;
use fragmap::{
    snapshot, Cluster, ClusterState, DisplayArea, FileModel, FileRecord, FragmapView, SelectionState,
    SharedFileModel, Viewport, ZoomDirection,
};
use ratatui::backend::CrosstermBackend;
use ratatui::buffer::Buffer;
use ratatui::layout::{Constraint, Layout, Rect as UiRect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState, StatefulWidget, Widget};
use ratatui::{Frame, Terminal};
use std::io::{self, stdout};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info};

const BLEACH_FACTOR: f64 = 0.3;

enum ScanEvent {
    Progress(ScanProgress),
    Completed(Result<ScanStats, String>),
}

/// Cell colors. Built once and handed to the map widget.
#[derive(Debug, Clone, Copy)]
struct Palette {
    back: Color,
    back_bleached: Color,
    free: Color,
    free_bleached: Color,
    free_selected: Color,
    frag: Color,
    frag_bleached: Color,
    nfrag: Color,
    nfrag_bleached: Color,
}

fn rgb(c: [f64; 3]) -> Color {
    Color::Rgb((c[0] * 255.0) as u8, (c[1] * 255.0) as u8, (c[2] * 255.0) as u8)
}

fn bleached(c: [f64; 3]) -> Color {
    rgb(c.map(|k| 1.0 - (1.0 - k) * BLEACH_FACTOR))
}

impl Default for Palette {
    fn default() -> Self {
        let back = [0.25, 0.25, 0.25];
        let free = [1.0, 1.0, 1.0];
        let frag = [0.8, 0.0, 0.0];
        let nfrag = [0.0, 0.0, 0.8];
        Self {
            back: rgb(back),
            back_bleached: bleached(back),
            free: rgb(free),
            free_bleached: bleached(free),
            free_selected: rgb([1.0, 1.0, 0.0]),
            frag: rgb(frag),
            frag_bleached: bleached(frag),
            nfrag: rgb(nfrag),
            nfrag_bleached: bleached(nfrag),
        }
    }
}

impl Palette {
    fn cell(&self, state: ClusterState, dimmed: bool) -> Color {
        match (state, dimmed) {
            (ClusterState::Free, false) => self.free,
            (ClusterState::Free, true) => self.free_bleached,
            (ClusterState::Fragmented, false) => self.frag,
            (ClusterState::Fragmented, true) => self.frag_bleached,
            (ClusterState::NonFragmented, false) => self.nfrag,
            (ClusterState::NonFragmented, true) => self.nfrag_bleached,
        }
    }
}

#[derive(Default, Clone, Copy)]
struct UiLayoutState {
    map_inner_area: Option<UiRect>,
    list_inner_area: Option<UiRect>,
}

struct App {
    config: FragmapConfig,
    shared: SharedFileModel,
    view: FragmapView,
    palette: Palette,
    source: Option<Arc<FiemapSource>>,
    watcher: Option<ModelWatcher>,

    status: String,
    is_scanning: bool,
    scan_progress: Option<ScanProgress>,
    scan_rx: Option<Receiver<ScanEvent>>,

    drill_down: Vec<FileRecord>,
    list_cursor: usize,
    ui_layout: UiLayoutState,

    should_quit: bool,
}

impl App {
    fn new(config: FragmapConfig) -> fragmap::Result<Self> {
        let (model, source, status) = match &config.source {
            ModelSource::Snapshot(path) => {
                let model = snapshot::load(path)?;
                let status = format!("Loaded {} files from {}", model.len(), path.display());
                (model, None, status)
            }
            ModelSource::Scan(path) => {
                let source = Arc::new(FiemapSource::new(path)?);
                (FileModel::new(0), Some(source), "Press s to scan".to_string())
            }
        };
        let shared = SharedFileModel::new(model);
        let view = FragmapView::new(shared.clone(), config.calculator, config.cluster_size);
        Ok(Self {
            config,
            shared,
            view,
            palette: Palette::default(),
            source,
            watcher: None,
            status,
            is_scanning: false,
            scan_progress: None,
            scan_rx: None,
            drill_down: Vec::new(),
            list_cursor: 0,
            ui_layout: UiLayoutState::default(),
            should_quit: false,
        })
    }

    fn scan_root(&self) -> Option<PathBuf> {
        match &self.config.source {
            ModelSource::Scan(path) => Some(path.clone()),
            ModelSource::Snapshot(_) => None,
        }
    }

    fn start_scan(&mut self) {
        if self.is_scanning {
            return;
        }
        let (Some(root), Some(source)) = (self.scan_root(), self.source.clone()) else {
            self.status = "Snapshot loaded; nothing to scan".to_string();
            return;
        };

        self.status = format!("Scanning {} ...", root.display());
        self.is_scanning = true;
        self.watcher = None;

        let (tx, rx) = mpsc::channel::<ScanEvent>();
        self.scan_rx = Some(rx);
        let shared = self.shared.clone();

        thread::spawn(move || {
            let mut scanner = FragScanner::new();
            let progress_tx = tx.clone();
            let reporter: ProgressReporter = Arc::new(move |progress: ScanProgress| {
                let _ = progress_tx.send(ScanEvent::Progress(progress));
            });

            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                scanner.scan_with_progress(&root, source.as_ref(), &shared, Some(reporter))
            }));

            let event = match result {
                Ok(Ok(stats)) => ScanEvent::Completed(Ok(stats)),
                Ok(Err(err)) => ScanEvent::Completed(Err(err.to_string())),
                Err(_) => ScanEvent::Completed(Err("Scan thread panicked".to_string())),
            };
            let _ = tx.send(event);
        });
    }

    fn poll_scan_updates(&mut self) {
        let mut done: Option<Result<ScanStats, String>> = None;
        let mut disconnected = false;

        if let Some(rx) = self.scan_rx.as_ref() {
            loop {
                match rx.try_recv() {
                    Ok(ScanEvent::Progress(progress)) => self.scan_progress = Some(progress),
                    Ok(ScanEvent::Completed(result)) => done = Some(result),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
        }

        if disconnected {
            self.scan_rx = None;
            self.is_scanning = false;
            if done.is_none() {
                self.status = "Scan channel disconnected".to_string();
            }
        }

        if let Some(result) = done {
            self.scan_rx = None;
            self.is_scanning = false;
            self.scan_progress = None;
            match result {
                Ok(stats) => {
                    self.status = format!(
                        "Scan complete: {} files, {} fragmented, {} ms",
                        stats.total_files, stats.fragmented_files, stats.duration_ms
                    );
                    self.after_scan();
                }
                Err(err) => {
                    error!(%err, "scan failed");
                    self.status = format!("Scan failed: {}", err);
                }
            }
        }
    }

    fn after_scan(&mut self) {
        if let Some(path) = self.config.save_snapshot.clone() {
            let saved = snapshot::save(&path, &self.shared.lock());
            match saved {
                Ok(()) => info!(path = %path.display(), "snapshot written"),
                Err(err) => self.status = format!("Snapshot not saved: {}", err),
            }
        }

        if self.config.watch {
            let (Some(root), Some(source)) = (self.scan_root(), self.source.clone()) else {
                return;
            };
            let source: Arc<dyn ExtentSource> = source;
            match ModelWatcher::spawn(&root, source, self.shared.clone()) {
                Ok(watcher) => self.watcher = Some(watcher),
                Err(err) => self.status = format!("Watch failed: {}", err),
            }
        }
    }

    fn sync_drill_down(&mut self) {
        self.drill_down = self.view.drill_down_list();
        if self.list_cursor >= self.drill_down.len() {
            self.list_cursor = self.drill_down.len().saturating_sub(1);
        }
    }

    fn highlight_cursor_file(&mut self) {
        if let Some(file) = self.drill_down.get(self.list_cursor) {
            self.view.on_file_set_requested(vec![file.id]);
        }
    }

    fn highlight_all_listed(&mut self) {
        if !self.drill_down.is_empty() {
            let ids = self.drill_down.iter().map(|f| f.id).collect();
            self.view.on_file_set_requested(ids);
        }
    }

    fn step_selection(&mut self, delta: i64) {
        let current = match self.view.selection_state() {
            SelectionState::ClusterSelected(index) => *index,
            _ => 0,
        };
        let next = if delta < 0 {
            current.saturating_sub(delta.unsigned_abs())
        } else {
            current.saturating_add(delta as u64)
        };
        if self.view.select_cluster(next) {
            self.list_cursor = 0;
            self.sync_drill_down();
        }
    }

    fn page_rows(&self) -> i64 {
        self.view
            .viewport()
            .map(|vp| vp.rows_visible.max(1) as i64)
            .unwrap_or(1)
    }

    fn on_key(&mut self, key: KeyEvent) {
        if key.modifiers.contains(KeyModifiers::CONTROL) && matches!(key.code, KeyCode::Char('c')) {
            self.should_quit = true;
            return;
        }

        match key.code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Char('s') | KeyCode::Char('r') => self.start_scan(),
            KeyCode::Char('+') | KeyCode::Char('=') => {
                self.view.on_zoom_step(ZoomDirection::In);
            }
            KeyCode::Char('-') => {
                self.view.on_zoom_step(ZoomDirection::Out);
            }
            KeyCode::Char('a') => self.highlight_all_listed(),
            KeyCode::Left => self.step_selection(-1),
            KeyCode::Right => self.step_selection(1),
            KeyCode::Up => self.list_cursor = self.list_cursor.saturating_sub(1),
            KeyCode::Down => {
                if self.list_cursor + 1 < self.drill_down.len() {
                    self.list_cursor += 1;
                }
            }
            KeyCode::Enter => self.highlight_cursor_file(),
            KeyCode::PageUp => {
                self.view.scroll_by(-self.page_rows());
            }
            KeyCode::PageDown => {
                self.view.scroll_by(self.page_rows());
            }
            KeyCode::Home => {
                self.view.on_scroll_offset_changed(0);
            }
            KeyCode::End => {
                self.view.on_scroll_offset_changed(u64::MAX);
            }
            KeyCode::Esc => {
                self.view.reset();
                self.drill_down.clear();
                self.list_cursor = 0;
            }
            _ => {}
        }
    }

    fn on_mouse(&mut self, event: MouseEvent) {
        match event.kind {
            MouseEventKind::Down(MouseButton::Left) | MouseEventKind::Drag(MouseButton::Left) => {
                if let Some(area) = self.ui_layout.map_inner_area {
                    if point_in_rect(area, event.column, event.row)
                        && self.view.on_pointer_interaction(
                            u32::from(event.column - area.x),
                            u32::from(event.row - area.y),
                        )
                    {
                        self.list_cursor = 0;
                        self.sync_drill_down();
                        return;
                    }
                }
                if let (MouseEventKind::Down(_), Some(area)) = (event.kind, self.ui_layout.list_inner_area) {
                    if point_in_rect(area, event.column, event.row) {
                        let row = usize::from(event.row - area.y);
                        if row < self.drill_down.len() {
                            self.list_cursor = row;
                            self.highlight_cursor_file();
                        }
                    }
                }
            }
            MouseEventKind::ScrollUp => {
                if event.modifiers.contains(KeyModifiers::CONTROL) {
                    self.view.on_zoom_step(ZoomDirection::In);
                } else {
                    self.view.scroll_by(-1);
                }
            }
            MouseEventKind::ScrollDown => {
                if event.modifiers.contains(KeyModifiers::CONTROL) {
                    self.view.on_zoom_step(ZoomDirection::Out);
                } else {
                    self.view.scroll_by(1);
                }
            }
            _ => {}
        }
    }
}

fn point_in_rect(rect: UiRect, x: u16, y: u16) -> bool {
    x >= rect.x
        && x < rect.x.saturating_add(rect.width)
        && y >= rect.y
        && y < rect.y.saturating_add(rect.height)
}

fn progress_status(progress: &ScanProgress) -> String {
    match progress.phase {
        ScanPhase::Discovering => format!("Discovering entries... {} found", progress.discovered_entries),
        ScanPhase::Probing => match progress.fraction() {
            Some(frac) => format!(
                "Mapping {:.0}% | files: {} fragmented: {}",
                frac * 100.0,
                progress.total_files,
                progress.fragmented_files,
            ),
            None => format!(
                "Mapping... files: {} fragmented: {}",
                progress.total_files, progress.fragmented_files,
            ),
        },
    }
}

struct ClusterMapWidget<'a> {
    clusters: &'a [Cluster],
    viewport: Viewport,
    cell_size: u16,
    selection: &'a SelectionState,
    highlight: &'a [FileHighlight],
    palette: &'a Palette,
}

impl ClusterMapWidget<'_> {
    fn fill_cell(&self, buf: &mut Buffer, area: UiRect, column: u64, row: u64, color: Color) {
        let cell = u64::from(self.cell_size);
        // Leave a one-unit gap between cells when they are large enough.
        let extent = if self.cell_size > 1 { self.cell_size - 1 } else { 1 };
        let x0 = u64::from(area.x) + column * cell;
        let y0 = u64::from(area.y) + row * cell;
        for dy in 0..u64::from(extent) {
            for dx in 0..u64::from(extent) {
                let (x, y) = (x0 + dx, y0 + dy);
                if x < u64::from(area.right()) && y < u64::from(area.bottom()) {
                    buf[(x as u16, y as u16)].set_char(' ').set_style(Style::default().bg(color));
                }
            }
        }
    }
}

impl Widget for ClusterMapWidget<'_> {
    fn render(self, area: UiRect, buf: &mut Buffer) {
        if area.width == 0 || area.height == 0 {
            return;
        }
        let dimmed = !matches!(self.selection, SelectionState::Overview);
        let back = if dimmed { self.palette.back_bleached } else { self.palette.back };
        for y in area.top()..area.bottom() {
            for x in area.left()..area.right() {
                buf[(x, y)].set_char(' ').set_style(Style::default().bg(back));
            }
        }

        for cluster in self.clusters {
            if let Some((column, row)) = self.viewport.cell_of(cluster.index) {
                self.fill_cell(buf, area, column, row, self.palette.cell(cluster.state(), dimmed));
            }
        }

        if let SelectionState::ClusterSelected(index) = self.selection {
            let selected = self.clusters.iter().find(|c| c.index == *index);
            if let (Some(cluster), Some((column, row))) = (selected, self.viewport.cell_of(*index)) {
                let color = match cluster.state() {
                    ClusterState::Free => self.palette.free_selected,
                    state => self.palette.cell(state, false),
                };
                self.fill_cell(buf, area, column, row, color);
            }
        }

        for hl in self.highlight {
            let color = if hl.fragmented { self.palette.frag } else { self.palette.nfrag };
            for &index in &hl.clusters {
                if let Some((column, row)) = self.viewport.cell_of(index) {
                    self.fill_cell(buf, area, column, row, color);
                }
            }
        }
    }
}

fn summary_line(summary: &GridSummary, desired: u64) -> String {
    format!(
        "{} clusters x {} blocks (zoom {}) | free {} frag {} ok {}",
        summary.clusters,
        summary.cluster_size,
        desired,
        summary.free,
        summary.fragmented,
        summary.nonfragmented,
    )
}

fn selection_text(state: &SelectionState) -> String {
    match state {
        SelectionState::Overview => "Overview".to_string(),
        SelectionState::ClusterSelected(index) => format!("Cluster #{}", index),
        SelectionState::FilesHighlighted(ids) => format!("{} file(s) highlighted", ids.len()),
    }
}

fn draw_ui(frame: &mut Frame, app: &mut App) {
    let root = frame.area();
    let split = Layout::horizontal([Constraint::Length(46), Constraint::Min(20)]).split(root);
    let left = split[0];
    let right = split[1];

    let map_block = Block::default()
        .title(" Fragmentation map (click: inspect, Ctrl+wheel: zoom) ")
        .borders(Borders::ALL);
    let map_inner = map_block.inner(right);
    frame.render_widget(map_block, right);
    app.ui_layout.map_inner_area = Some(map_inner);

    app.view
        .set_area(DisplayArea::new(u32::from(map_inner.width), u32::from(map_inner.height)));
    if app.view.refresh_logged() {
        app.sync_drill_down();
    }

    let left_block = Block::default().title(" fragmap ").borders(Borders::ALL);
    let left_inner = left_block.inner(left);
    frame.render_widget(left_block, left);

    let left_rows = Layout::vertical([
        Constraint::Length(5),
        Constraint::Length(3),
        Constraint::Min(6),
        Constraint::Length(6),
    ])
    .split(left_inner);

    let status_text = if app.is_scanning {
        app.scan_progress
            .as_ref()
            .map(progress_status)
            .unwrap_or_else(|| "Scanning...".to_string())
    } else {
        app.status.clone()
    };
    let mut status_lines = vec![
        Line::from(status_text),
        Line::from(Span::styled(
            summary_line(&app.view.summary(), app.view.desired_cluster_size()),
            Style::default().fg(Color::Gray),
        )),
    ];
    if app.watcher.is_some() {
        status_lines.push(Line::from(Span::styled("watching for changes", Style::default().fg(Color::Green))));
    }
    frame.render_widget(
        Paragraph::new(status_lines).block(Block::default().title(" Status ").borders(Borders::ALL)),
        left_rows[0],
    );

    frame.render_widget(
        Paragraph::new(selection_text(app.view.selection_state()))
            .block(Block::default().title(" Selection ").borders(Borders::ALL)),
        left_rows[1],
    );

    let list_block = Block::default().title(" Files in cluster ").borders(Borders::ALL);
    let list_inner = list_block.inner(left_rows[2]);
    frame.render_widget(list_block, left_rows[2]);
    app.ui_layout.list_inner_area = Some(list_inner);
    let list_lines: Vec<Line> = app
        .drill_down
        .iter()
        .enumerate()
        .take(usize::from(list_inner.height))
        .map(|(i, file)| {
            let (dir, base) = file.dir_and_base();
            let mut style = Style::default().fg(if file.fragmented() { Color::LightRed } else { Color::LightBlue });
            if i == app.list_cursor {
                style = style.add_modifier(Modifier::REVERSED);
            }
            Line::from(vec![
                Span::styled(format!("{:>4} ", file.extents.len()), style),
                Span::styled(base.to_string(), style.add_modifier(Modifier::BOLD)),
                Span::styled(format!(" {:.2} ", file.severity), Style::default().fg(Color::Gray)),
                Span::styled(dir.to_string(), Style::default().fg(Color::DarkGray)),
            ])
        })
        .collect();
    frame.render_widget(Paragraph::new(list_lines), list_inner);

    let help_lines = vec![
        Line::from("click/drag: inspect   ←/→: step cluster"),
        Line::from("↑/↓ Enter: highlight file   a: all"),
        Line::from("+/- or Ctrl+wheel: zoom   wheel/PgUp/PgDn"),
        Line::from("Esc: overview   s: rescan   q: quit"),
    ];
    frame.render_widget(
        Paragraph::new(help_lines).block(Block::default().title(" Controls ").borders(Borders::ALL)),
        left_rows[3],
    );

    let Some(viewport) = app.view.viewport() else {
        frame.render_widget(
            Paragraph::new("No map yet.").style(Style::default().fg(Color::Gray)),
            map_inner,
        );
        return;
    };

    let clusters = app.view.visible_slice();
    let highlight = app.view.highlight();
    let cell_size = u16::try_from(app.view.calculator().cell_size()).unwrap_or(u16::MAX);
    frame.render_widget(
        ClusterMapWidget {
            clusters: &clusters,
            viewport,
            cell_size,
            selection: app.view.selection_state(),
            highlight: &highlight,
            palette: &app.palette,
        },
        map_inner,
    );

    if viewport.scrollbar_visible {
        let mut state = ScrollbarState::new(viewport.max_top_row() as usize + 1)
            .viewport_content_length(viewport.rows_visible as usize)
            .position(viewport.top_row as usize);
        Scrollbar::new(ScrollbarOrientation::VerticalRight).render(map_inner, frame.buffer_mut(), &mut state);
    }
}

fn run_app(terminal: &mut Terminal<CrosstermBackend<io::Stdout>>, mut app: App) -> io::Result<()> {
    if app.source.is_some() {
        app.start_scan();
    }

    loop {
        app.poll_scan_updates();

        terminal.draw(|frame| {
            draw_ui(frame, &mut app);
        })?;

        if app.should_quit {
            break;
        }

        if event::poll(Duration::from_millis(50))? {
            match event::read()? {
                Event::Key(key) => app.on_key(key),
                Event::Mouse(mouse) => app.on_mouse(mouse),
                _ => {}
            }
        }
    }

    Ok(())
}

fn prepare(cli: Cli) -> fragmap::Result<App> {
    let config = FragmapConfig::try_from(cli)?;
    fragmap::logging::init(config.log_file.as_deref())?;
    if let ModelSource::Scan(path) = &config.source {
        info!(root = %path.display(), "starting");
    }
    App::new(config)
}

fn main() -> io::Result<()> {
    let app = match prepare(Cli::parse()) {
        Ok(app) => app,
        Err(err) => {
            eprintln!("fragmap: {}", err);
            std::process::exit(2);
        }
    };

    enable_raw_mode()?;
    crossterm::execute!(stdout(), EnterAlternateScreen, EnableMouseCapture)?;

    let backend = CrosstermBackend::new(stdout());
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let app_result = run_app(&mut terminal, app);

    disable_raw_mode()?;
    crossterm::execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    app_result
}
