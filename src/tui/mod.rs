mod export;
mod help;
mod state;

use crate::backend::HttpBackend;
use crate::cli::{self, Cli};
use crate::model::{Outcome, RunEvent, RunStatus};
use crate::orchestrator::{self, Coordinator, RunRequest, UiCommand};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use help::draw_help;
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Gauge, Paragraph, Row, Table, Tabs},
    Terminal,
};
use state::{outcome_color, status_color, UiState};
use std::sync::Arc;
use std::{io, time::Duration, time::Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub async fn run(args: Cli) -> Result<()> {
    let cfg = cli::build_config(&args, cli::resolve_api_key(&args)?);
    let inputs = cli::load_inputs(&args.images)?;
    let input_names = inputs.iter().map(|a| a.name.clone()).collect();
    let backend = Arc::new(HttpBackend::new(&cfg).context("build HTTP client")?);

    let (event_tx, event_rx) = mpsc::unbounded_channel::<RunEvent>();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();

    let coordinator = Coordinator::new(backend, &cfg).with_events(event_tx.clone());
    let request = RunRequest {
        base_url: cfg.base_url.clone(),
        mode: args.mode,
        inputs,
        targets: cli::output_targets(&args),
    };

    // TUI runs in a dedicated thread to keep all blocking I/O out of the Tokio runtime.
    let ui_state = UiState {
        mode: args.mode,
        base_url: cfg.base_url.clone(),
        input_names,
        info: if args.start_on_launch {
            "Starting...".into()
        } else {
            "Press r to start".into()
        },
        ..Default::default()
    };
    let ui_handle = std::thread::spawn(move || run_threaded(ui_state, event_rx, cmd_tx));

    let res = orchestrator::run_controller(
        coordinator,
        request,
        args.start_on_launch,
        event_tx,
        cmd_rx,
    )
    .await;

    let join_res = tokio::task::spawn_blocking(move || ui_handle.join()).await;
    if let Ok(joined) = join_res {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(anyhow::anyhow!("TUI thread panicked")),
        }
    }

    res.map(|_| ())
}

/// Run the TUI loop on a dedicated thread.
fn run_threaded(
    mut state: UiState,
    mut event_rx: UnboundedReceiver<RunEvent>,
    cmd_tx: UnboundedSender<UiCommand>,
) -> Result<()> {
    enable_raw_mode().context("enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).ok();

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("create terminal")?;
    terminal.clear().ok();

    let tick_rate = Duration::from_millis(100);
    let mut last_tick = Instant::now();
    let mut visible_rows = 10usize;

    let res = loop {
        while let Ok(ev) = event_rx.try_recv() {
            state.apply_event(ev);
        }

        if last_tick.elapsed() >= tick_rate {
            terminal
                .draw(|f| {
                    visible_rows = results_capacity(f.area());
                    draw(f.area(), f, &state)
                })
                .ok();
            last_tick = Instant::now();
        }

        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(Event::Key(k)) = event::read() {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                match (k.modifiers, k.code) {
                    (_, KeyCode::Char('q')) | (KeyModifiers::CONTROL, KeyCode::Char('c')) => {
                        let _ = cmd_tx.send(UiCommand::Quit);
                        break Ok(());
                    }
                    (_, KeyCode::Char('r')) => {
                        if state.status.is_busy() {
                            state.info = "A run is already in progress".into();
                        } else {
                            state.info = "Starting...".into();
                            let _ = cmd_tx.send(UiCommand::Start);
                        }
                    }
                    (_, KeyCode::Char('x')) => {
                        let _ = cmd_tx.send(UiCommand::Reset);
                    }
                    (_, KeyCode::Char('s')) => export::save_and_show_path(&mut state),
                    (_, KeyCode::Char('c')) => export::export_csv_here(&mut state),
                    (_, KeyCode::Char('y')) => export::copy_summary(&mut state),
                    (_, KeyCode::Down) | (_, KeyCode::Char('j')) => {
                        state.scroll_results(true, visible_rows)
                    }
                    (_, KeyCode::Up) | (_, KeyCode::Char('k')) => {
                        state.scroll_results(false, visible_rows)
                    }
                    (_, KeyCode::Tab) => state.tab = (state.tab + 1) % 2,
                    (_, KeyCode::Char('?')) => state.tab = 1,
                    _ => {}
                }
            }
        }
    };

    disable_raw_mode().ok();
    let mut stdout = io::stdout();
    execute!(stdout, LeaveAlternateScreen).ok();
    res
}

/// Rows the results table can show for a terminal of this size.
fn results_capacity(area: Rect) -> usize {
    // tabs + header + gauge + info, plus table borders and header row
    (area.height as usize).saturating_sub(3 + 3 + 3 + 3 + 3)
}

fn draw(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)].as_ref())
        .split(area);

    let tabs = Tabs::new(vec![Line::from("Dashboard"), Line::from("Help")])
        .select(state.tab)
        .block(Block::default().borders(Borders::ALL).title("liveness-cli"))
        .highlight_style(Style::default().fg(Color::Yellow));
    f.render_widget(tabs, chunks[0]);

    match state.tab {
        0 => draw_dashboard(chunks[1], f, state),
        _ => draw_help(chunks[1], f),
    }
}

fn draw_dashboard(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let main = Layout::default()
        .direction(Direction::Vertical)
        .constraints(
            [
                Constraint::Length(3),
                Constraint::Length(3),
                Constraint::Min(0),
                Constraint::Length(3),
            ]
            .as_ref(),
        )
        .split(area);

    draw_header(main[0], f, state);
    draw_progress(main[1], f, state);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(40), Constraint::Length(34)].as_ref())
        .split(main[2]);
    draw_results(body[0], f, state);
    draw_stats(body[1], f, state);

    let info = Paragraph::new(state.info.as_str())
        .block(Block::default().borders(Borders::ALL).title("Info"));
    f.render_widget(info, main[3]);
}

fn draw_header(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let (conn_label, conn_color) = if state.is_connected {
        (
            format!("connected ({})", state.connection_id.as_deref().unwrap_or("?")),
            Color::Green,
        )
    } else {
        ("disconnected".to_string(), Color::DarkGray)
    };
    let line = Line::from(vec![
        Span::raw("Status: "),
        Span::styled(
            format!("{:?}", state.status),
            Style::default()
                .fg(status_color(state.status))
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw("   Mode: "),
        Span::styled(state.mode.as_str(), Style::default().fg(Color::Cyan)),
        Span::raw(format!("   Inputs: {}", state.input_names.len())),
        Span::raw("   Server: "),
        Span::styled(conn_label, Style::default().fg(conn_color)),
    ]);
    let p = Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .title(state.base_url.as_str()),
    );
    f.render_widget(p, area);
}

fn draw_progress(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let label = if state.total > 0 {
        format!(
            "{}% ({}/{})",
            state.progress_percent, state.processed, state.total
        )
    } else {
        format!("{}%", state.progress_percent)
    };
    let color = match state.status {
        RunStatus::Error => Color::Red,
        RunStatus::Success => Color::Green,
        _ => Color::Cyan,
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Progress"))
        .gauge_style(Style::default().fg(color))
        .percent(u16::from(state.progress_percent.min(100)))
        .label(label);
    f.render_widget(gauge, area);
}

fn draw_results(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let header = Row::new(vec!["#", "Input", "Outcome", "Confidence", "Time"])
        .style(Style::default().add_modifier(Modifier::BOLD));

    let rows: Vec<Row> = state
        .results
        .iter()
        .enumerate()
        .skip(state.results_scroll)
        .map(|(i, r)| {
            let (confidence, elapsed) = if r.outcome == Outcome::Error {
                (
                    r.error_detail.clone().unwrap_or_else(|| "-".into()),
                    "-".to_string(),
                )
            } else {
                (
                    format!("{:.1}%", r.confidence * 100.0),
                    format!("{} ms", r.elapsed_ms),
                )
            };
            Row::new(vec![
                Cell::from((i + 1).to_string()),
                Cell::from(state.input_name(r).to_string()),
                Cell::from(r.outcome.as_str().to_uppercase())
                    .style(Style::default().fg(outcome_color(r.outcome))),
                Cell::from(confidence),
                Cell::from(elapsed),
            ])
        })
        .collect();

    let title = if state.results.is_empty() {
        "Results".to_string()
    } else {
        format!("Results ({})", state.results.len())
    };
    let table = Table::new(
        rows,
        [
            Constraint::Length(4),
            Constraint::Min(16),
            Constraint::Length(8),
            Constraint::Min(11),
            Constraint::Length(9),
        ],
    )
    .header(header)
    .block(Block::default().borders(Borders::ALL).title(title));
    f.render_widget(table, area);
}

fn draw_stats(area: Rect, f: &mut ratatui::Frame, state: &UiState) {
    let stats = state.stats();
    let mut lines = vec![
        Line::from(vec![
            Span::styled("Real   ", Style::default().fg(Color::Green)),
            Span::raw(format!("{} ({}%)", stats.real_count, stats.real_percentage)),
        ]),
        Line::from(vec![
            Span::styled("Fake   ", Style::default().fg(Color::Red)),
            Span::raw(format!("{} ({}%)", stats.fake_count, stats.fake_percentage)),
        ]),
        Line::from(vec![
            Span::styled("Errors ", Style::default().fg(Color::DarkGray)),
            Span::raw(format!("{} ({}%)", stats.error_count, stats.error_percentage)),
        ]),
        Line::from(format!("Total  {}", stats.total_count)),
        Line::from(""),
        Line::from(format!(
            "Avg confidence {:.1}%",
            stats.average_confidence * 100.0
        )),
    ];
    if let Some((p50, p90, max)) = crate::metrics::compute_elapsed_percentiles(&state.results) {
        lines.push(Line::from(format!("Time p50 {p50} ms")));
        lines.push(Line::from(format!("     p90 {p90} ms  max {max} ms")));
    }
    if let Some(err) = state.error.as_deref() {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            err.to_string(),
            Style::default().fg(Color::Red),
        )));
    }
    if state.runs_finished > 0 {
        lines.push(Line::from(""));
        lines.push(Line::from(format!("Runs this session: {}", state.runs_finished)));
    }

    let p = Paragraph::new(lines)
        .wrap(ratatui::widgets::Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title("Stats"));
    f.render_widget(p, area);
}
