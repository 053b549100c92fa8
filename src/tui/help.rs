use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

const KEYBINDS: &[(&str, &str)] = &[
    ("q / Ctrl-C", "Quit"),
    ("r", "Rerun the same images"),
    ("x", "Reset (abandon the current run)"),
    ("s", "Save JSON of the last run"),
    ("c", "Export CSV of the last run"),
    ("y", "Copy text summary to clipboard"),
    ("↑/↓ or j/k", "Scroll results"),
    ("tab", "Switch tabs"),
    ("?", "Show this help"),
];

fn key_line(key: &str, what: &str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(format!("{key:<12}"), Style::default().fg(Color::Magenta)),
        Span::raw(what.to_string()),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let mut lines = vec![Line::from("Keybinds:")];
    lines.extend(KEYBINDS.iter().map(|(k, w)| key_line(k, w)));
    lines.push(Line::from(""));
    lines.push(Line::from("Results:"));
    lines.push(Line::from(vec![
        Span::raw("  "),
        Span::styled("REAL", Style::default().fg(Color::Green)),
        Span::raw(" live face   "),
        Span::styled("FAKE", Style::default().fg(Color::Red)),
        Span::raw(" spoof   "),
        Span::styled("ERROR", Style::default().fg(Color::DarkGray)),
        Span::raw(" item could not be classified"),
    ]));
    lines.push(Line::from(""));
    lines.push(Line::from(
        "Runs are saved under the data directory when auto-save is on.",
    ));

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
