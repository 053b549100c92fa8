use crate::metrics::{self, DetectionStats};
use crate::model::{Mode, Outcome, ResultItem, RunEvent, RunReport, RunStatus};
use ratatui::style::Color;

pub struct UiState {
    pub tab: usize,
    pub status: RunStatus,
    pub info: String,
    pub mode: Mode,
    pub base_url: String,
    pub input_names: Vec<String>,

    pub connection_id: Option<String>,
    pub is_connected: bool,

    pub progress_percent: u8,
    pub processed: u32,
    pub total: u32,
    pub results: Vec<ResultItem>,
    pub results_scroll: usize,
    pub error: Option<String>,

    /// Report of the last processed run, kept until the next run starts.
    pub last_report: Option<RunReport>,
    pub runs_finished: usize,
}

impl Default for UiState {
    fn default() -> Self {
        Self {
            tab: 0,
            status: RunStatus::Idle,
            info: String::new(),
            mode: Mode::Single,
            base_url: String::new(),
            input_names: Vec::new(),
            connection_id: None,
            is_connected: false,
            progress_percent: 0,
            processed: 0,
            total: 0,
            results: Vec::new(),
            results_scroll: 0,
            error: None,
            last_report: None,
            runs_finished: 0,
        }
    }
}

impl UiState {
    pub fn apply_event(&mut self, ev: RunEvent) {
        match ev {
            RunEvent::StatusChanged { status } => {
                if status == RunStatus::Connecting || status == RunStatus::Idle {
                    self.clear_run();
                }
                self.status = status;
                if status == RunStatus::Detecting {
                    self.is_connected = true;
                }
            }
            RunEvent::Progress {
                percent,
                processed,
                total,
            } => {
                self.progress_percent = percent;
                self.processed = processed;
                self.total = total;
            }
            RunEvent::ResultAppended { item } => self.results.push(item),
            RunEvent::Info(msg) => self.info = msg,
            RunEvent::Finished { state } => {
                self.status = state.run_status;
                self.connection_id = state.connection_id.clone();
                self.is_connected = state.is_connected;
                self.progress_percent = state.progress_percent;
                self.results = state.accumulated_results.clone();
                self.error = state.error.clone();
                self.runs_finished += 1;
                self.info = match &state.error {
                    Some(e) => format!("Run failed: {e}"),
                    None => format!("Run finished: {} result(s)", state.accumulated_results.len()),
                };
            }
            RunEvent::Processed { report } => self.last_report = report.map(|r| *r),
        }
    }

    fn clear_run(&mut self) {
        self.progress_percent = 0;
        self.processed = 0;
        self.total = 0;
        self.results.clear();
        self.results_scroll = 0;
        self.error = None;
        self.last_report = None;
    }

    pub fn stats(&self) -> DetectionStats {
        metrics::compute_stats(&self.results)
    }

    pub fn input_name(&self, item: &ResultItem) -> &str {
        item.input_index
            .and_then(|i| self.input_names.get(i))
            .map(String::as_str)
            .unwrap_or("-")
    }

    pub fn scroll_results(&mut self, down: bool, visible: usize) {
        let max = self.results.len().saturating_sub(visible.max(1));
        if down {
            self.results_scroll = (self.results_scroll + 1).min(max);
        } else {
            self.results_scroll = self.results_scroll.saturating_sub(1);
        }
    }
}

pub fn status_color(status: RunStatus) -> Color {
    match status {
        RunStatus::Idle => Color::Gray,
        RunStatus::Connecting => Color::Yellow,
        RunStatus::Detecting => Color::Cyan,
        RunStatus::Success => Color::Green,
        RunStatus::Error => Color::Red,
    }
}

pub fn outcome_color(outcome: Outcome) -> Color {
    match outcome {
        Outcome::Real => Color::Green,
        Outcome::Fake => Color::Red,
        Outcome::Error => Color::DarkGray,
    }
}
