use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub submit_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub supported_formats: Vec<String>,
    pub max_file_size_mb: u64,
    pub user_agent: String,
}

impl RunConfig {
    /// WebSocket endpoint for the backend event stream.
    pub fn ws_url(&self) -> String {
        let base = self
            .base_url
            .trim_end_matches('/')
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/infer/ws?api_key={}", base, self.api_key)
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One RGB image per inference
    Single,
    /// Paired RGB + IR images per inference
    Fusion,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Single => "single",
            Mode::Fusion => "fusion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Rgb,
    Ir,
}

impl Modality {
    /// `ir_` prefixed names are infrared; everything else is treated as RGB.
    pub fn from_filename(name: &str) -> Self {
        match name.split_once('_') {
            Some((prefix, _)) if prefix.eq_ignore_ascii_case("ir") => Modality::Ir,
            _ => Modality::Rgb,
        }
    }
}

/// One user-supplied image. Never mutated after creation.
#[derive(Clone, PartialEq, Eq)]
pub struct InputAsset {
    pub id: String,
    pub name: String,
    pub format: String,
    pub modality: Modality,
    pub bytes: Vec<u8>,
}

impl InputAsset {
    pub fn new(id: impl Into<String>, name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        let format = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        Self {
            id: id.into(),
            modality: Modality::from_filename(&name),
            format,
            name,
            bytes,
        }
    }
}

impl std::fmt::Debug for InputAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputAsset")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("format", &self.format)
            .field("modality", &self.modality)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Real,
    Fake,
    Error,
}

impl Outcome {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "real" | "live" => Outcome::Real,
            "fake" | "spoof" => Outcome::Fake,
            _ => Outcome::Error,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Real => "real",
            Outcome::Fake => "fake",
            Outcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultItem {
    pub id: String,
    pub outcome: Outcome,
    /// Meaningless when `outcome` is `Error`.
    pub confidence: f64,
    /// Meaningless when `outcome` is `Error`.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probabilities: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunStatus {
    #[default]
    Idle,
    Connecting,
    Detecting,
    Success,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Error)
    }

    pub fn is_busy(self) -> bool {
        matches!(self, RunStatus::Connecting | RunStatus::Detecting)
    }
}

/// State of the current detection session. Owned by the coordinator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub connection_id: Option<String>,
    pub active_task_id: Option<String>,
    pub is_connected: bool,
    pub progress_percent: u8,
    pub accumulated_results: Vec<ResultItem>,
    pub run_status: RunStatus,
    pub error: Option<String>,
    pub total_items: Option<u32>,
}

/// Events emitted by the coordinator and consumed by UI/CLI layers.
#[derive(Debug, Clone)]
pub enum RunEvent {
    StatusChanged { status: RunStatus },
    Progress { percent: u8, processed: u32, total: u32 },
    ResultAppended { item: ResultItem },
    Info(String),
    Finished { state: Box<RunState> },
    /// The controller is done with a run: its `start` returned and the
    /// outcome was saved and exported. `None` when no report was produced.
    Processed { report: Option<Box<RunReport>> },
}

/// Result payload carried by a progress push event.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPayload {
    pub outcome: Outcome,
    pub confidence: f64,
    pub probabilities: Vec<f64>,
    pub elapsed_ms: u64,
    pub error_detail: Option<String>,
    pub input_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub task_id: String,
    pub processed: Option<u32>,
    pub total: Option<u32>,
    pub result: Option<ResultPayload>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedEvent {
    pub task_id: String,
    pub status: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedEvent {
    pub task_id: String,
    pub message: Option<String>,
}

/// Push events delivered by the backend event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Connected { connection_id: String },
    Disconnected,
    Progress(ProgressEvent),
    TaskCompleted(CompletedEvent),
    TaskFailed(FailedEvent),
}

/// Task status as recorded by the backend history service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    PartialFailure,
    Failed,
}

impl TaskStatus {
    pub fn label(self) -> &'static str {
        match self {
            TaskStatus::Completed => "completed",
            TaskStatus::PartialFailure => "partial failure",
            TaskStatus::Failed => "failed",
        }
    }
}

/// Persisted/exported record of one finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub timestamp_utc: String,
    pub base_url: String,
    pub mode: Mode,
    pub connection_id: Option<String>,
    pub status: RunStatus,
    pub task_status: TaskStatus,
    pub error: Option<String>,
    pub inputs: Vec<String>,
    pub results: Vec<ResultItem>,
    pub stats: crate::metrics::DetectionStats,
}
