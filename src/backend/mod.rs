//! Boundary to the remote detection service.
//!
//! Requests go out over HTTP; results come back as push events on a
//! WebSocket stream that is fanned out through the shared [`EventHub`].

mod http;
pub(crate) mod wire;

pub use http::HttpBackend;

use crate::error::Result;
use crate::listeners::EventHub;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Single-modality request body.
#[derive(Debug, Clone, Serialize)]
pub struct SingleModeRequest {
    pub mode: &'static str,
    pub modality: &'static str,
    /// Base64-encoded image bytes.
    pub images: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImagePair {
    pub rgb: String,
    pub ir: String,
}

/// Dual-modality request body.
#[derive(Debug, Clone, Serialize)]
pub struct FusionModeRequest {
    pub mode: &'static str,
    pub pairs: Vec<ImagePair>,
}

/// Submission acknowledgement. May arrive after the task has already finished.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskAck {
    pub task_id: String,
    #[serde(default)]
    pub message: String,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Hub that receives this backend's push events.
    fn hub(&self) -> Arc<EventHub>;

    /// Open the event stream. Returns once the request is acknowledged; the
    /// connection id arrives later as a `Connected` push event.
    async fn connect(&self, api_key: &str) -> Result<()>;

    async fn disconnect(&self);

    async fn supported_formats(&self) -> Result<Vec<String>>;

    async fn submit_single(
        &self,
        request: &SingleModeRequest,
        client_id: &str,
        api_key: &str,
    ) -> Result<TaskAck>;

    async fn submit_fusion(
        &self,
        request: &FusionModeRequest,
        client_id: &str,
        api_key: &str,
    ) -> Result<TaskAck>;
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryQuery {
    pub page: u32,
    pub page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<crate::model::TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTask {
    pub task_id: String,
    pub mode: String,
    pub status: crate::model::TaskStatus,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub total_items: u32,
    #[serde(default)]
    pub successful_items: u32,
    #[serde(default)]
    pub failed_items: u32,
    #[serde(default)]
    pub real_count: u32,
    #[serde(default)]
    pub fake_count: u32,
    #[serde(default)]
    pub elapsed_time_ms: u64,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub items: Vec<HistoryTask>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryStats {
    #[serde(default)]
    pub total_tasks: u64,
    #[serde(default)]
    pub total_inferences: u64,
    #[serde(default)]
    pub total_real: u64,
    #[serde(default)]
    pub total_fake: u64,
    #[serde(default)]
    pub total_errors: u64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub avg_processing_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    #[serde(default)]
    pub deleted: u64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activation {
    pub api_key: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}
