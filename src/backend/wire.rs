//! JSON frames on the backend event stream.

use crate::model::{
    BackendEvent, CompletedEvent, FailedEvent, Outcome, ProgressEvent, ResultPayload,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Connected {
        client_id: String,
    },
    #[serde(alias = "progress_update")]
    Progress {
        data: ProgressData,
    },
    TaskCompleted {
        data: CompletedData,
    },
    TaskFailed {
        data: FailedData,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct ProgressData {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    total_items: Option<u32>,
    #[serde(default)]
    completed_items: Option<u32>,
    #[serde(default)]
    processed_items: Option<u32>,
    #[serde(default)]
    current_result: Option<ResultData>,
    #[serde(default)]
    image_index: Option<usize>,
}

/// Every field may be absent or `null`.
#[derive(Debug, Deserialize)]
struct ResultData {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    probabilities: Option<Vec<f64>>,
    #[serde(default)]
    processing_time: Option<u64>,
    #[serde(default, alias = "index")]
    image_index: Option<usize>,
    #[serde(default, alias = "error_message")]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletedData {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FailedData {
    #[serde(default)]
    task_id: String,
    #[serde(default)]
    message: Option<String>,
}

impl ResultData {
    fn into_payload(self, fallback_index: Option<usize>) -> ResultPayload {
        let result = self.result.unwrap_or_default();
        let mut outcome = Outcome::parse(&result);
        if self.error.is_some() {
            outcome = Outcome::Error;
        }
        let error_detail = match outcome {
            Outcome::Error => Some(
                self.error
                    .unwrap_or_else(|| format!("unrecognized result '{result}'")),
            ),
            _ => None,
        };
        ResultPayload {
            outcome,
            confidence: self.confidence.unwrap_or_default().clamp(0.0, 1.0),
            probabilities: self.probabilities.unwrap_or_default(),
            elapsed_ms: self.processing_time.unwrap_or_default(),
            error_detail,
            input_index: self.image_index.or(fallback_index),
        }
    }
}

/// Decode one text frame. `Ok(None)` means a well-formed frame of a type we
/// do not act on.
pub fn parse_frame(text: &str) -> Result<Option<BackendEvent>, serde_json::Error> {
    let frame: Frame = serde_json::from_str(text)?;
    let event = match frame {
        Frame::Connected { client_id } => Some(BackendEvent::Connected {
            connection_id: client_id,
        }),
        Frame::Progress { data } => {
            let index = data.image_index;
            Some(BackendEvent::Progress(ProgressEvent {
                task_id: data.task_id,
                processed: data.completed_items.or(data.processed_items),
                total: data.total_items,
                result: data.current_result.map(|r| r.into_payload(index)),
                message: data.message,
            }))
        }
        Frame::TaskCompleted { data } => Some(BackendEvent::TaskCompleted(CompletedEvent {
            task_id: data.task_id,
            status: data.status,
            message: data.message,
        })),
        Frame::TaskFailed { data } => Some(BackendEvent::TaskFailed(FailedEvent {
            task_id: data.task_id,
            message: data.message,
        })),
        Frame::Unknown => None,
    };
    Ok(event)
}
