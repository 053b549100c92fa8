//! Validation, packaging and submission of one detection job.

use crate::backend::{Backend, FusionModeRequest, ImagePair, SingleModeRequest, TaskAck};
use crate::error::{DetectError, Result};
use crate::model::{InputAsset, Mode};
use crate::pairing::resolve_pairs;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// A packaged request, ready to send.
#[derive(Debug, Clone)]
pub enum Job {
    Single(SingleModeRequest),
    Fusion(FusionModeRequest),
}

impl Job {
    /// Number of result items the backend is expected to produce.
    pub fn len(&self) -> usize {
        match self {
            Job::Single(r) => r.images.len(),
            Job::Fusion(r) => r.pairs.len(),
        }
    }
}

/// Every input whose extension is not advertised by the backend.
pub fn validate_formats(inputs: &[InputAsset], supported: &[String]) -> Result<()> {
    let bad: Vec<String> = inputs
        .iter()
        .filter(|a| !supported.iter().any(|f| f.eq_ignore_ascii_case(&a.format)))
        .map(|a| {
            if a.format.is_empty() {
                format!("{} (no extension)", a.name)
            } else {
                format!("{} (.{})", a.name, a.format)
            }
        })
        .collect();
    if bad.is_empty() {
        return Ok(());
    }
    Err(DetectError::Validation(format!(
        "unsupported image format: {}; supported formats are {}",
        bad.join(", "),
        supported.join(", ")
    )))
}

pub fn validate_sizes(inputs: &[InputAsset], max_file_size_mb: u64) -> Result<()> {
    let limit = max_file_size_mb.saturating_mul(1024 * 1024);
    let bad: Vec<String> = inputs
        .iter()
        .filter(|a| a.bytes.len() as u64 > limit)
        .map(|a| format!("{} ({:.1} MB)", a.name, a.bytes.len() as f64 / (1024.0 * 1024.0)))
        .collect();
    if bad.is_empty() {
        return Ok(());
    }
    Err(DetectError::Validation(format!(
        "files exceed the {max_file_size_mb} MB limit: {}",
        bad.join(", ")
    )))
}

fn encode(asset: &InputAsset) -> String {
    base64::engine::general_purpose::STANDARD.encode(&asset.bytes)
}

pub struct JobSubmitter<B: Backend> {
    backend: Arc<B>,
    formats: OnceCell<Vec<String>>,
    max_file_size_mb: u64,
    submit_timeout: Duration,
}

impl<B: Backend> JobSubmitter<B> {
    pub fn new(backend: Arc<B>, max_file_size_mb: u64, submit_timeout: Duration) -> Self {
        Self {
            backend,
            formats: OnceCell::new(),
            max_file_size_mb,
            submit_timeout,
        }
    }

    /// Supported formats, fetched once per session.
    pub async fn supported_formats(&self) -> Result<&[String]> {
        let formats = self
            .formats
            .get_or_try_init(|| async {
                let list = self.backend.supported_formats().await?;
                tracing::debug!(formats = ?list, "supported formats loaded");
                Ok::<_, DetectError>(list)
            })
            .await?;
        Ok(formats.as_slice())
    }

    /// Validate `inputs` and build the request. No network call is made for
    /// the job itself; a failure here means nothing was submitted.
    pub async fn prepare(&self, inputs: &[InputAsset], mode: Mode) -> Result<Job> {
        if inputs.is_empty() {
            return Err(DetectError::Validation("no images selected".into()));
        }
        let supported = self.supported_formats().await?;

        let mut problems = Vec::new();
        if let Err(e) = validate_formats(inputs, supported) {
            problems.push(e.to_string());
        }
        if let Err(e) = validate_sizes(inputs, self.max_file_size_mb) {
            problems.push(e.to_string());
        }
        if !problems.is_empty() {
            return Err(DetectError::Validation(problems.join("; ")));
        }

        let job = match mode {
            Mode::Single => Job::Single(SingleModeRequest {
                mode: "single",
                modality: "rgb",
                images: inputs.iter().map(encode).collect(),
            }),
            Mode::Fusion => {
                let report = resolve_pairs(inputs);
                for dup in &report.duplicates {
                    tracing::warn!(name = %dup.name, "duplicate pairing key, later file wins");
                }
                if let Some(msg) = report.problems() {
                    return Err(DetectError::Validation(msg));
                }
                Job::Fusion(FusionModeRequest {
                    mode: "fusion",
                    pairs: report
                        .pairs
                        .iter()
                        .map(|(rgb, ir)| ImagePair {
                            rgb: encode(rgb),
                            ir: encode(ir),
                        })
                        .collect(),
                })
            }
        };
        tracing::info!(mode = mode.as_str(), items = job.len(), "job packaged");
        Ok(job)
    }

    pub fn submit_timeout(&self) -> Duration {
        self.submit_timeout
    }
}

/// Send `job`, bounded by `timeout`.
pub async fn submit_job<B: Backend>(
    backend: &B,
    job: &Job,
    client_id: &str,
    api_key: &str,
    timeout: Duration,
) -> Result<TaskAck> {
    let call = async {
        match job {
            Job::Single(req) => backend.submit_single(req, client_id, api_key).await,
            Job::Fusion(req) => backend.submit_fusion(req, client_id, api_key).await,
        }
    };
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| DetectError::Timeout {
            what: "submit",
            after: timeout,
        })?
}
