use super::{
    wire, Activation, Backend, DeleteResponse, FusionModeRequest, HistoryPage, HistoryQuery,
    HistoryStats, SingleModeRequest, TaskAck,
};
use crate::error::{DetectError, Result};
use crate::listeners::EventHub;
use crate::model::{BackendEvent, RunConfig};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// HTTP + WebSocket client for the detection service.
pub struct HttpBackend {
    cfg: RunConfig,
    http: reqwest::Client,
    hub: Arc<EventHub>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl HttpBackend {
    pub fn new(cfg: &RunConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(cfg.connect_timeout)
            .build()?;
        Ok(Self {
            cfg: cfg.clone(),
            http,
            hub: EventHub::new(),
            reader: Mutex::new(None),
        })
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            tracing::error!(%status, body = %text, "request rejected");
            return Err(DetectError::transport(format!(
                "server returned {status}: {text}"
            )));
        }
        serde_json::from_str(&text).map_err(|e| {
            DetectError::Transport(format!("failed to parse response: {e}, body: {text}"))
        })
    }

    async fn submit<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
        client_id: &str,
        api_key: &str,
    ) -> Result<TaskAck> {
        let url = self.cfg.endpoint(path);
        tracing::info!(%url, %client_id, "submitting detection job");
        let resp = self
            .http
            .post(&url)
            .header("X-Client-Id", client_id)
            .header("X-API-Key", api_key)
            .json(body)
            .send()
            .await?;
        let ack: TaskAck = Self::read_json(resp).await?;
        tracing::info!(task_id = %ack.task_id, "task created");
        Ok(ack)
    }

    pub async fn query_history(&self, query: &HistoryQuery, api_key: &str) -> Result<HistoryPage> {
        let resp = self
            .http
            .get(self.cfg.endpoint("history/query"))
            .header("X-API-Key", api_key)
            .query(query)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    pub async fn history_stats(
        &self,
        client_id: Option<&str>,
        days: Option<u32>,
        api_key: &str,
    ) -> Result<HistoryStats> {
        let mut req = self
            .http
            .get(self.cfg.endpoint("history/stats"))
            .header("X-API-Key", api_key);
        if let Some(id) = client_id {
            req = req.query(&[("client_id", id)]);
        }
        if let Some(days) = days {
            req = req.query(&[("days", days)]);
        }
        Self::read_json(req.send().await?).await
    }

    pub async fn delete_history(&self, task_ids: &[String], api_key: &str) -> Result<DeleteResponse> {
        let resp = self
            .http
            .post(self.cfg.endpoint("history/delete"))
            .header("X-API-Key", api_key)
            .json(&serde_json::json!({ "task_ids": task_ids }))
            .send()
            .await?;
        Self::read_json(resp).await
    }

    /// Exchange an activation code for an API key.
    pub async fn activate(&self, code: &str) -> Result<Activation> {
        if !code.starts_with("ACT-") || code.len() < 5 {
            return Err(DetectError::Validation(
                "activation code format is invalid (expected ACT-...)".into(),
            ));
        }
        let prefix: String = code.chars().take(8).collect();
        tracing::info!(code_prefix = %prefix, "activating license");
        let resp = self
            .http
            .post(self.cfg.endpoint("auth/activate"))
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await?;
        Self::read_json(resp).await
    }
}

/// Pump frames from the event stream into the hub until it closes.
async fn read_stream<S>(mut ws: S, hub: Arc<EventHub>, heartbeat: Duration)
where
    S: futures::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message>
        + Unpin,
{
    // The first frame must carry the connection id.
    match ws.next().await {
        Some(Ok(Message::Text(text))) => match wire::parse_frame(&text) {
            Ok(Some(BackendEvent::Connected { connection_id })) => {
                tracing::info!(%connection_id, "event stream connected");
                hub.dispatch(BackendEvent::Connected { connection_id });
            }
            other => {
                tracing::error!(?other, "expected connection confirmation as first frame");
                hub.dispatch(BackendEvent::Disconnected);
                return;
            }
        },
        Some(Ok(msg)) => {
            tracing::error!(?msg, "unexpected first frame on event stream");
            hub.dispatch(BackendEvent::Disconnected);
            return;
        }
        Some(Err(e)) => {
            tracing::error!(error = %e, "event stream read failed");
            hub.dispatch(BackendEvent::Disconnected);
            return;
        }
        None => {
            tracing::error!("event stream closed before confirmation");
            hub.dispatch(BackendEvent::Disconnected);
            return;
        }
    }

    let mut ticker = tokio::time::interval(heartbeat);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if ws.send(Message::Text("ping".into())).await.is_err() {
                    tracing::info!("heartbeat failed, closing event stream");
                    break;
                }
            }
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => match wire::parse_frame(&text) {
                    Ok(Some(ev)) => hub.dispatch(ev),
                    Ok(None) => tracing::debug!(frame = %text, "ignoring frame"),
                    Err(e) => tracing::warn!(error = %e, frame = %text, "undecodable frame"),
                },
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("event stream closed");
                    break;
                }
                Some(Err(e)) => {
                    tracing::error!(error = %e, "event stream error");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
    hub.dispatch(BackendEvent::Disconnected);
}

#[async_trait]
impl Backend for HttpBackend {
    fn hub(&self) -> Arc<EventHub> {
        self.hub.clone()
    }

    async fn connect(&self, api_key: &str) -> Result<()> {
        self.disconnect().await;

        let url = RunConfig {
            api_key: api_key.to_string(),
            ..self.cfg.clone()
        }
        .ws_url();
        let (ws, _) = connect_async(url.as_str()).await?;
        tracing::info!("event stream opened, waiting for connection id");

        let hub = self.hub.clone();
        let heartbeat = self.cfg.heartbeat_interval;
        let handle = tokio::spawn(read_stream(ws, hub, heartbeat));
        *self.reader.lock().await = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self.reader.lock().await.take() {
            tracing::info!("dropping previous event stream");
            handle.abort();
        }
    }

    async fn supported_formats(&self) -> Result<Vec<String>> {
        Ok(self.cfg.supported_formats.clone())
    }

    async fn submit_single(
        &self,
        request: &SingleModeRequest,
        client_id: &str,
        api_key: &str,
    ) -> Result<TaskAck> {
        tracing::debug!(images = request.images.len(), "single-modality request");
        self.submit("infer/single", request, client_id, api_key).await
    }

    async fn submit_fusion(
        &self,
        request: &FusionModeRequest,
        client_id: &str,
        api_key: &str,
    ) -> Result<TaskAck> {
        tracing::debug!(pairs = request.pairs.len(), "fusion request");
        self.submit("infer/fusion", request, client_id, api_key).await
    }
}
