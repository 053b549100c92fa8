//! Session-scoped connection to the backend event stream.

use crate::backend::Backend;
use crate::error::{DetectError, Result};
use crate::listeners::{SessionEvent, SessionSubscription};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPhase {
    Disconnected,
    /// A connect request is in flight; its result is shared by every caller.
    Pending,
    Connected(String),
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connection_id: Option<String>,
    pub is_connected: bool,
}

/// Resets a stranded `Pending` phase if the caller that issued the connect
/// request is dropped before the request resolves.
struct PendingGuard<'a> {
    phase: &'a watch::Sender<ConnectPhase>,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.phase.send_if_modified(|p| {
                if *p == ConnectPhase::Pending {
                    *p = ConnectPhase::Disconnected;
                    true
                } else {
                    false
                }
            });
        }
    }
}

pub struct ConnectionManager<B: Backend> {
    backend: Arc<B>,
    phase: Arc<watch::Sender<ConnectPhase>>,
    timeout: Duration,
    session: SessionSubscription,
}

impl<B: Backend> ConnectionManager<B> {
    /// Arms the session-scoped connected/disconnected listener.
    pub fn new(backend: Arc<B>, timeout: Duration) -> Self {
        let (tx, _) = watch::channel(ConnectPhase::Disconnected);
        let phase = Arc::new(tx);
        let phase2 = phase.clone();
        let session = backend
            .hub()
            .subscribe_session(Arc::new(move |ev: SessionEvent| match ev {
                SessionEvent::Connected { connection_id } => {
                    phase2.send_replace(ConnectPhase::Connected(connection_id));
                }
                SessionEvent::Disconnected => {
                    tracing::warn!("backend event stream disconnected");
                    phase2.send_replace(ConnectPhase::Disconnected);
                }
            }));
        Self {
            backend,
            phase,
            timeout,
            session,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        match &*self.phase.borrow() {
            ConnectPhase::Connected(id) => ConnectionStatus {
                connection_id: Some(id.clone()),
                is_connected: true,
            },
            _ => ConnectionStatus::default(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectPhase> {
        self.phase.subscribe()
    }

    /// Return the confirmed connection id, connecting first if needed.
    pub async fn ensure_connected(&self, api_key: &str) -> Result<String> {
        if let ConnectPhase::Connected(id) = &*self.phase.borrow() {
            return Ok(id.clone());
        }

        let mut rx = self.phase.subscribe();
        let mut issue = false;
        self.phase.send_if_modified(|p| match p {
            ConnectPhase::Disconnected | ConnectPhase::Failed(_) => {
                *p = ConnectPhase::Pending;
                issue = true;
                true
            }
            _ => false,
        });
        let mut guard = PendingGuard {
            phase: &self.phase,
            armed: issue,
        };

        let wait = async {
            if issue {
                tracing::info!("connecting to detection service");
                if let Err(e) = self.backend.connect(api_key).await {
                    self.phase.send_replace(ConnectPhase::Failed(e.to_string()));
                    return Err(e);
                }
            } else {
                tracing::debug!("joining in-flight connect request");
            }
            let phase = rx
                .wait_for(|p| *p != ConnectPhase::Pending)
                .await
                .map_err(|_| DetectError::Transport("connection manager dropped".into()))?
                .clone();
            match phase {
                ConnectPhase::Connected(id) => Ok(id),
                ConnectPhase::Failed(msg) => Err(DetectError::Transport(msg)),
                _ => Err(DetectError::Transport(
                    "event stream closed before the connection was confirmed".into(),
                )),
            }
        };

        let res = match tokio::time::timeout(self.timeout, wait).await {
            Ok(res) => res,
            Err(_) => {
                if issue {
                    self.backend.disconnect().await;
                    self.phase.send_replace(ConnectPhase::Failed(format!(
                        "connect timed out after {}",
                        humantime::format_duration(self.timeout)
                    )));
                }
                Err(DetectError::Timeout {
                    what: "connect",
                    after: self.timeout,
                })
            }
        };
        guard.armed = false;
        if let Ok(id) = &res {
            tracing::info!(connection_id = %id, "connection confirmed");
        }
        res
    }

    /// End the session: drop the event stream and the session listener.
    pub async fn close(&mut self) {
        self.backend.disconnect().await;
        self.session.cancel();
        self.phase.send_replace(ConnectPhase::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FusionModeRequest, SingleModeRequest, TaskAck};
    use crate::listeners::EventHub;
    use crate::model::BackendEvent;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Confirms the connection from a spawned task after a short delay.
    struct DelayedConfirm {
        hub: Arc<EventHub>,
        connects: AtomicUsize,
        confirm: bool,
    }

    #[async_trait]
    impl Backend for DelayedConfirm {
        fn hub(&self) -> Arc<EventHub> {
            self.hub.clone()
        }

        async fn connect(&self, _api_key: &str) -> Result<()> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
            if self.confirm {
                let hub = self.hub.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    hub.dispatch(BackendEvent::Connected {
                        connection_id: format!("client-{n}"),
                    });
                });
            }
            Ok(())
        }

        async fn disconnect(&self) {}

        async fn supported_formats(&self) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn submit_single(&self, _: &SingleModeRequest, _: &str, _: &str) -> Result<TaskAck> {
            unreachable!()
        }

        async fn submit_fusion(&self, _: &FusionModeRequest, _: &str, _: &str) -> Result<TaskAck> {
            unreachable!()
        }
    }

    fn backend(confirm: bool) -> Arc<DelayedConfirm> {
        Arc::new(DelayedConfirm {
            hub: EventHub::new(),
            connects: AtomicUsize::new(0),
            confirm,
        })
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_connect_request() {
        let b = backend(true);
        let mgr = ConnectionManager::new(b.clone(), Duration::from_secs(2));

        let (a, c) = tokio::join!(mgr.ensure_connected("k"), mgr.ensure_connected("k"));
        assert_eq!(a.unwrap(), "client-1");
        assert_eq!(c.unwrap(), "client-1");
        assert_eq!(b.connects.load(Ordering::SeqCst), 1);

        assert_eq!(mgr.ensure_connected("k").await.unwrap(), "client-1");
        assert_eq!(b.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            mgr.status(),
            ConnectionStatus {
                connection_id: Some("client-1".into()),
                is_connected: true
            }
        );
    }

    #[tokio::test]
    async fn unconfirmed_connect_times_out_and_can_retry() {
        let b = backend(false);
        let mgr = ConnectionManager::new(b.clone(), Duration::from_millis(50));

        let err = mgr.ensure_connected("k").await.unwrap_err();
        assert!(matches!(err, DetectError::Timeout { what: "connect", .. }));
        assert!(!mgr.status().is_connected);

        let _ = mgr.ensure_connected("k").await;
        assert_eq!(b.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disconnect_event_clears_cached_id() {
        let b = backend(true);
        let mgr = ConnectionManager::new(b.clone(), Duration::from_secs(2));
        mgr.ensure_connected("k").await.unwrap();

        b.hub.dispatch(BackendEvent::Disconnected);
        assert_eq!(mgr.status(), ConnectionStatus::default());

        assert_eq!(mgr.ensure_connected("k").await.unwrap(), "client-2");
    }
}
