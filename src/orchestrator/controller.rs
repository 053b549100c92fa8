//! Run lifecycle controller.
//!
//! Serializes start/reset/quit commands against the in-flight run and emits
//! events for presentation layers.

use super::coordinator::Coordinator;
use super::post_process::{process_run_completion, OutputTargets};
use crate::backend::Backend;
use crate::model::{InputAsset, Mode, RunEvent, RunReport, RunStatus};
use anyhow::Result;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Commands emitted by UI layers to control the detection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UiCommand {
    /// Start a run; a finished run is reset first.
    Start,
    /// Abandon the current run and return to idle.
    Reset,
    Quit,
}

/// Everything needed to (re)run the same job.
#[derive(Debug, Clone)]
pub(crate) struct RunRequest {
    pub base_url: String,
    pub mode: Mode,
    pub inputs: Vec<InputAsset>,
    pub targets: OutputTargets,
}

fn info(event_tx: &UnboundedSender<RunEvent>, msg: impl Into<String>) {
    let _ = event_tx.send(RunEvent::Info(msg.into()));
}

/// Orchestrate detection runs based on UI commands. Returns the report of the
/// last finished run, if any.
pub(crate) async fn run_controller<B: Backend>(
    mut coordinator: Coordinator<B>,
    request: RunRequest,
    start_on_launch: bool,
    event_tx: UnboundedSender<RunEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<Option<RunReport>> {
    let mut last_report = None;
    let mut start_pending = start_on_launch;

    loop {
        if std::mem::take(&mut start_pending) {
            if coordinator.state().run_status.is_terminal() {
                coordinator.reset();
            }
            // The run future borrows the coordinator; it must be dropped before
            // the coordinator can be reset.
            let interrupted = {
                let run = coordinator.start(&request.inputs, request.mode);
                tokio::pin!(run);
                loop {
                    tokio::select! {
                        res = &mut run => {
                            if let Err(e) = res {
                                info(&event_tx, format!("Cannot start: {e}"));
                            }
                            break None;
                        }
                        cmd = cmd_rx.recv() => match cmd {
                            Some(UiCommand::Start) => info(&event_tx, "A run is already in progress"),
                            Some(UiCommand::Reset) => break Some(UiCommand::Reset),
                            Some(UiCommand::Quit) | None => break Some(UiCommand::Quit),
                        }
                    }
                }
            };

            match interrupted {
                None => {
                    let state = coordinator.state();
                    let mut report = None;
                    if state.run_status.is_terminal() {
                        let processed = process_run_completion(
                            &request.targets,
                            &request.base_url,
                            request.mode,
                            &request.inputs,
                            state,
                        );
                        if let Some(p) = processed.auto_saved_path.as_ref() {
                            info(&event_tx, format!("Saved: {}", p.display()));
                        }
                        for msg in processed.export_messages {
                            info(&event_tx, msg);
                        }
                        report = Some(Box::new(processed.report.clone()));
                        last_report = Some(processed.report);
                    }
                    let _ = event_tx.send(RunEvent::Processed { report });
                }
                Some(UiCommand::Reset) => {
                    coordinator.reset();
                    info(&event_tx, "Run abandoned");
                }
                Some(_) => {
                    coordinator.reset();
                    break;
                }
            }
            continue;
        }

        match cmd_rx.recv().await {
            Some(UiCommand::Start) => start_pending = true,
            Some(UiCommand::Reset) => {
                if coordinator.state().run_status != RunStatus::Idle {
                    coordinator.reset();
                }
            }
            Some(UiCommand::Quit) | None => break,
        }
    }

    coordinator.shutdown().await;
    Ok(last_report)
}
