//! Post-run processing utilities.
//!
//! Turns a terminal run state into a report, then handles auto-save and exports.

use crate::metrics;
use crate::model::{InputAsset, Mode, RunReport, RunState};
use crate::storage;
use std::path::{Path, PathBuf};

/// Where a finished run should be written.
#[derive(Debug, Clone, Default)]
pub(crate) struct OutputTargets {
    pub auto_save: bool,
    pub export_json: Option<PathBuf>,
    pub export_csv: Option<PathBuf>,
}

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub report: RunReport,
    pub export_messages: Vec<String>,
    pub auto_saved_path: Option<PathBuf>,
}

/// Build the persisted record of a finished run.
pub(crate) fn build_report(
    base_url: &str,
    mode: Mode,
    inputs: &[InputAsset],
    state: &RunState,
) -> RunReport {
    let expected = state.total_items.map(|t| t as usize).unwrap_or(inputs.len());
    RunReport {
        timestamp_utc: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "now".into()),
        base_url: base_url.to_string(),
        mode,
        connection_id: state.connection_id.clone(),
        status: state.run_status,
        task_status: metrics::task_status(&state.accumulated_results, expected, state.run_status),
        error: state.error.clone(),
        inputs: inputs.iter().map(|a| a.name.clone()).collect(),
        results: state.accumulated_results.clone(),
        stats: metrics::compute_stats(&state.accumulated_results),
    }
}

fn export_to(path: &Path, report: &RunReport, csv: bool) -> String {
    let (label, res) = if csv {
        ("CSV", storage::export_csv(path, report))
    } else {
        ("JSON", storage::export_json(path, report))
    };
    match res {
        Ok(()) => format!("Exported {label}: {}", path.display()),
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "export failed");
            format!("Export {label} failed: {e:#}")
        }
    }
}

/// Process a finished run: build the report, auto-save, export.
pub(crate) fn process_run_completion(
    targets: &OutputTargets,
    base_url: &str,
    mode: Mode,
    inputs: &[InputAsset],
    state: &RunState,
) -> ProcessedRun {
    let report = build_report(base_url, mode, inputs, state);

    let auto_saved_path = if targets.auto_save {
        match storage::save_run(&report) {
            Ok(p) => Some(p),
            Err(e) => {
                tracing::warn!(error = %e, "auto-save failed");
                None
            }
        }
    } else {
        None
    };

    let mut export_messages = Vec::new();
    if let Some(p) = targets.export_json.as_deref() {
        export_messages.push(export_to(p, &report, false));
    }
    if let Some(p) = targets.export_csv.as_deref() {
        export_messages.push(export_to(p, &report, true));
    }

    ProcessedRun {
        report,
        export_messages,
        auto_saved_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Outcome, ResultItem, RunStatus, TaskStatus};

    fn state(outcomes: &[Outcome], status: RunStatus) -> RunState {
        RunState {
            connection_id: Some("c1".into()),
            is_connected: true,
            run_status: status,
            progress_percent: 100,
            total_items: Some(outcomes.len() as u32),
            accumulated_results: outcomes
                .iter()
                .enumerate()
                .map(|(i, &outcome)| ResultItem {
                    id: format!("t-{i}"),
                    outcome,
                    confidence: 0.9,
                    elapsed_ms: 10,
                    probabilities: vec![],
                    error_detail: None,
                    input_index: Some(i),
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn report_carries_inputs_and_status() {
        let inputs = vec![
            InputAsset::new("1", "a.jpg", vec![]),
            InputAsset::new("2", "b.jpg", vec![]),
        ];
        let st = state(&[Outcome::Real, Outcome::Error], RunStatus::Success);
        let report = build_report("http://localhost:8000", Mode::Single, &inputs, &st);
        assert_eq!(report.inputs, vec!["a.jpg", "b.jpg"]);
        assert_eq!(report.task_status, TaskStatus::PartialFailure);
        assert_eq!(report.stats.error_count, 1);
        assert_eq!(report.connection_id.as_deref(), Some("c1"));
    }

    #[test]
    fn exports_are_written_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let targets = OutputTargets {
            auto_save: false,
            export_json: Some(dir.path().join("r.json")),
            export_csv: Some(dir.path().join("missing").join("r.csv")),
        };
        let inputs = vec![InputAsset::new("1", "a.jpg", vec![])];
        let st = state(&[Outcome::Fake], RunStatus::Success);
        let processed =
            process_run_completion(&targets, "http://localhost:8000", Mode::Single, &inputs, &st);

        assert!(processed.auto_saved_path.is_none());
        assert_eq!(processed.report.task_status, TaskStatus::Completed);
        assert!(processed.export_messages[0].starts_with("Exported JSON"));
        assert!(processed.export_messages[1].starts_with("Export CSV failed"));
        assert!(dir.path().join("r.json").exists());
    }
}
