//! On-disk persistence: saved run reports, exports and the activated license.

use crate::model::{RunReport, TaskStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "liveness-cli";

/// API key obtained through `activate`, used when none is configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct License {
    pub api_key: String,
    pub activated_at: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

fn runs_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine data directory")?;
    Ok(base.join(APP_DIR).join("runs"))
}

fn license_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("could not determine config directory")?;
    Ok(base.join(APP_DIR).join("license.json"))
}

/// Directory for the TUI log file.
pub fn log_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("could not determine data directory")?;
    Ok(base.join(APP_DIR).join("logs"))
}

fn file_stem(report: &RunReport) -> String {
    format!(
        "run-{}",
        report
            .timestamp_utc
            .replace(':', "-")
            .replace('T', "_")
            .trim_end_matches('Z')
    )
}

/// Save a report to the default auto-save location.
pub fn save_run(report: &RunReport) -> Result<PathBuf> {
    save_run_in(&runs_dir()?, report)
}

pub fn save_run_in(dir: &Path, report: &RunReport) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut path = dir.join(format!("{}.json", file_stem(report)));
    let mut n = 1;
    while path.exists() {
        path = dir.join(format!("{}-{n}.json", file_stem(report)));
        n += 1;
    }
    export_json(&path, report)?;
    tracing::info!(path = %path.display(), "run saved");
    Ok(path)
}

/// Default export file name for a report, e.g. `liveness-2026-01-01_10-00-00.csv`.
pub fn default_export_name(report: &RunReport, ext: &str) -> String {
    format!(
        "liveness-{}.{ext}",
        report
            .timestamp_utc
            .replace(':', "-")
            .replace('T', "_")
            .trim_end_matches('Z')
    )
}

pub fn export_json(path: &Path, report: &RunReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

fn csv_field(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// One row per result item.
pub fn export_csv(path: &Path, report: &RunReport) -> Result<()> {
    let mut out = String::from("index,input,outcome,confidence,elapsed_ms,error,task_status\n");
    let status = match report.task_status {
        TaskStatus::Completed => "completed",
        TaskStatus::PartialFailure => "partial_failure",
        TaskStatus::Failed => "failed",
    };
    for (i, r) in report.results.iter().enumerate() {
        let input = r
            .input_index
            .and_then(|idx| report.inputs.get(idx))
            .map(String::as_str)
            .unwrap_or("");
        out.push_str(&format!(
            "{},{},{},{:.4},{},{},{}\n",
            i,
            csv_field(input),
            r.outcome.as_str(),
            r.confidence,
            r.elapsed_ms,
            csv_field(r.error_detail.as_deref().unwrap_or("")),
            status
        ));
    }
    std::fs::write(path, out).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn load_license() -> Result<Option<License>> {
    load_license_from(&license_path()?)
}

pub fn load_license_from(path: &Path) -> Result<Option<License>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let license = serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(license))
}

pub fn save_license(license: &License) -> Result<PathBuf> {
    let path = license_path()?;
    save_license_to(&path, license)?;
    Ok(path)
}

pub fn save_license_to(path: &Path, license: &License) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(license)?;
    std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::compute_stats;
    use crate::model::{Mode, Outcome, ResultItem, RunStatus};

    fn report() -> RunReport {
        let results = vec![
            ResultItem {
                id: "t-0".into(),
                outcome: Outcome::Fake,
                confidence: 0.8,
                elapsed_ms: 33,
                probabilities: vec![0.8, 0.2],
                error_detail: None,
                input_index: Some(0),
            },
            ResultItem {
                id: "t-1".into(),
                outcome: Outcome::Error,
                confidence: 0.0,
                elapsed_ms: 0,
                probabilities: vec![],
                error_detail: Some("bad, \"blurry\" image".into()),
                input_index: Some(1),
            },
        ];
        RunReport {
            timestamp_utc: "2026-03-04T05:06:07Z".into(),
            base_url: "http://localhost:8000".into(),
            mode: Mode::Single,
            connection_id: Some("c1".into()),
            status: RunStatus::Success,
            task_status: TaskStatus::PartialFailure,
            error: None,
            inputs: vec!["a.jpg".into(), "b,c.jpg".into()],
            stats: compute_stats(&results),
            results,
        }
    }

    #[test]
    fn saved_runs_do_not_overwrite_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let a = save_run_in(dir.path(), &report()).unwrap();
        let b = save_run_in(dir.path(), &report()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.file_name().unwrap(), "run-2026-03-04_05-06-07.json");

        let text = std::fs::read_to_string(&a).unwrap();
        let back: RunReport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.results, report().results);
    }

    #[test]
    fn csv_escapes_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        export_csv(&path, &report()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "0,a.jpg,fake,0.8000,33,,partial_failure");
        assert_eq!(
            lines[2],
            "1,\"b,c.jpg\",error,0.0000,0,\"bad, \"\"blurry\"\" image\",partial_failure"
        );
    }

    #[test]
    fn license_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("license.json");
        assert_eq!(load_license_from(&path).unwrap(), None);

        let license = License {
            api_key: "sk-123".into(),
            activated_at: "2026-01-01T00:00:00Z".into(),
            expires_at: None,
        };
        save_license_to(&path, &license).unwrap();
        assert_eq!(load_license_from(&path).unwrap(), Some(license));
    }

    #[test]
    fn export_name_uses_timestamp() {
        assert_eq!(
            default_export_name(&report(), "csv"),
            "liveness-2026-03-04_05-06-07.csv"
        );
    }
}
