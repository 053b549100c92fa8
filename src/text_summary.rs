//! Text summary builder for CLI output.
//!
//! This module computes metrics and formats human-readable lines for text mode.

use crate::metrics;
use crate::model::{Outcome, RunReport};

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

fn outcome_label(o: Outcome) -> &'static str {
    match o {
        Outcome::Real => "REAL",
        Outcome::Fake => "FAKE",
        Outcome::Error => "ERROR",
    }
}

/// Build a text summary from a finished run.
pub(crate) fn build_text_summary(report: &RunReport) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!(
        "Run: {} ({} mode) {:?} / {}",
        report.timestamp_utc,
        report.mode.as_str(),
        report.status,
        report.task_status.label()
    ));
    if let Some(id) = report.connection_id.as_deref() {
        lines.push(format!("Connection: {id}"));
    }
    if let Some(err) = report.error.as_deref() {
        lines.push(format!("Error: {err}"));
    }

    for (i, r) in report.results.iter().enumerate() {
        let input = r
            .input_index
            .and_then(|idx| report.inputs.get(idx))
            .map(String::as_str)
            .unwrap_or("-");
        match r.outcome {
            Outcome::Error => lines.push(format!(
                "#{:<3} {:<5} {} ({})",
                i + 1,
                outcome_label(r.outcome),
                input,
                r.error_detail.as_deref().unwrap_or("unknown error")
            )),
            o => lines.push(format!(
                "#{:<3} {:<5} {} confidence {:.1}% in {} ms",
                i + 1,
                outcome_label(o),
                input,
                r.confidence * 100.0,
                r.elapsed_ms
            )),
        }
    }

    let s = &report.stats;
    lines.push(format!(
        "Results: {} total, {} real ({}%), {} fake ({}%), {} errors ({}%)",
        s.total_count,
        s.real_count,
        s.real_percentage,
        s.fake_count,
        s.fake_percentage,
        s.error_count,
        s.error_percentage
    ));
    if s.total_count > s.error_count {
        lines.push(format!("Average confidence: {:.1}%", s.average_confidence * 100.0));
    }
    if let Some((p50, p90, max)) = metrics::compute_elapsed_percentiles(&report.results) {
        lines.push(format!("Processing time: p50 {p50} ms, p90 {p90} ms, max {max} ms"));
    }

    TextSummary { lines }
}
