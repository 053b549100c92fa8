use crate::model::{Outcome, ResultItem, RunStatus, TaskStatus};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Aggregate counts over one run's results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectionStats {
    pub real_count: usize,
    pub fake_count: usize,
    pub error_count: usize,
    pub total_count: usize,
    /// Mean confidence over non-error items.
    pub average_confidence: f64,
    pub real_percentage: u32,
    pub fake_percentage: u32,
    pub error_percentage: u32,
}

fn percent(part: usize, total: usize) -> u32 {
    if total == 0 {
        return 0;
    }
    (part as f64 / total as f64 * 100.0).round() as u32
}

/// Compute outcome counts and percentages from accumulated results
pub fn compute_stats(results: &[ResultItem]) -> DetectionStats {
    let total = results.len();
    let count = |o: Outcome| results.iter().filter(|r| r.outcome == o).count();
    let (real, fake, errors) = (count(Outcome::Real), count(Outcome::Fake), count(Outcome::Error));

    let scored: Vec<f64> = results
        .iter()
        .filter(|r| r.outcome != Outcome::Error)
        .map(|r| r.confidence)
        .collect();
    let average_confidence = if scored.is_empty() {
        0.0
    } else {
        scored.iter().sum::<f64>() / scored.len() as f64
    };

    DetectionStats {
        real_count: real,
        fake_count: fake,
        error_count: errors,
        total_count: total,
        average_confidence,
        real_percentage: percent(real, total),
        fake_percentage: percent(fake, total),
        error_percentage: percent(errors, total),
    }
}

/// Processing time percentiles (p50, p90, max) in ms over non-error items
pub fn compute_elapsed_percentiles(results: &[ResultItem]) -> Option<(u64, u64, u64)> {
    let mut hist = Histogram::<u64>::new(3).ok()?;
    for r in results.iter().filter(|r| r.outcome != Outcome::Error) {
        hist.record(r.elapsed_ms).ok()?;
    }
    if hist.is_empty() {
        return None;
    }
    Some((
        hist.value_at_quantile(0.5),
        hist.value_at_quantile(0.9),
        hist.max(),
    ))
}

/// Classify a finished run the way the history service records it.
pub fn task_status(results: &[ResultItem], expected: usize, status: RunStatus) -> TaskStatus {
    let ok = results.iter().filter(|r| r.outcome != Outcome::Error).count();
    if ok == 0 {
        return TaskStatus::Failed;
    }
    if status == RunStatus::Success && ok >= expected {
        TaskStatus::Completed
    } else {
        TaskStatus::PartialFailure
    }
}
