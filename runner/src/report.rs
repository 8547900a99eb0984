use crate::scheduler::BenchmarkResults;
use serde::Serialize;
use std::{collections::BTreeMap, fs::File, io, io::BufWriter, path::Path};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to create results file")]
    Create(#[source] io::Error),
    #[error("Failed to serialize results")]
    Serialize(#[from] serde_json::Error),
}

/// Aggregate of all runs of one assistant across every prompt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantSummary {
    pub runs: usize,
    pub failures: usize,
    pub success_rate: f64,
    /// mean over succeeded runs only, `None` if none succeeded
    pub mean_response_time_seconds: Option<f64>,
}

pub fn write_results(path: &Path, results: &BenchmarkResults) -> Result<(), ReportError> {
    let file = File::create(path).map_err(ReportError::Create)?;

    serde_json::to_writer_pretty(BufWriter::new(file), results)?;
    info!("Wrote {} runs to {}", results.total_runs(), path.display());

    Ok(())
}

/// summary per assistant, computed from the recorded errors
pub fn summarize(results: &BenchmarkResults) -> BTreeMap<String, AssistantSummary> {
    let mut totals: BTreeMap<&str, (usize, usize, Vec<f64>)> = BTreeMap::new();

    for cell in results.cells.iter() {
        let (runs, failures, times) = totals.entry(cell.assistant.as_str()).or_default();

        for run in cell.runs.iter() {
            *runs += 1;

            if run.succeeded() {
                times.extend(run.response_time_seconds);
            } else {
                *failures += 1;
            }
        }
    }

    totals
        .into_iter()
        .map(|(assistant, (runs, failures, times))| {
            let success_rate = if runs == 0 {
                0.0
            } else {
                (runs - failures) as f64 / runs as f64
            };
            let mean_response_time_seconds =
                (!times.is_empty()).then(|| times.iter().sum::<f64>() / times.len() as f64);

            (
                assistant.to_owned(),
                AssistantSummary {
                    runs,
                    failures,
                    success_rate,
                    mean_response_time_seconds,
                },
            )
        })
        .collect()
}
