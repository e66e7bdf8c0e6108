//! Report aggregation. Pure functions over an [`Execution`].

use peerlab_core::LabError;
use peerlab_state::{Aggregates, Report, ReportSummary, TransferStats};

use crate::plan::QuerySelections;
use crate::run::Execution;

/// Link to a trace in the trace UI.
pub fn trace_link(ui_url: &str, trace_id: &str) -> String {
    format!("{}/trace/{trace_id}", ui_url.trim_end_matches('/'))
}

/// Summarize an execution. `trace_ui` turns the trace id into a link.
pub fn aggregate(
    benchmark_id: &str,
    execution: &Execution,
    queries: &QuerySelections,
    trace_ui: Option<&str>,
) -> Report {
    let failed_nodes = execution.failed_nodes();
    let error = if execution.cancelled {
        Some("cancelled".to_string())
    } else if !failed_nodes.is_empty() {
        Some(format!(
            "{} of {} nodes failed",
            failed_nodes.len(),
            execution.nodes.len()
        ))
    } else {
        None
    };

    let trace = match trace_ui {
        Some(ui) => trace_link(ui, &execution.trace_id),
        None => execution.trace_id.clone(),
    };

    Report {
        benchmark_id: benchmark_id.to_string(),
        summary: ReportSummary {
            total_time_ms: execution.end_ms.saturating_sub(execution.start_ms),
            trace,
            failed_nodes,
            error,
        },
        nodes: execution.nodes.clone(),
        queries: queries.clone(),
        aggregates: aggregates(execution),
    }
}

/// Report for a run that never reached the benchmark phase.
pub fn aborted(benchmark_id: &str, queries: &QuerySelections, error: &LabError) -> Report {
    let message = if error.is_cancelled() {
        "cancelled".to_string()
    } else {
        error.to_string()
    };
    Report {
        benchmark_id: benchmark_id.to_string(),
        summary: ReportSummary {
            error: Some(message),
            ..ReportSummary::default()
        },
        queries: queries.clone(),
        ..Report::default()
    }
}

fn aggregates(execution: &Execution) -> Aggregates {
    let traces: Vec<_> = execution.nodes.values().collect();
    if traces.is_empty() {
        return Aggregates::default();
    }

    let mut totals = TransferStats::default();
    for trace in &traces {
        totals.accumulate(&trace.stats);
    }
    let durations: Vec<u64> = traces.iter().map(|t| t.duration_ms()).collect();
    let n = traces.len() as f64;

    Aggregates {
        nodes: traces.len(),
        failed: traces.iter().filter(|t| t.failed()).count(),
        totals,
        avg_bytes_in: totals.bytes_in as f64 / n,
        avg_bytes_out: totals.bytes_out as f64 / n,
        min_duration_ms: durations.iter().copied().min().unwrap_or_default(),
        max_duration_ms: durations.iter().copied().max().unwrap_or_default(),
        mean_duration_ms: durations.iter().sum::<u64>() as f64 / n,
    }
}
