//! Human-readable rendering of core results for the terminal.

use ooc_router_core::activity::{ActivityEntry, ActivitySummary};
use ooc_router_core::contract::MoveRecord;
use ooc_router_core::scan::{CycleReport, PipelineStatus};
use serde::Serialize;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn cycle_report(report: &CycleReport) -> String {
    let mut out = format!(
        "{} cycle {}: examined {}, moved {}, skipped {}, errored {}\n",
        report.pipeline,
        report.cycle_id,
        report.examined,
        report.moved.len(),
        report.skipped,
        report.errored
    );
    if let Some(failure) = &report.scan_failed {
        out.push_str(&format!("  scan failed: {failure}\n"));
    }
    for record in &report.moved {
        out.push_str(&format!("  {}\n", move_line(record)));
    }
    out
}

pub fn records(records: &[MoveRecord]) -> String {
    if records.is_empty() {
        return "no revertible moves\n".to_string();
    }
    records
        .iter()
        .map(|record| {
            format!(
                "{}  {}  {}\n",
                record.move_id,
                record.timestamp.format(TIME_FORMAT),
                move_line(record)
            )
        })
        .collect()
}

pub fn reverted(record: &MoveRecord) -> String {
    format!(
        "reverted {}: {} -> {}\n",
        record.move_id,
        record.destination_path.display(),
        record.source_path.display()
    )
}

fn move_line(record: &MoveRecord) -> String {
    format!(
        "[{}] {} {} -> {}{}",
        record.pipeline,
        record.item_kind,
        record.source_path.display(),
        record.destination_path.display(),
        record
            .job_id
            .as_deref()
            .map(|job| format!(" (job {job})"))
            .unwrap_or_default()
    )
}

pub fn entries(entries: &[ActivityEntry]) -> String {
    entries.iter().map(|entry| format!("{}\n", entry_line(entry))).collect()
}

fn entry_line(entry: &ActivityEntry) -> String {
    let mut line = format!(
        "{}  {:<22} {:<15} {}",
        entry.timestamp.format(TIME_FORMAT),
        entry.pipeline.map(|p| p.as_str()).unwrap_or("-"),
        entry.action.as_str(),
        entry.source.display()
    );
    if let Some(destination) = &entry.destination {
        line.push_str(&format!(" -> {}", destination.display()));
    }
    line.push_str(&format!("  [{}]", entry.outcome));
    if let Some(detail) = &entry.detail {
        line.push_str(&format!("  {detail}"));
    }
    line
}

pub fn summary(summary: &ActivitySummary) -> String {
    let mut out = String::from("Totals\n");
    if summary.totals.is_empty() {
        out.push_str("  (no activity)\n");
    }
    for (action, count) in &summary.totals {
        out.push_str(&format!("  {:<15} {count}\n", action.as_str()));
    }
    if !summary.skip_reasons.is_empty() {
        out.push_str("Skip reasons\n");
        for reason in &summary.skip_reasons {
            out.push_str(&format!("  {reason}\n"));
        }
    }
    if !summary.errors.is_empty() {
        out.push_str("Errors\n");
        for entry in &summary.errors {
            out.push_str(&format!("  {}\n", entry_line(entry)));
        }
    }
    out
}

pub fn statuses(statuses: &[PipelineStatus]) -> String {
    statuses
        .iter()
        .map(|status| {
            format!(
                "{:<22} {:<9} moved {} skipped {} errored {} scan failures {}\n",
                status.pipeline.as_str(),
                status.state.as_str(),
                status.counters.moved,
                status.counters.skipped,
                status.counters.errored,
                status.counters.scan_failures
            )
        })
        .collect()
}
