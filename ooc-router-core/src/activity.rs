//! # activity: the durable, human-facing log surface
//!
//! One JSON line per event, in files a log viewer can tail:
//!
//! - `<pipeline>.jsonl` for moves, skips, errors and scan failures;
//! - `revert.jsonl` for every revert attempt, successful or not;
//! - `integrity_alerts.jsonl` for filesystem/ledger disagreements.
//!
//! This is separate from `tracing` diagnostics and from the move ledger; the
//! ledger stays the source of truth for revert. Writes that fail are logged
//! and dropped so a full log disk never stops a move.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::contract::{MoveId, MoveRecord, PipelineKind};
use crate::error::ActivityError;
use crate::events::IntegrityAlert;

const REVERT_LOG: &str = "revert.jsonl";
const ALERT_LOG: &str = "integrity_alerts.jsonl";
const SERVICE_LOG: &str = "service.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityAction {
    Moved,
    Skipped,
    Error,
    ScanFailed,
    Reverted,
    RevertFailed,
    IntegrityAlert,
}

impl ActivityAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            ActivityAction::Moved => "moved",
            ActivityAction::Skipped => "skipped",
            ActivityAction::Error => "error",
            ActivityAction::ScanFailed => "scan_failed",
            ActivityAction::Reverted => "reverted",
            ActivityAction::RevertFailed => "revert_failed",
            ActivityAction::IntegrityAlert => "integrity_alert",
        }
    }
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineKind>,
    pub action: ActivityAction,
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
    /// `ok`, a skip reason or an error code.
    pub outcome: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_id: Option<MoveId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActivityEntry {
    pub fn new(
        action: ActivityAction,
        pipeline: Option<PipelineKind>,
        source: impl Into<PathBuf>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            pipeline,
            action,
            source: source.into(),
            destination: None,
            outcome: outcome.into(),
            job_id: None,
            move_id: None,
            detail: None,
        }
    }

    pub fn for_record(action: ActivityAction, record: &MoveRecord) -> Self {
        Self {
            destination: Some(record.destination_path.clone()),
            job_id: record.job_id.clone(),
            move_id: Some(record.move_id),
            ..Self::new(action, Some(record.pipeline), &record.source_path, "ok")
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_job(mut self, job_id: Option<String>) -> Self {
        self.job_id = job_id;
        self
    }

    pub fn with_move_id(mut self, move_id: MoveId) -> Self {
        self.move_id = Some(move_id);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn file_name(&self) -> String {
        match (self.action, self.pipeline) {
            (ActivityAction::Reverted | ActivityAction::RevertFailed, _) => REVERT_LOG.to_string(),
            (ActivityAction::IntegrityAlert, _) => ALERT_LOG.to_string(),
            (_, Some(pipeline)) => format!("{pipeline}.jsonl"),
            (_, None) => SERVICE_LOG.to_string(),
        }
    }
}

impl From<&IntegrityAlert> for ActivityEntry {
    fn from(alert: &IntegrityAlert) -> Self {
        Self {
            timestamp: alert.raised_at,
            pipeline: alert.pipeline,
            action: ActivityAction::IntegrityAlert,
            source: alert.source.clone(),
            destination: Some(alert.destination.clone()),
            outcome: alert.code.clone(),
            job_id: None,
            move_id: alert.move_id,
            detail: Some(alert.message.clone()),
        }
    }
}

/// Filter for [`ActivityLog::query`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ActivityQuery {
    pub pipeline: Option<PipelineKind>,
    pub job_id: Option<String>,
    pub action: Option<ActivityAction>,
}

impl ActivityQuery {
    fn matches(&self, entry: &ActivityEntry) -> bool {
        self.pipeline.map_or(true, |p| entry.pipeline == Some(p))
            && self
                .job_id
                .as_deref()
                .map_or(true, |job| entry.job_id.as_deref() == Some(job))
            && self.action.map_or(true, |a| entry.action == a)
    }
}

/// Totals over the whole activity log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivitySummary {
    pub totals: BTreeMap<ActivityAction, usize>,
    pub skip_reasons: BTreeSet<String>,
    pub errors: Vec<ActivityEntry>,
}

impl ActivitySummary {
    pub fn count(&self, action: ActivityAction) -> usize {
        self.totals.get(&action).copied().unwrap_or(0)
    }
}

/// Append-only JSONL activity log rooted at a directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ActivityLog {
    dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl ActivityLog {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ActivityError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| ActivityError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir: Arc::new(dir),
            lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append an entry on the blocking pool. Failures are logged, never
    /// returned.
    pub async fn record(&self, entry: ActivityEntry) {
        let action = entry.action;
        let log = self.clone();
        match tokio::task::spawn_blocking(move || log.try_record(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = ?e, %action, "activity log write failed"),
            Err(e) => warn!(error = %e, %action, "activity log task failed"),
        }
    }

    pub async fn record_alert(&self, alert: &IntegrityAlert) {
        self.record(ActivityEntry::from(alert)).await;
    }

    fn try_record(&self, entry: &ActivityEntry) -> Result<(), ActivityError> {
        let mut line = serde_json::to_vec(entry).map_err(ActivityError::Encode)?;
        line.push(b'\n');
        let path = self.dir.join(entry.file_name());
        let io_err = |source| ActivityError::Io {
            path: path.clone(),
            source,
        };

        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        file.write_all(&line).map_err(io_err)?;
        if entry.action == ActivityAction::IntegrityAlert {
            file.sync_data().map_err(io_err)?;
        }
        Ok(())
    }

    /// Entries matching `query`, oldest first. Unparsable lines are skipped.
    pub fn query(&self, query: &ActivityQuery) -> Result<Vec<ActivityEntry>, ActivityError> {
        let mut entries = Vec::new();
        for path in self.log_files() {
            let file = match fs::File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => return Err(ActivityError::Io { path, source }),
            };
            for (number, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|source| ActivityError::Io {
                    path: path.clone(),
                    source,
                })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<ActivityEntry>(&line) {
                    Ok(entry) if query.matches(&entry) => entries.push(entry),
                    Ok(_) => {}
                    Err(e) => warn!(
                        path = %path.display(),
                        line = number + 1,
                        error = %e,
                        "skipping unreadable activity line"
                    ),
                }
            }
        }
        entries.sort_by_key(|e| e.timestamp);
        Ok(entries)
    }

    pub fn integrity_alerts(&self) -> Result<Vec<ActivityEntry>, ActivityError> {
        self.query(&ActivityQuery {
            action: Some(ActivityAction::IntegrityAlert),
            ..ActivityQuery::default()
        })
    }

    /// Counts per action and the distinct skip reasons seen.
    pub fn summary(&self) -> Result<ActivitySummary, ActivityError> {
        let mut summary = ActivitySummary::default();
        for entry in self.query(&ActivityQuery::default())? {
            *summary.totals.entry(entry.action).or_default() += 1;
            match entry.action {
                ActivityAction::Skipped => {
                    summary.skip_reasons.insert(entry.outcome.clone());
                }
                ActivityAction::Error
                | ActivityAction::ScanFailed
                | ActivityAction::RevertFailed
                | ActivityAction::IntegrityAlert => summary.errors.push(entry),
                ActivityAction::Moved | ActivityAction::Reverted => {}
            }
        }
        Ok(summary)
    }

    fn log_files(&self) -> Vec<PathBuf> {
        let mut names: Vec<String> = PipelineKind::ALL
            .iter()
            .map(|p| format!("{p}.jsonl"))
            .collect();
        names.extend([REVERT_LOG, ALERT_LOG, SERVICE_LOG].map(String::from));
        names.into_iter().map(|n| self.dir.join(n)).collect()
    }
}
