//! In-process event bus for pipeline activity.
//!
//! Every state change, move, skip, error, revert and integrity alert is
//! published here so a front end can render live status without polling.
//! Slow subscribers lag and lose the oldest events; the activity log stays the
//! durable record.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::contract::{MoveId, MoveRecord, PipelineKind};
use crate::scan::PipelineState;

const DEFAULT_CAPACITY: usize = 1_024;

/// Typed events surfaced by the supervisor and its scan loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        pipeline: PipelineKind,
        state: PipelineState,
    },
    Moved {
        record: MoveRecord,
    },
    Skipped {
        pipeline: PipelineKind,
        source: PathBuf,
        reason: String,
    },
    Errored {
        pipeline: PipelineKind,
        source: PathBuf,
        error: String,
    },
    ScanFailed {
        pipeline: PipelineKind,
        error: String,
    },
    Reverted {
        record: MoveRecord,
    },
    IntegrityAlert(IntegrityAlert),
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::StateChanged { .. } => "state_changed",
            PipelineEvent::Moved { .. } => "moved",
            PipelineEvent::Skipped { .. } => "skipped",
            PipelineEvent::Errored { .. } => "errored",
            PipelineEvent::ScanFailed { .. } => "scan_failed",
            PipelineEvent::Reverted { .. } => "reverted",
            PipelineEvent::IntegrityAlert(_) => "integrity_alert",
        }
    }
}

/// Filesystem and ledger disagree about a move. Needs an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityAlert {
    pub raised_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub move_id: Option<MoveId>,
    pub source: PathBuf,
    pub destination: PathBuf,
    /// Error code of the failure, e.g. `ledger_inconsistency`.
    pub code: String,
    pub message: String,
}

/// Cloneable handle to a `tokio::broadcast` channel of [`PipelineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
