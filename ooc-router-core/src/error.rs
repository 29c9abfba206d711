//! Error taxonomy for the move-and-track engine.
//!
//! Errors fall into three groups:
//!
//! - per-item, retryable: [`MoveError::PathUnreachable`], [`MoveError::Io`];
//! - per-item, needs an operator: [`MoveError::DestinationCollision`],
//!   [`MoveError::DestinationParentMissing`];
//! - integrity risks, never retried automatically: [`LedgerError::Write`],
//!   [`MoveError::LedgerInconsistency`], [`MoveError::SourceLeftBehind`],
//!   [`RevertError::Inconsistent`].
//!
//! Revert requests add user-facing errors ([`RevertError::NotFound`],
//! [`RevertError::AlreadyReverted`], [`RevertError::RevertBlocked`]) with no
//! system-wide impact.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::contract::{ItemKind, MoveId, PipelineKind};

/// Failures of the durable move ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("failed to write move ledger {path}")]
    Write {
        path: PathBuf,
        source: io::Error,
    },
    #[error("failed to read move ledger {path}")]
    Read {
        path: PathBuf,
        source: io::Error,
    },
    #[error("move ledger {path} is corrupt at line {line}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },
    #[error("failed to encode ledger entry")]
    Encode(#[source] serde_json::Error),
    #[error("move {0} not found in ledger")]
    NotFound(MoveId),
    #[error("move {0} is already reverted")]
    AlreadyReverted(MoveId),
    #[error("ledger task failed: {0}")]
    Task(String),
}

impl LedgerError {
    /// Storage-level failures threaten the ledger as source of truth.
    pub fn is_integrity_risk(&self) -> bool {
        matches!(
            self,
            LedgerError::Write { .. } | LedgerError::Corrupt { .. } | LedgerError::Task(_)
        )
    }
}

/// Failures of a single move.
#[derive(Debug, Error)]
pub enum MoveError {
    #[error("path {path} is unreachable: {reason}")]
    PathUnreachable { path: PathBuf, reason: String },
    #[error("source {0} does not exist")]
    SourceMissing(PathBuf),
    #[error("{path} is not a {expected}")]
    UnexpectedKind { path: PathBuf, expected: ItemKind },
    #[error("destination {0} already exists")]
    DestinationCollision(PathBuf),
    #[error("destination directory {0} does not exist")]
    DestinationParentMissing(PathBuf),
    #[error("moved {source_path} to {destination_path} but the ledger write failed")]
    LedgerInconsistency {
        source_path: PathBuf,
        destination_path: PathBuf,
        source: LedgerError,
    },
    /// A folder was copied across devices but its source could not be
    /// fully removed. The copy at the destination is complete.
    #[error("copied {source_path} to {destination_path} but could not fully remove the source")]
    SourceLeftBehind {
        source_path: PathBuf,
        destination_path: PathBuf,
        /// Set once the move has been recorded.
        move_id: Option<MoveId>,
        source: io::Error,
    },
    #[error("{operation} failed for {path}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

impl MoveError {
    /// Filesystem and ledger disagree; an operator must look at it.
    pub fn is_integrity_risk(&self) -> bool {
        self.integrity_subject().is_some()
    }

    /// Source, destination and recorded move behind an integrity risk.
    pub fn integrity_subject(&self) -> Option<(&Path, &Path, Option<MoveId>)> {
        match self {
            MoveError::LedgerInconsistency {
                source_path,
                destination_path,
                ..
            } => Some((source_path, destination_path, None)),
            MoveError::SourceLeftBehind {
                source_path,
                destination_path,
                move_id,
                ..
            } => Some((source_path, destination_path, *move_id)),
            _ => None,
        }
    }

    /// The next scan cycle may succeed without anyone intervening.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MoveError::PathUnreachable { .. } | MoveError::Io { .. })
    }

    /// Short machine-readable code used in the activity log.
    pub fn code(&self) -> &'static str {
        match self {
            MoveError::PathUnreachable { .. } => "path_unreachable",
            MoveError::SourceMissing(_) => "source_missing",
            MoveError::UnexpectedKind { .. } => "unexpected_kind",
            MoveError::DestinationCollision(_) => "destination_collision",
            MoveError::DestinationParentMissing(_) => "destination_parent_missing",
            MoveError::LedgerInconsistency { .. } => "ledger_inconsistency",
            MoveError::SourceLeftBehind { .. } => "source_left_behind",
            MoveError::Io { .. } => "io",
        }
    }
}

/// Failures of a revert request.
#[derive(Debug, Error)]
pub enum RevertError {
    #[error("move {0} not found")]
    NotFound(MoveId),
    #[error("move {0} is already reverted")]
    AlreadyReverted(MoveId),
    #[error("cannot revert move {move_id}: {path} no longer exists")]
    RevertBlocked { move_id: MoveId, path: PathBuf },
    #[error("no revertible move recorded for job {0}")]
    NothingToRevert(String),
    #[error("inverse move failed")]
    Move(#[from] MoveError),
    #[error("ledger lookup failed")]
    Ledger(#[source] LedgerError),
    #[error("reverted move {move_id} on disk but the ledger update failed")]
    Inconsistent { move_id: MoveId, source: LedgerError },
}

impl RevertError {
    pub fn is_integrity_risk(&self) -> bool {
        matches!(self, RevertError::Inconsistent { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            RevertError::NotFound(_) => "not_found",
            RevertError::AlreadyReverted(_) => "already_reverted",
            RevertError::RevertBlocked { .. } => "revert_blocked",
            RevertError::NothingToRevert(_) => "nothing_to_revert",
            RevertError::Move(e) => e.code(),
            RevertError::Ledger(_) => "ledger",
            RevertError::Inconsistent { .. } => "ledger_inconsistency",
        }
    }
}

impl From<LedgerError> for RevertError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NotFound(id) => RevertError::NotFound(id),
            LedgerError::AlreadyReverted(id) => RevertError::AlreadyReverted(id),
            other => RevertError::Ledger(other),
        }
    }
}

/// An invalid naming-convention rule, rejected when the rule set is compiled.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule '{rule}' has an invalid pattern")]
    InvalidPattern {
        rule: String,
        source: regex::Error,
    },
    #[error("rule '{rule}' has an invalid template '{template}': {reason}")]
    InvalidTemplate {
        rule: String,
        template: String,
        reason: String,
    },
}

/// Failures reading or writing the activity log.
#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("activity log io failure at {path}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to encode activity entry")]
    Encode(#[source] serde_json::Error),
}

/// Failures assembling or driving the supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("pipeline {0} is not configured")]
    NotConfigured(PipelineKind),
    #[error("pipeline {0} is running; stop it first")]
    AlreadyRunning(PipelineKind),
    #[error("pipeline {0} is shutting down")]
    ShuttingDown(PipelineKind),
    #[error("pipeline {0} task failed")]
    TaskFailed(PipelineKind),
    #[error("invalid rules for pipeline {pipeline}")]
    Rules {
        pipeline: PipelineKind,
        source: RuleError,
    },
    #[error("failed to open move ledger")]
    Ledger(#[from] LedgerError),
    #[error("failed to prepare activity log")]
    Activity(#[from] ActivityError),
}
