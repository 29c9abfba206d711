//! # contract: shared data model and mockable seams
//!
//! Plain data types that cross component boundaries ([`MoveRecord`],
//! [`PipelineKind`], [`ItemKind`]) and the two trait seams the engine is
//! assembled from:
//!
//! - [`MoveLedger`]: durable, append-only move history. The production
//!   implementation is [`crate::ledger::JsonlLedger`].
//! - [`TriggerDetector`]: decides whether a job folder is out of charge. The
//!   production implementation is [`crate::trigger::MarkerTrigger`].
//!
//! Both traits are annotated for `mockall` so tests can script ledger failures
//! and trigger decisions without touching a disk.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;

/// The three routing pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    /// Upload area -> job working folders.
    UploadRouter,
    /// Out-of-charge job folders -> billing archive.
    JobMover,
    /// Loose files in billing company folders -> their job subfolder.
    LooseFileClassifier,
}

impl PipelineKind {
    pub const ALL: [PipelineKind; 3] = [
        PipelineKind::UploadRouter,
        PipelineKind::JobMover,
        PipelineKind::LooseFileClassifier,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            PipelineKind::UploadRouter => "upload_router",
            PipelineKind::JobMover => "job_mover",
            PipelineKind::LooseFileClassifier => "loose_file_classifier",
        }
    }

    /// Kind of item this pipeline moves.
    pub const fn item_kind(self) -> ItemKind {
        match self {
            PipelineKind::JobMover => ItemKind::Directory,
            PipelineKind::UploadRouter | PipelineKind::LooseFileClassifier => ItemKind::File,
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "upload_router" | "upload" | "ooc_upload" => Ok(PipelineKind::UploadRouter),
            "job_mover" | "job" | "jobs" => Ok(PipelineKind::JobMover),
            "loose_file_classifier" | "loose" | "loose_files" => {
                Ok(PipelineKind::LooseFileClassifier)
            }
            other => Err(format!(
                "unknown pipeline '{other}' (expected upload_router, job_mover or loose_file_classifier)"
            )),
        }
    }
}

/// Whether a moved item is a single file or a whole folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    File,
    Directory,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::File => f.write_str("file"),
            ItemKind::Directory => f.write_str("directory"),
        }
    }
}

/// Lifecycle of a ledger record. `Completed -> Reverted` happens at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStatus {
    Completed,
    Reverted,
}

/// Globally unique, immutable identifier of a move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MoveId(Uuid);

impl MoveId {
    pub fn new() -> Self {
        MoveId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MoveId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MoveId {
    fn from(id: Uuid) -> Self {
        MoveId(id)
    }
}

impl fmt::Display for MoveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MoveId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(MoveId)
    }
}

/// One performed move, as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub move_id: MoveId,
    pub pipeline: PipelineKind,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub item_kind: ItemKind,
    pub timestamp: DateTime<Utc>,
    pub status: MoveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Set once the record transitions to [`MoveStatus::Reverted`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_at: Option<DateTime<Utc>>,
}

impl MoveRecord {
    pub fn is_revertible(&self) -> bool {
        self.status == MoveStatus::Completed
    }
}

/// A move that already happened on disk and is about to be recorded.
/// The ledger assigns the [`MoveId`] and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMove {
    pub pipeline: PipelineKind,
    pub source_path: PathBuf,
    pub destination_path: PathBuf,
    pub item_kind: ItemKind,
    pub job_id: Option<String>,
}

/// Durable, append-only move history.
///
/// Implementations are the single writer of their storage: concurrent
/// `append` calls serialize, and a successful return means the entry survives
/// a process crash. Readers never mutate entries.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait MoveLedger: Send + Sync {
    /// Persist a completed move and return the stored record.
    async fn append(&self, entry: NewMove) -> Result<MoveRecord, LedgerError>;

    /// All records for a job, oldest first.
    async fn find_by_job(&self, job_id: &str) -> Result<Vec<MoveRecord>, LedgerError>;

    /// Fetch a single record by id.
    async fn get(&self, move_id: MoveId) -> Result<MoveRecord, LedgerError>;

    /// Every record, oldest first.
    async fn records(&self) -> Result<Vec<MoveRecord>, LedgerError>;

    /// Transition a record from completed to reverted.
    ///
    /// Fails with [`LedgerError::NotFound`] or [`LedgerError::AlreadyReverted`].
    async fn mark_reverted(&self, move_id: MoveId) -> Result<MoveRecord, LedgerError>;
}

/// Decides whether a job folder is out of charge (ready to bill).
///
/// A pure read: implementations must not mutate the folder, and must answer
/// `false` whenever the state is ambiguous or unreadable.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
pub trait TriggerDetector: Send + Sync {
    fn is_ready(&self, job_folder: &Path) -> bool;
}
