//! # mover: relocate one item and record it
//!
//! [`Mover::move_item`] moves a file or folder, never overwriting anything at
//! the destination, and appends the move to the ledger before reporting
//! success.
//!
//! Filesystem work runs on the blocking pool under a timeout so an unreachable
//! share cannot stall a scan loop. A move that times out is reported as
//! [`MoveError::PathUnreachable`], but it is not abandoned: if the blocking
//! call later finishes, the ledger is updated then, so history always
//! matches the disk.
//!
//! `rename` is tried first. Across devices the item is copied under a hidden
//! staging name next to the destination, renamed into place, and only then is
//! the source removed.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::contract::{ItemKind, MoveId, MoveLedger, MoveRecord, NewMove, PipelineKind};
use crate::error::MoveError;

pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// A single move to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveRequest {
    pub pipeline: PipelineKind,
    pub source_path: PathBuf,
    /// Final path of the item, including its name.
    pub destination_path: PathBuf,
    pub item_kind: ItemKind,
    pub job_id: Option<String>,
}

impl From<&MoveRequest> for NewMove {
    fn from(request: &MoveRequest) -> Self {
        NewMove {
            pipeline: request.pipeline,
            source_path: request.source_path.clone(),
            destination_path: request.destination_path.clone(),
            item_kind: request.item_kind,
            job_id: request.job_id.clone(),
        }
    }
}

/// Whether missing destination directories may be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParentPolicy {
    /// Create them, but only below an existing destination root.
    CreateUnderRoot,
    RequireExisting,
}

/// Ledger update to perform if a timed-out relocation finishes after all.
#[derive(Debug)]
pub(crate) enum LateCompletion {
    Append(NewMove),
    MarkReverted(MoveId),
}

#[derive(Clone)]
pub struct Mover {
    ledger: Arc<dyn MoveLedger>,
    destination_roots: Arc<Vec<PathBuf>>,
    timeout: Duration,
}

impl Mover {
    pub fn new(ledger: Arc<dyn MoveLedger>) -> Self {
        Self {
            ledger,
            destination_roots: Arc::new(Vec::new()),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Roots below which missing directories may be created for folder moves.
    /// The roots themselves are never created.
    pub fn with_destination_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.destination_roots = Arc::new(roots);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn MoveLedger> {
        &self.ledger
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Move the item and record it.
    ///
    /// On a destination collision the source and the existing destination are
    /// left untouched. If the move succeeded but the ledger append failed, the
    /// move is kept and [`MoveError::LedgerInconsistency`] is returned. A folder
    /// copied across devices whose source could not be removed is still
    /// recorded, then reported as [`MoveError::SourceLeftBehind`].
    pub async fn move_item(&self, request: MoveRequest) -> Result<MoveRecord, MoveError> {
        let policy = match request.item_kind {
            ItemKind::Directory => ParentPolicy::CreateUnderRoot,
            ItemKind::File => ParentPolicy::RequireExisting,
        };
        let entry = NewMove::from(&request);

        let leftover = match self
            .relocate(
                &request.source_path,
                &request.destination_path,
                request.item_kind,
                policy,
                LateCompletion::Append(entry.clone()),
            )
            .await
        {
            Ok(()) => None,
            Err(MoveError::SourceLeftBehind { source, .. }) => Some(source),
            Err(e) => return Err(e),
        };

        match self.ledger.append(entry).await {
            Ok(record) => {
                info!(
                    pipeline = %record.pipeline,
                    move_id = %record.move_id,
                    job_id = record.job_id.as_deref().unwrap_or(""),
                    source = %record.source_path.display(),
                    destination = %record.destination_path.display(),
                    "moved"
                );
                match leftover {
                    None => Ok(record),
                    Some(source) => Err(MoveError::SourceLeftBehind {
                        source_path: record.source_path,
                        destination_path: record.destination_path,
                        move_id: Some(record.move_id),
                        source,
                    }),
                }
            }
            Err(source) => {
                error!(
                    pipeline = %request.pipeline,
                    source = %request.source_path.display(),
                    destination = %request.destination_path.display(),
                    error = ?source,
                    "item moved but ledger append failed"
                );
                Err(MoveError::LedgerInconsistency {
                    source_path: request.source_path,
                    destination_path: request.destination_path,
                    source,
                })
            }
        }
    }

    /// Filesystem half of a move, shared with revert.
    pub(crate) async fn relocate(
        &self,
        source: &Path,
        destination: &Path,
        kind: ItemKind,
        policy: ParentPolicy,
        late: LateCompletion,
    ) -> Result<(), MoveError> {
        let roots = Arc::clone(&self.destination_roots);
        let (src, dst) = (source.to_path_buf(), destination.to_path_buf());
        let mut handle =
            tokio::task::spawn_blocking(move || relocate_blocking(&src, &dst, kind, policy, &roots));

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(MoveError::Io {
                operation: "move",
                path: source.to_path_buf(),
                source: io::Error::other(join.to_string()),
            }),
            Err(_) => {
                warn!(
                    source = %source.display(),
                    destination = %destination.display(),
                    timeout = ?self.timeout,
                    "filesystem operation timed out"
                );
                self.finish_late(handle, late);
                Err(MoveError::PathUnreachable {
                    path: source.to_path_buf(),
                    reason: format!("no response within {:?}", self.timeout),
                })
            }
        }
    }

    fn finish_late(&self, handle: JoinHandle<Result<(), MoveError>>, late: LateCompletion) {
        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(()) | Err(MoveError::SourceLeftBehind { .. })) => match late {
                    LateCompletion::Append(entry) => match ledger.append(entry).await {
                        Ok(record) => {
                            warn!(move_id = %record.move_id, "timed-out move completed late and was recorded")
                        }
                        Err(e) => error!(error = ?e, "timed-out move completed late but ledger append failed"),
                    },
                    LateCompletion::MarkReverted(move_id) => {
                        match ledger.mark_reverted(move_id).await {
                            Ok(_) => warn!(%move_id, "timed-out revert completed late and was recorded"),
                            Err(e) => error!(%move_id, error = ?e, "timed-out revert completed late but ledger update failed"),
                        }
                    }
                },
                Ok(Err(e)) => debug!(error = %e, "timed-out move failed"),
                Err(e) => warn!(error = %e, "timed-out move task did not finish"),
            }
        });
    }
}

fn relocate_blocking(
    source: &Path,
    destination: &Path,
    kind: ItemKind,
    policy: ParentPolicy,
    roots: &[PathBuf],
) -> Result<(), MoveError> {
    let meta = match fs::symlink_metadata(source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(MoveError::SourceMissing(source.to_path_buf()))
        }
        Err(e) => return Err(classify(e, "inspect source", source)),
    };
    let kind_matches = match kind {
        ItemKind::File => meta.is_file(),
        ItemKind::Directory => meta.is_dir(),
    };
    if !kind_matches {
        return Err(MoveError::UnexpectedKind {
            path: source.to_path_buf(),
            expected: kind,
        });
    }

    ensure_vacant(destination)?;

    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| MoveError::DestinationParentMissing(destination.to_path_buf()))?;
    ensure_parent(parent, policy, roots)?;

    match fs::rename(source, destination) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            debug!(source = %source.display(), "rename crosses devices, copying");
            copy_across(source, destination, kind)
        }
        Err(e) => Err(classify(e, "rename", source)),
    }
}

fn ensure_vacant(destination: &Path) -> Result<(), MoveError> {
    match fs::symlink_metadata(destination) {
        Ok(_) => Err(MoveError::DestinationCollision(destination.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(classify(e, "inspect destination", destination)),
    }
}

fn ensure_parent(parent: &Path, policy: ParentPolicy, roots: &[PathBuf]) -> Result<(), MoveError> {
    match fs::metadata(parent) {
        Ok(meta) if meta.is_dir() => return Ok(()),
        Ok(_) => return Err(MoveError::DestinationParentMissing(parent.to_path_buf())),
        Err(e) if e.kind() != ErrorKind::NotFound => {
            return Err(classify(e, "inspect destination directory", parent))
        }
        Err(_) => {}
    }

    if policy == ParentPolicy::RequireExisting {
        return Err(MoveError::DestinationParentMissing(parent.to_path_buf()));
    }

    let root = roots
        .iter()
        .find(|root| parent.starts_with(root))
        .ok_or_else(|| MoveError::DestinationParentMissing(parent.to_path_buf()))?;
    if !root.is_dir() {
        return Err(MoveError::PathUnreachable {
            path: root.clone(),
            reason: "destination root is not available".to_string(),
        });
    }

    fs::create_dir_all(parent).map_err(|e| classify(e, "create destination directory", parent))?;
    debug!(directory = %parent.display(), "created destination directory");
    Ok(())
}

fn copy_across(source: &Path, destination: &Path, kind: ItemKind) -> Result<(), MoveError> {
    let staging = staging_path(destination);
    let copied = match kind {
        ItemKind::File => fs::copy(source, &staging).map(|_| ()),
        ItemKind::Directory => copy_tree(source, &staging),
    };
    if let Err(e) = copied {
        discard(&staging, kind);
        return Err(classify(e, "copy", source));
    }

    if let Err(e) = ensure_vacant(destination) {
        discard(&staging, kind);
        return Err(e);
    }
    if let Err(e) = fs::rename(&staging, destination) {
        discard(&staging, kind);
        return Err(classify(e, "rename staged copy", destination));
    }

    let removed = match kind {
        ItemKind::File => fs::remove_file(source),
        ItemKind::Directory => fs::remove_dir_all(source),
    };
    settle_source(removed, source, destination, kind)
}

/// Outcome of a cross-device move once the copy is in place and removing the
/// source has been attempted.
fn settle_source(
    removed: io::Result<()>,
    source: &Path,
    destination: &Path,
    kind: ItemKind,
) -> Result<(), MoveError> {
    match (removed, kind) {
        (Ok(()), _) => Ok(()),
        (Err(e), ItemKind::File) => {
            // Keep exactly one copy: the untouched source.
            discard(destination, kind);
            Err(classify(e, "remove source", source))
        }
        (Err(e), ItemKind::Directory) => {
            warn!(
                source = %source.display(),
                destination = %destination.display(),
                error = %e,
                "folder copied but source could not be fully removed"
            );
            Err(MoveError::SourceLeftBehind {
                source_path: source.to_path_buf(),
                destination_path: destination.to_path_buf(),
                move_id: None,
                source: e,
            })
        }
    }
}

fn copy_tree(source: &Path, target: &Path) -> io::Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let dst = target.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dst)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &dst)?;
        } else {
            return Err(io::Error::new(
                ErrorKind::Unsupported,
                format!("cannot copy special file {}", entry.path().display()),
            ));
        }
    }
    Ok(())
}

fn staging_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!(".{name}.ooc-partial-{}", Uuid::new_v4().simple()))
}

fn discard(path: &Path, kind: ItemKind) {
    let result = match kind {
        ItemKind::File => fs::remove_file(path),
        ItemKind::Directory => fs::remove_dir_all(path),
    };
    if let Err(e) = result {
        if e.kind() != ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "could not clean up partial copy");
        }
    }
}

/// Network-flavoured failures mean the share is unreachable, not that the
/// item is bad.
fn classify(e: io::Error, operation: &'static str, path: &Path) -> MoveError {
    match e.kind() {
        ErrorKind::TimedOut
        | ErrorKind::NotConnected
        | ErrorKind::HostUnreachable
        | ErrorKind::NetworkUnreachable
        | ErrorKind::NetworkDown
        | ErrorKind::StaleNetworkFileHandle => MoveError::PathUnreachable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
        _ => MoveError::Io {
            operation,
            path: path.to_path_buf(),
            source: e,
        },
    }
}
