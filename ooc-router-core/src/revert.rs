//! Explicit undo of recorded moves.
//!
//! A revert moves the item from the record's destination back to its source
//! with the same no-overwrite rule as forward moves, then marks the record
//! reverted. It never guesses: if the item is no longer where the ledger says
//! it is, the revert is refused with [`RevertError::RevertBlocked`].

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::activity::{ActivityAction, ActivityEntry, ActivityLog};
use crate::contract::{MoveId, MoveLedger, MoveRecord, MoveStatus};
use crate::error::{MoveError, RevertError};
use crate::events::{EventBus, IntegrityAlert, PipelineEvent};
use crate::mover::{LateCompletion, Mover, ParentPolicy};

#[derive(Clone)]
pub struct RevertManager {
    ledger: Arc<dyn MoveLedger>,
    mover: Mover,
    activity: ActivityLog,
    events: EventBus,
    /// One revert at a time, so the status check and the inverse move of a
    /// record cannot interleave with another revert of the same record.
    gate: Arc<Mutex<()>>,
}

impl RevertManager {
    pub fn new(mover: Mover, activity: ActivityLog, events: EventBus) -> Self {
        Self {
            ledger: Arc::clone(mover.ledger()),
            mover,
            activity,
            events,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Completed moves, most recent first, optionally limited to one job.
    pub async fn list_revertible(&self, job_id: Option<&str>) -> Result<Vec<MoveRecord>, RevertError> {
        let records = match job_id {
            Some(job) => self.ledger.find_by_job(job).await?,
            None => self.ledger.records().await?,
        };
        let mut revertible: Vec<MoveRecord> = records.into_iter().filter(MoveRecord::is_revertible).collect();
        revertible.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(revertible)
    }

    /// Revert one move. Completes synchronously from the caller's view.
    pub async fn revert(&self, move_id: MoveId) -> Result<MoveRecord, RevertError> {
        let _gate = self.gate.lock().await;

        let record = match self.ledger.get(move_id).await {
            Ok(record) => record,
            Err(e) => {
                let e = RevertError::from(e);
                self.record_failure(move_id, None, &e).await;
                return Err(e);
            }
        };

        let result = self.revert_record(&record).await;
        match &result {
            Ok(reverted) => {
                info!(
                    %move_id,
                    pipeline = %reverted.pipeline,
                    restored = %reverted.source_path.display(),
                    "move reverted"
                );
                self.activity
                    .record(revert_entry(ActivityAction::Reverted, reverted, "ok"))
                    .await;
                self.events.publish(PipelineEvent::Reverted {
                    record: reverted.clone(),
                });
            }
            Err(e) => self.record_failure(move_id, Some(&record), e).await,
        }
        result
    }

    /// Revert the most recent revertible move of `job_id`.
    pub async fn revert_latest(&self, job_id: &str) -> Result<MoveRecord, RevertError> {
        let latest = self
            .list_revertible(Some(job_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RevertError::NothingToRevert(job_id.to_string()))?;
        self.revert(latest.move_id).await
    }

    async fn revert_record(&self, record: &MoveRecord) -> Result<MoveRecord, RevertError> {
        if record.status == MoveStatus::Reverted {
            return Err(RevertError::AlreadyReverted(record.move_id));
        }

        // Inverse move: destination -> source. Parents are never created.
        let moved_back = self
            .mover
            .relocate(
                &record.destination_path,
                &record.source_path,
                record.item_kind,
                ParentPolicy::RequireExisting,
                LateCompletion::MarkReverted(record.move_id),
            )
            .await;
        match moved_back {
            Ok(()) => {}
            Err(e @ MoveError::SourceLeftBehind { .. }) => {
                error!(move_id = %record.move_id, error = %e, "item moved back but a copy remains at the destination");
                let alert = IntegrityAlert {
                    raised_at: Utc::now(),
                    pipeline: Some(record.pipeline),
                    move_id: Some(record.move_id),
                    source: record.destination_path.clone(),
                    destination: record.source_path.clone(),
                    code: e.code().to_string(),
                    message: format!(
                        "revert of {} left a partial copy at {}",
                        record.move_id,
                        record.destination_path.display()
                    ),
                };
                self.activity.record_alert(&alert).await;
                self.events.publish(PipelineEvent::IntegrityAlert(alert));
            }
            Err(MoveError::SourceMissing(path) | MoveError::UnexpectedKind { path, .. }) => {
                return Err(RevertError::RevertBlocked {
                    move_id: record.move_id,
                    path,
                })
            }
            Err(e) => return Err(RevertError::Move(e)),
        }

        let source = match self.ledger.mark_reverted(record.move_id).await {
            Ok(reverted) => return Ok(reverted),
            Err(source) => source,
        };
        error!(
            move_id = %record.move_id,
            error = ?source,
            "item moved back but the ledger could not be updated"
        );
        let alert = IntegrityAlert {
            raised_at: Utc::now(),
            pipeline: Some(record.pipeline),
            move_id: Some(record.move_id),
            source: record.destination_path.clone(),
            destination: record.source_path.clone(),
            code: "ledger_inconsistency".to_string(),
            message: format!("revert of {} completed on disk but not in the ledger: {source}", record.move_id),
        };
        self.activity.record_alert(&alert).await;
        self.events.publish(PipelineEvent::IntegrityAlert(alert));
        Err(RevertError::Inconsistent {
            move_id: record.move_id,
            source,
        })
    }

    async fn record_failure(&self, move_id: MoveId, record: Option<&MoveRecord>, e: &RevertError) {
        warn!(%move_id, code = e.code(), error = %e, "revert failed");
        let entry = match record {
            Some(record) => revert_entry(ActivityAction::RevertFailed, record, e.code()),
            None => ActivityEntry::new(ActivityAction::RevertFailed, None, "", e.code()).with_move_id(move_id),
        };
        self.activity.record(entry.with_detail(e.to_string())).await;
    }
}

/// Revert entries read in the direction of the inverse move.
fn revert_entry(action: ActivityAction, record: &MoveRecord, outcome: &str) -> ActivityEntry {
    ActivityEntry::new(action, Some(record.pipeline), &record.destination_path, outcome)
        .with_destination(&record.source_path)
        .with_job(record.job_id.clone())
        .with_move_id(record.move_id)
}
