//! # supervisor: lifecycle of the three pipelines
//!
//! [`ServiceSupervisor`] owns one [`ScanLoop`] per configured pipeline and is
//! the whole control surface a dashboard or CLI needs: `start`, `stop`,
//! `status`, `run_once`, `reload_rules`, `list_revertible`, `revert`, plus an
//! event stream and the integrity alert list.
//!
//! `start` and `stop` return immediately. A stop is a request: the loop
//! finishes its current cycle before it parks. Starting a pipeline that is
//! still stopping queues the new run behind the old one, so two cycles of one
//! pipeline never overlap.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::activity::{ActivityEntry, ActivityLog};
use crate::config::{RouterConfig, ScanSettings};
use crate::contract::{MoveId, MoveLedger, MoveRecord, PipelineKind, TriggerDetector};
use crate::error::{RevertError, SupervisorError};
use crate::events::{EventBus, PipelineEvent};
use crate::ledger::JsonlLedger;
use crate::matcher::{MatchRule, RuleBook, RuleSet};
use crate::mover::Mover;
use crate::revert::RevertManager;
use crate::scan::{CycleReport, PipelineMonitor, PipelineState, PipelineStatus, ScanLoop};
use crate::trigger::MarkerTrigger;

enum LoopState {
    Parked(ScanLoop),
    Active {
        stop: watch::Sender<bool>,
        task: JoinHandle<ScanLoop>,
    },
    /// `shutdown` is waiting for the loop's in-flight cycle.
    ShuttingDown,
    /// Only observed while the slot lock is held.
    Vacant,
}

struct Slot {
    monitor: Arc<PipelineMonitor>,
    rules: RuleBook,
    spare: ScanLoop,
    state: LoopState,
}

pub struct ServiceSupervisor {
    mover: Mover,
    activity: ActivityLog,
    events: EventBus,
    revert: RevertManager,
    slots: Mutex<BTreeMap<PipelineKind, Slot>>,
}

impl ServiceSupervisor {
    /// A supervisor with no pipelines; add them with [`Self::add_pipeline`].
    pub fn new(mover: Mover, activity: ActivityLog) -> Self {
        let events = EventBus::new();
        Self {
            revert: RevertManager::new(mover.clone(), activity.clone(), events.clone()),
            mover,
            activity,
            events,
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open the ledger and activity log and register all three pipelines.
    pub async fn from_config(config: &RouterConfig) -> Result<Self, SupervisorError> {
        let ledger = JsonlLedger::open(&config.ledger_path).await?;
        let activity = ActivityLog::open(&config.log_dir)?;
        let mover = Mover::new(Arc::new(ledger))
            .with_timeout(config.operation_timeout())
            .with_destination_roots(config.destination_roots());
        let supervisor = Self::new(mover, activity);

        for kind in PipelineKind::ALL {
            let rules = RuleSet::compile(config.rules(kind))
                .map_err(|source| SupervisorError::Rules { pipeline: kind, source })?;
            let trigger = match kind {
                PipelineKind::JobMover => Some(
                    Arc::new(MarkerTrigger::from_config(&config.job_mover.trigger)) as Arc<dyn TriggerDetector>,
                ),
                _ => None,
            };
            supervisor.add_pipeline(config.scan_settings(kind), rules, trigger)?;
        }
        Ok(supervisor)
    }

    /// Register (or replace) a pipeline. Fails if it is currently running.
    pub fn add_pipeline(
        &self,
        settings: ScanSettings,
        rules: RuleSet,
        trigger: Option<Arc<dyn TriggerDetector>>,
    ) -> Result<(), SupervisorError> {
        let kind = settings.kind;
        let mut slots = self.lock_slots();
        match slots.get(&kind).map(|slot| &slot.state) {
            Some(LoopState::Active { task, .. }) if !task.is_finished() => {
                return Err(SupervisorError::AlreadyRunning(kind));
            }
            Some(LoopState::ShuttingDown) => return Err(SupervisorError::ShuttingDown(kind)),
            _ => {}
        }

        let book = RuleBook::new(rules);
        let mut scan_loop = ScanLoop::new(
            settings,
            book.clone(),
            self.mover.clone(),
            self.activity.clone(),
            self.events.clone(),
        );
        if let Some(trigger) = trigger {
            scan_loop = scan_loop.with_trigger(trigger);
        }
        debug!(pipeline = %kind, rules = book.snapshot().len(), "pipeline registered");

        slots.insert(
            kind,
            Slot {
                monitor: scan_loop.monitor(),
                rules: book,
                spare: scan_loop.fresh_copy(),
                state: LoopState::Parked(scan_loop),
            },
        );
        Ok(())
    }

    pub fn pipelines(&self) -> Vec<PipelineKind> {
        self.lock_slots().keys().copied().collect()
    }

    /// Start the pipeline's loop. Starting a running pipeline is a no-op.
    pub fn start(&self, kind: PipelineKind) -> Result<(), SupervisorError> {
        let mut slots = self.lock_slots();
        let slot = slots.get_mut(&kind).ok_or(SupervisorError::NotConfigured(kind))?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = match std::mem::replace(&mut slot.state, LoopState::Vacant) {
            LoopState::Active { stop, task } if !*stop.borrow() && !task.is_finished() => {
                slot.state = LoopState::Active { stop, task };
                debug!(pipeline = %kind, "pipeline already running");
                return Ok(());
            }
            LoopState::Active { task, .. } => {
                // Still finishing a cycle: run again once it has parked.
                let fallback = slot.spare.fresh_copy();
                tokio::spawn(async move {
                    let scan_loop = recover(kind, task.await, fallback);
                    scan_loop.run(stop_rx).await
                })
            }
            LoopState::Parked(scan_loop) => tokio::spawn(scan_loop.run(stop_rx)),
            LoopState::Vacant => tokio::spawn(slot.spare.fresh_copy().run(stop_rx)),
            LoopState::ShuttingDown => {
                slot.state = LoopState::ShuttingDown;
                return Err(SupervisorError::ShuttingDown(kind));
            }
        };

        slot.state = LoopState::Active { stop: stop_tx, task };
        info!(pipeline = %kind, "pipeline start requested");
        Ok(())
    }

    /// Ask the pipeline to stop after its current cycle.
    pub fn stop(&self, kind: PipelineKind) -> Result<(), SupervisorError> {
        let slots = self.lock_slots();
        let slot = slots.get(&kind).ok_or(SupervisorError::NotConfigured(kind))?;
        if let LoopState::Active { stop, task } = &slot.state {
            self.request_stop(kind, slot, stop, task);
        }
        Ok(())
    }

    pub fn start_all(&self) -> Result<(), SupervisorError> {
        for kind in self.pipelines() {
            self.start(kind)?;
        }
        Ok(())
    }

    pub fn stop_all(&self) -> Result<(), SupervisorError> {
        for kind in self.pipelines() {
            self.stop(kind)?;
        }
        Ok(())
    }

    pub fn status(&self, kind: PipelineKind) -> Result<PipelineStatus, SupervisorError> {
        let slots = self.lock_slots();
        let slot = slots.get(&kind).ok_or(SupervisorError::NotConfigured(kind))?;
        Ok(slot.monitor.status())
    }

    pub fn statuses(&self) -> Vec<PipelineStatus> {
        self.lock_slots().values().map(|slot| slot.monitor.status()).collect()
    }

    /// Swap the pipeline's rules; a running loop uses them from its next cycle.
    pub fn reload_rules(&self, kind: PipelineKind, rules: &[MatchRule]) -> Result<(), SupervisorError> {
        let compiled =
            RuleSet::compile(rules).map_err(|source| SupervisorError::Rules { pipeline: kind, source })?;
        let slots = self.lock_slots();
        let slot = slots.get(&kind).ok_or(SupervisorError::NotConfigured(kind))?;
        info!(pipeline = %kind, rules = compiled.len(), "rules reloaded");
        slot.rules.replace(compiled);
        Ok(())
    }

    /// Run a single cycle of a pipeline that is not running. A pipeline that
    /// is stopping (or finishing an earlier `run_once`) is waited for.
    pub async fn run_once(&self, kind: PipelineKind) -> Result<CycleReport, SupervisorError> {
        let (report_tx, report_rx) = oneshot::channel();
        {
            let mut slots = self.lock_slots();
            let slot = slots.get_mut(&kind).ok_or(SupervisorError::NotConfigured(kind))?;
            let task = match std::mem::replace(&mut slot.state, LoopState::Vacant) {
                LoopState::Parked(scan_loop) => tokio::spawn(single_cycle(scan_loop, report_tx)),
                LoopState::Vacant => tokio::spawn(single_cycle(slot.spare.fresh_copy(), report_tx)),
                LoopState::Active { stop, task } if *stop.borrow() || task.is_finished() => {
                    let fallback = slot.spare.fresh_copy();
                    tokio::spawn(async move {
                        let scan_loop = recover(kind, task.await, fallback);
                        single_cycle(scan_loop, report_tx).await
                    })
                }
                active @ LoopState::Active { .. } => {
                    slot.state = active;
                    return Err(SupervisorError::AlreadyRunning(kind));
                }
                LoopState::ShuttingDown => {
                    slot.state = LoopState::ShuttingDown;
                    return Err(SupervisorError::ShuttingDown(kind));
                }
            };

            // The stop flag is already set: a later `start` queues behind this.
            let (stop, _) = watch::channel(true);
            slot.state = LoopState::Active { stop, task };
        }
        report_rx.await.map_err(|_| SupervisorError::TaskFailed(kind))
    }

    /// Stop every pipeline and wait for in-flight cycles to finish. Until
    /// then `start` and `run_once` are refused with
    /// [`SupervisorError::ShuttingDown`].
    pub async fn shutdown(&self) {
        let active: Vec<(PipelineKind, JoinHandle<ScanLoop>, ScanLoop)> = {
            let mut slots = self.lock_slots();
            let mut active = Vec::new();
            for (&kind, slot) in slots.iter_mut() {
                match std::mem::replace(&mut slot.state, LoopState::ShuttingDown) {
                    LoopState::Active { stop, task } => {
                        self.request_stop(kind, slot, &stop, &task);
                        active.push((kind, task, slot.spare.fresh_copy()));
                    }
                    other => slot.state = other,
                }
            }
            active
        };

        let parked = join_all(
            active
                .into_iter()
                .map(|(kind, task, fallback)| async move { (kind, recover(kind, task.await, fallback)) }),
        )
        .await;

        let mut slots = self.lock_slots();
        for (kind, scan_loop) in parked {
            if let Some(slot) = slots.get_mut(&kind) {
                if matches!(slot.state, LoopState::ShuttingDown) {
                    slot.state = LoopState::Parked(scan_loop);
                }
            }
        }
        info!("all pipelines stopped");
    }

    pub async fn list_revertible(&self, job_id: Option<&str>) -> Result<Vec<MoveRecord>, RevertError> {
        self.revert.list_revertible(job_id).await
    }

    pub async fn revert(&self, move_id: MoveId) -> Result<MoveRecord, RevertError> {
        self.revert.revert(move_id).await
    }

    pub async fn revert_latest(&self, job_id: &str) -> Result<MoveRecord, RevertError> {
        self.revert.revert_latest(job_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Persisted integrity alerts, oldest first.
    pub fn integrity_alerts(&self) -> Result<Vec<ActivityEntry>, SupervisorError> {
        Ok(self.activity.integrity_alerts()?)
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub fn ledger(&self) -> &Arc<dyn MoveLedger> {
        self.mover.ledger()
    }

    fn request_stop(&self, kind: PipelineKind, slot: &Slot, stop: &watch::Sender<bool>, task: &JoinHandle<ScanLoop>) {
        if task.is_finished() || stop.send_replace(true) {
            return;
        }
        if slot.monitor.transition(PipelineState::Idle, PipelineState::Stopping)
            || slot.monitor.transition(PipelineState::Scanning, PipelineState::Stopping)
        {
            self.events.publish(PipelineEvent::StateChanged {
                pipeline: kind,
                state: PipelineState::Stopping,
            });
        }
        info!(pipeline = %kind, "pipeline stop requested");
    }

    fn lock_slots(&self) -> MutexGuard<'_, BTreeMap<PipelineKind, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn single_cycle(mut scan_loop: ScanLoop, report: oneshot::Sender<CycleReport>) -> ScanLoop {
    let _ = report.send(scan_loop.run_cycle().await);
    scan_loop
}

/// Loop handed back by a finished task, or `fallback` if the task panicked.
fn recover(kind: PipelineKind, result: Result<ScanLoop, JoinError>, fallback: ScanLoop) -> ScanLoop {
    match result {
        Ok(scan_loop) => scan_loop,
        Err(e) => {
            error!(pipeline = %kind, error = %e, "pipeline task failed; restarting from a fresh loop");
            fallback.monitor().set_state(PipelineState::Stopped);
            fallback
        }
    }
}
