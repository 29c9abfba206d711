//! # scan: periodic scan loops
//!
//! One [`ScanLoop`] per pipeline. A cycle lists the pipeline's source root,
//! matches every candidate against the current rules, asks the trigger (job
//! mover only), and hands each resulting move to the [`Mover`], one item at a
//! time. Cycles of one loop never overlap; stop requests are only honoured
//! between cycles, so a move in flight always completes or fails first.
//!
//! A cycle is split in two phases:
//!
//! 1. *planning* (blocking pool, under the listing timeout): root check,
//!    listing, matching, trigger and job-folder lookup. Read-only.
//! 2. *execution*: each planned move goes through the mover, and outcomes
//!    are counted, logged and published.
//!
//! Per-item failures never abort a cycle. A failing or unmatched item stays
//! where it is and is retried next cycle, but its outcome is only counted the
//! first time it is seen (see [`PipelineCounters`]).

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::activity::{ActivityAction, ActivityEntry, ActivityLog};
use crate::config::ScanSettings;
use crate::contract::{MoveRecord, PipelineKind, TriggerDetector};
use crate::error::MoveError;
use crate::events::{EventBus, IntegrityAlert, PipelineEvent};
use crate::matcher::{RuleBook, RuleSet};
use crate::mover::{MoveRequest, Mover};

/// Lifecycle of a pipeline.
///
/// `Stopped -> Idle <-> Scanning`, and `Idle | Scanning -> Stopping -> Stopped`
/// on a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Stopped,
    Idle,
    Scanning,
    Stopping,
}

impl PipelineState {
    const fn to_u8(self) -> u8 {
        match self {
            PipelineState::Stopped => 0,
            PipelineState::Idle => 1,
            PipelineState::Scanning => 2,
            PipelineState::Stopping => 3,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::Idle,
            2 => PipelineState::Scanning,
            3 => PipelineState::Stopping,
            _ => PipelineState::Stopped,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Idle => "idle",
            PipelineState::Scanning => "scanning",
            PipelineState::Stopping => "stopping",
        }
    }

    /// Running means a loop task exists and has not been asked to stop.
    pub const fn is_running(self) -> bool {
        matches!(self, PipelineState::Idle | PipelineState::Scanning)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative per-pipeline counters, reset only by a process restart.
///
/// Only the owning loop increments them; anyone may read them without
/// blocking. `skipped` and `errored` count an item once per distinct outcome
/// while it stays in the source listing, so idle cycles leave them unchanged.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    moved: AtomicU64,
    skipped: AtomicU64,
    errored: AtomicU64,
    scan_failures: AtomicU64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            moved: self.moved.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub moved: u64,
    pub skipped: u64,
    pub errored: u64,
    pub scan_failures: u64,
}

/// Shared, lock-free view of one pipeline's state and counters.
#[derive(Debug)]
pub struct PipelineMonitor {
    kind: PipelineKind,
    state: AtomicU8,
    counters: PipelineCounters,
}

impl PipelineMonitor {
    pub fn new(kind: PipelineKind) -> Self {
        Self {
            kind,
            state: AtomicU8::new(PipelineState::Stopped.to_u8()),
            counters: PipelineCounters::default(),
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.kind
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            pipeline: self.kind,
            state: self.state(),
            counters: self.counters(),
        }
    }

    pub(crate) fn set_state(&self, state: PipelineState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Compare-and-swap, so a concurrent stop request is never overwritten.
    pub(crate) fn transition(&self, from: PipelineState, to: PipelineState) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What `status(pipeline)` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub pipeline: PipelineKind,
    pub state: PipelineState,
    pub counters: CounterSnapshot,
}

/// Why an item was left where it is without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoMatchingRule,
    AwaitingTrigger,
    NoJobFolder,
    AlreadyInPlace,
}

impl SkipReason {
    pub const fn code(self) -> &'static str {
        match self {
            SkipReason::NoMatchingRule => "no_matching_rule",
            SkipReason::AwaitingTrigger => "awaiting_trigger",
            SkipReason::NoJobFolder => "no_job_folder",
            SkipReason::AlreadyInPlace => "already_in_place",
        }
    }
}

/// Outcome of one cycle. Item counts describe what this cycle observed;
/// the cumulative counters may not change for outcomes already counted.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub pipeline: PipelineKind,
    pub examined: usize,
    pub moved: Vec<MoveRecord>,
    pub skipped: usize,
    pub errored: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_failed: Option<String>,
}

impl CycleReport {
    fn new(pipeline: PipelineKind) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            pipeline,
            examined: 0,
            moved: Vec::new(),
            skipped: 0,
            errored: 0,
            scan_failed: None,
        }
    }
}

#[derive(Debug)]
struct Candidate {
    path: PathBuf,
    name: String,
    container: PathBuf,
}

#[derive(Debug)]
enum Plan {
    Move(MoveRequest),
    Skip {
        reason: SkipReason,
        job_id: Option<String>,
    },
    Fail {
        error: MoveError,
        job_id: Option<String>,
    },
}

#[derive(Debug)]
struct PlannedItem {
    path: PathBuf,
    plan: Plan,
}

/// Periodic scanner for one pipeline.
pub struct ScanLoop {
    settings: ScanSettings,
    rules: RuleBook,
    mover: Mover,
    trigger: Option<Arc<dyn TriggerDetector>>,
    activity: ActivityLog,
    events: EventBus,
    monitor: Arc<PipelineMonitor>,
    /// Last counted outcome per item path still present in the source.
    seen: HashMap<PathBuf, String>,
    last_scan_failure: Option<String>,
}

impl ScanLoop {
    pub fn new(
        settings: ScanSettings,
        rules: RuleBook,
        mover: Mover,
        activity: ActivityLog,
        events: EventBus,
    ) -> Self {
        let monitor = Arc::new(PipelineMonitor::new(settings.kind));
        Self {
            settings,
            rules,
            mover,
            trigger: None,
            activity,
            events,
            monitor,
            seen: HashMap::new(),
            last_scan_failure: None,
        }
    }

    /// Required for the job mover: folders only move once ready.
    pub fn with_trigger(mut self, trigger: Arc<dyn TriggerDetector>) -> Self {
        self.trigger = Some(trigger);
        self
    }

    pub fn kind(&self) -> PipelineKind {
        self.settings.kind
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    pub fn monitor(&self) -> Arc<PipelineMonitor> {
        Arc::clone(&self.monitor)
    }

    /// Same pipeline and monitor, no per-item memory. Used to replace a loop
    /// whose task panicked.
    pub(crate) fn fresh_copy(&self) -> ScanLoop {
        ScanLoop {
            settings: self.settings.clone(),
            rules: self.rules.clone(),
            mover: self.mover.clone(),
            trigger: self.trigger.clone(),
            activity: self.activity.clone(),
            events: self.events.clone(),
            monitor: Arc::clone(&self.monitor),
            seen: HashMap::new(),
            last_scan_failure: None,
        }
    }

    /// Run cycles until `stop` turns true (or its sender is dropped), then
    /// hand the loop back so it can be restarted with its memory intact.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Self {
        let kind = self.kind();
        if self.monitor.transition(PipelineState::Stopped, PipelineState::Idle) {
            self.publish_state(PipelineState::Idle);
        }
        info!(pipeline = %kind, interval = ?self.settings.interval, "pipeline started");

        loop {
            if *stop.borrow() {
                break;
            }
            self.run_cycle().await;
            if *stop.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }

        self.monitor.set_state(PipelineState::Stopped);
        self.publish_state(PipelineState::Stopped);
        info!(pipeline = %kind, "pipeline stopped");
        self
    }

    /// Run exactly one cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let report = CycleReport::new(self.kind());
        let span = info_span!("scan_cycle", pipeline = %self.kind(), cycle_id = %report.cycle_id);

        let previous = self.monitor.state();
        let entered = previous != PipelineState::Stopping
            && previous != PipelineState::Scanning
            && self.monitor.transition(previous, PipelineState::Scanning);
        if entered {
            self.publish_state(PipelineState::Scanning);
        }

        let report = self.cycle(report).instrument(span).await;

        if entered && self.monitor.transition(PipelineState::Scanning, previous) {
            self.publish_state(previous);
        }
        report
    }

    async fn cycle(&mut self, mut report: CycleReport) -> CycleReport {
        let rules = self.rules.snapshot();
        let planned = match self.plan(rules).await {
            Ok(planned) => planned,
            Err(e) => {
                self.on_scan_failure(&e, &mut report).await;
                return report;
            }
        };
        if self.last_scan_failure.take().is_some() {
            info!(pipeline = %self.kind(), "source root reachable again");
        }

        report.examined = planned.len();
        let listed: HashSet<PathBuf> = planned.iter().map(|item| item.path.clone()).collect();

        for item in planned {
            match item.plan {
                Plan::Move(request) => {
                    let destination = request.destination_path.clone();
                    let job_id = request.job_id.clone();
                    match self.mover.move_item(request).await {
                        Ok(record) => self.on_moved(&item.path, record, &mut report).await,
                        Err(error) => {
                            self.on_error(&item.path, Some(destination), job_id, error, &mut report)
                                .await
                        }
                    }
                }
                Plan::Skip { reason, job_id } => {
                    self.on_skip(&item.path, reason, job_id, &mut report).await
                }
                Plan::Fail { error, job_id } => {
                    self.on_error(&item.path, None, job_id, error, &mut report).await
                }
            }
        }

        self.seen.retain(|path, _| listed.contains(path));
        debug!(
            examined = report.examined,
            moved = report.moved.len(),
            skipped = report.skipped,
            errored = report.errored,
            "cycle finished"
        );
        report
    }

    async fn plan(&self, rules: Arc<RuleSet>) -> Result<Vec<PlannedItem>, MoveError> {
        let settings = self.settings.clone();
        let trigger = self.trigger.clone();
        let timeout = settings.listing_timeout;
        let root = settings.source_root.clone();

        let task = tokio::task::spawn_blocking(move || plan_blocking(&settings, &rules, trigger.as_deref()));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(MoveError::Io {
                operation: "list source",
                path: root,
                source: io::Error::other(join.to_string()),
            }),
            Err(_) => Err(MoveError::PathUnreachable {
                path: root,
                reason: format!("listing did not finish within {timeout:?}"),
            }),
        }
    }

    async fn on_moved(&mut self, path: &Path, record: MoveRecord, report: &mut CycleReport) {
        self.seen.remove(path);
        PipelineCounters::bump(&self.monitor.counters.moved);
        self.activity
            .record(ActivityEntry::for_record(ActivityAction::Moved, &record))
            .await;
        self.events.publish(PipelineEvent::Moved {
            record: record.clone(),
        });
        report.moved.push(record);
    }

    async fn on_skip(
        &mut self,
        path: &Path,
        reason: SkipReason,
        job_id: Option<String>,
        report: &mut CycleReport,
    ) {
        report.skipped += 1;
        if !self.remember(path, format!("skip:{}", reason.code())) {
            return;
        }
        PipelineCounters::bump(&self.monitor.counters.skipped);
        info!(source = %path.display(), reason = reason.code(), "skipped");
        self.activity
            .record(
                ActivityEntry::new(ActivityAction::Skipped, Some(self.kind()), path, reason.code())
                    .with_job(job_id),
            )
            .await;
        self.events.publish(PipelineEvent::Skipped {
            pipeline: self.kind(),
            source: path.to_path_buf(),
            reason: reason.code().to_string(),
        });
    }

    async fn on_error(
        &mut self,
        path: &Path,
        destination: Option<PathBuf>,
        job_id: Option<String>,
        error: MoveError,
        report: &mut CycleReport,
    ) {
        report.errored += 1;
        let message = error_chain(&error);

        if let Some((source_path, destination_path, move_id)) = error.integrity_subject() {
            PipelineCounters::bump(&self.monitor.counters.errored);
            self.seen.remove(path);
            error!(
                source = %source_path.display(),
                destination = %destination_path.display(),
                code = error.code(),
                error = %message,
                "integrity alert: disk and ledger need operator attention"
            );
            let alert = IntegrityAlert {
                raised_at: Utc::now(),
                pipeline: Some(self.kind()),
                move_id,
                source: source_path.to_path_buf(),
                destination: destination_path.to_path_buf(),
                code: error.code().to_string(),
                message: message.clone(),
            };
            self.activity.record_alert(&alert).await;
            self.events.publish(PipelineEvent::IntegrityAlert(alert));
            return;
        }

        if !self.remember(path, format!("error:{}", error.code())) {
            debug!(source = %path.display(), error = %message, "still failing");
            return;
        }
        PipelineCounters::bump(&self.monitor.counters.errored);
        warn!(
            source = %path.display(),
            code = error.code(),
            retryable = error.is_retryable(),
            error = %message,
            "move failed"
        );
        let mut entry = ActivityEntry::new(ActivityAction::Error, Some(self.kind()), path, error.code())
            .with_job(job_id)
            .with_detail(message.clone());
        if let Some(destination) = destination {
            entry = entry.with_destination(destination);
        }
        self.activity.record(entry).await;
        self.events.publish(PipelineEvent::Errored {
            pipeline: self.kind(),
            source: path.to_path_buf(),
            error: message,
        });
    }

    async fn on_scan_failure(&mut self, error: &MoveError, report: &mut CycleReport) {
        let message = error_chain(error);
        PipelineCounters::bump(&self.monitor.counters.scan_failures);
        report.scan_failed = Some(message.clone());

        if self.last_scan_failure.as_deref() == Some(message.as_str()) {
            debug!(error = %message, "source still unavailable");
            return;
        }
        warn!(root = %self.settings.source_root.display(), error = %message, "scan failed, retrying next cycle");
        self.activity
            .record(
                ActivityEntry::new(
                    ActivityAction::ScanFailed,
                    Some(self.kind()),
                    &self.settings.source_root,
                    error.code(),
                )
                .with_detail(message.clone()),
            )
            .await;
        self.events.publish(PipelineEvent::ScanFailed {
            pipeline: self.kind(),
            error: message.clone(),
        });
        self.last_scan_failure = Some(message);
    }

    /// Records `outcome` for `path`; true if it differs from the last one.
    fn remember(&mut self, path: &Path, outcome: String) -> bool {
        match self.seen.get(path) {
            Some(previous) if *previous == outcome => false,
            _ => {
                self.seen.insert(path.to_path_buf(), outcome);
                true
            }
        }
    }

    fn publish_state(&self, state: PipelineState) {
        self.events.publish(PipelineEvent::StateChanged {
            pipeline: self.kind(),
            state,
        });
    }
}

fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn plan_blocking(
    settings: &ScanSettings,
    rules: &RuleSet,
    trigger: Option<&dyn TriggerDetector>,
) -> Result<Vec<PlannedItem>, MoveError> {
    let root = &settings.source_root;
    match fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(MoveError::PathUnreachable {
                path: root.clone(),
                reason: "source root is not a directory".to_string(),
            })
        }
        Err(e) => {
            return Err(MoveError::PathUnreachable {
                path: root.clone(),
                reason: e.to_string(),
            })
        }
    }

    let candidates = list_candidates(settings).map_err(|source| MoveError::Io {
        operation: "list source",
        path: root.clone(),
        source,
    })?;

    Ok(candidates
        .into_iter()
        .map(|candidate| PlannedItem {
            plan: plan_item(settings.kind, &candidate, rules, trigger),
            path: candidate.path,
        })
        .collect())
}

fn list_candidates(settings: &ScanSettings) -> io::Result<Vec<Candidate>> {
    let root = &settings.source_root;
    let mut candidates = Vec::new();
    match settings.kind {
        PipelineKind::UploadRouter => {
            for (name, path, file_type) in list_dir(root)? {
                if file_type.is_file() && is_candidate_file(settings, &name) {
                    candidates.push(Candidate {
                        path,
                        name,
                        container: root.clone(),
                    });
                }
            }
        }
        PipelineKind::JobMover => {
            for (name, path, file_type) in list_dir(root)? {
                if file_type.is_dir() && !settings.is_excluded(&name) && !is_hidden(&name) {
                    candidates.push(Candidate {
                        path,
                        name,
                        container: root.clone(),
                    });
                }
            }
        }
        PipelineKind::LooseFileClassifier => {
            for (company, company_path, file_type) in list_dir(root)? {
                if !file_type.is_dir() || settings.is_excluded(&company) || is_hidden(&company) {
                    continue;
                }
                let entries = match list_dir(&company_path) {
                    Ok(entries) => entries,
                    Err(e) => {
                        warn!(folder = %company_path.display(), error = %e, "cannot list company folder");
                        continue;
                    }
                };
                for (name, path, file_type) in entries {
                    if file_type.is_file() && is_candidate_file(settings, &name) {
                        candidates.push(Candidate {
                            path,
                            name,
                            container: company_path.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(candidates)
}

/// Entries of `dir` sorted by name, so cycles process items in a stable order.
fn list_dir(dir: &Path) -> io::Result<Vec<(String, PathBuf, fs::FileType)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warn!(name = ?raw, "skipping entry with non UTF-8 name");
                continue;
            }
        };
        entries.push((name, entry.path(), entry.file_type()?));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Office lock files (`~$x.docx`) and hidden files are never routed.
fn is_hidden(name: &str) -> bool {
    name.starts_with('.') || name.starts_with("~$")
}

fn is_candidate_file(settings: &ScanSettings, name: &str) -> bool {
    !is_hidden(name) && !settings.is_excluded(name) && settings.accepts_extension(name)
}

fn plan_item(
    kind: PipelineKind,
    candidate: &Candidate,
    rules: &RuleSet,
    trigger: Option<&dyn TriggerDetector>,
) -> Plan {
    let Some(found) = rules.match_name(&candidate.name) else {
        return Plan::Skip {
            reason: SkipReason::NoMatchingRule,
            job_id: None,
        };
    };
    let job_id = Some(found.job_id.clone());

    let mut destination_dir = if found.destination_path.is_absolute() {
        found.destination_path
    } else {
        candidate.container.join(&found.destination_path)
    };

    match kind {
        PipelineKind::JobMover => {
            if let Some(trigger) = trigger {
                if !trigger.is_ready(&candidate.path) {
                    return Plan::Skip {
                        reason: SkipReason::AwaitingTrigger,
                        job_id,
                    };
                }
            }
        }
        PipelineKind::UploadRouter | PipelineKind::LooseFileClassifier => {
            if !destination_dir.is_dir() {
                match find_job_folder(&destination_dir, &found.job_id) {
                    Some(folder) => destination_dir = folder,
                    None if kind == PipelineKind::LooseFileClassifier => {
                        return Plan::Skip {
                            reason: SkipReason::NoJobFolder,
                            job_id,
                        }
                    }
                    None => {
                        return Plan::Fail {
                            error: MoveError::DestinationParentMissing(destination_dir),
                            job_id,
                        }
                    }
                }
            }
        }
    }

    let destination_path = destination_dir.join(&candidate.name);
    if destination_path == candidate.path {
        return Plan::Skip {
            reason: SkipReason::AlreadyInPlace,
            job_id,
        };
    }

    Plan::Move(MoveRequest {
        pipeline: kind,
        source_path: candidate.path.clone(),
        destination_path,
        item_kind: kind.item_kind(),
        job_id,
    })
}

/// Sibling folder of the rendered destination whose name contains the job id,
/// compared case-insensitively; the first in name order wins.
fn find_job_folder(rendered: &Path, job_id: &str) -> Option<PathBuf> {
    let parent = rendered.parent()?;
    let needle = job_id.to_uppercase();
    let found = list_dir(parent)
        .ok()?
        .into_iter()
        .find(|(name, _, file_type)| file_type.is_dir() && name.to_uppercase().contains(&needle))
        .map(|(_, path, _)| path);
    if let Some(path) = &found {
        debug!(job_id, folder = %path.display(), "matched job folder by name");
    }
    found
}
