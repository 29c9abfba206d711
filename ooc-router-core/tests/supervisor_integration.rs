use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

use ooc_router_core::activity::ActivityLog;
use ooc_router_core::config::ScanSettings;
use ooc_router_core::contract::{PipelineKind, TriggerDetector};
use ooc_router_core::error::SupervisorError;
use ooc_router_core::events::PipelineEvent;
use ooc_router_core::ledger::JsonlLedger;
use ooc_router_core::matcher::{MatchRule, RuleSet};
use ooc_router_core::mover::Mover;
use ooc_router_core::scan::PipelineState;
use ooc_router_core::supervisor::ServiceSupervisor;

struct Harness {
    _dir: TempDir,
    upload: PathBuf,
    work: PathBuf,
    supervisor: ServiceSupervisor,
}

async fn harness() -> Harness {
    let dir = tempdir().unwrap();
    let upload = dir.path().join("upload");
    let work = dir.path().join("work");
    fs::create_dir_all(&upload).unwrap();
    fs::create_dir_all(work.join("JOB-1")).unwrap();

    let ledger = JsonlLedger::open(dir.path().join("moves.jsonl")).await.unwrap();
    let activity = ActivityLog::open(dir.path().join("logs")).unwrap();
    let supervisor = ServiceSupervisor::new(Mover::new(Arc::new(ledger)), activity);
    supervisor
        .add_pipeline(
            ScanSettings::new(PipelineKind::UploadRouter, &upload).with_interval(Duration::from_millis(50)),
            RuleSet::compile(&[job_rule(&work)]).unwrap(),
            None,
        )
        .unwrap();

    Harness {
        _dir: dir,
        upload,
        work,
        supervisor,
    }
}

fn job_rule(work: &std::path::Path) -> MatchRule {
    MatchRule::new(r"^JOB-(?P<job>\d+)", format!("{}/JOB-{{job}}", work.display()))
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_started_pipeline_moves_items_until_stopped() {
    let h = harness().await;
    let kind = PipelineKind::UploadRouter;
    assert_eq!(h.supervisor.status(kind).unwrap().state, PipelineState::Stopped);

    h.supervisor.start(kind).unwrap();
    // Starting twice is harmless.
    h.supervisor.start(kind).unwrap();
    fs::write(h.upload.join("JOB-1_a.pdf"), b"a").unwrap();

    wait_for("first move", || h.supervisor.status(kind).unwrap().counters.moved == 1).await;
    assert!(h.work.join("JOB-1/JOB-1_a.pdf").exists());
    assert!(h.supervisor.status(kind).unwrap().state.is_running());

    h.supervisor.stop(kind).unwrap();
    wait_for("stop", || h.supervisor.status(kind).unwrap().state == PipelineState::Stopped).await;

    fs::write(h.upload.join("JOB-1_b.pdf"), b"b").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.upload.join("JOB-1_b.pdf").exists());

    // Restart keeps the cumulative counters.
    h.supervisor.start(kind).unwrap();
    wait_for("second move", || h.supervisor.status(kind).unwrap().counters.moved == 2).await;

    h.supervisor.shutdown().await;
    assert_eq!(h.supervisor.status(kind).unwrap().state, PipelineState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_once_is_refused_while_running() {
    let h = harness().await;
    let kind = PipelineKind::UploadRouter;

    h.supervisor.start(kind).unwrap();
    let err = h.supervisor.run_once(kind).await.unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning(PipelineKind::UploadRouter)));

    h.supervisor.shutdown().await;
    fs::write(h.upload.join("JOB-1_c.pdf"), b"c").unwrap();
    let report = h.supervisor.run_once(kind).await.unwrap();
    assert_eq!(report.moved.len(), 1);
}

#[tokio::test]
async fn test_back_to_back_run_once_calls_queue() {
    let h = harness().await;
    let kind = PipelineKind::UploadRouter;
    fs::write(h.upload.join("JOB-1_d.pdf"), b"d").unwrap();

    let first = h.supervisor.run_once(kind).await.unwrap();
    let second = h.supervisor.run_once(kind).await.unwrap();
    assert_eq!(first.moved.len(), 1);
    assert_eq!(second.examined, 0);
    assert_ne!(first.cycle_id, second.cycle_id);
}

#[tokio::test]
async fn test_unknown_pipeline_is_not_configured() {
    let h = harness().await;
    assert_eq!(h.supervisor.pipelines(), vec![PipelineKind::UploadRouter]);
    assert!(matches!(
        h.supervisor.start(PipelineKind::JobMover),
        Err(SupervisorError::NotConfigured(PipelineKind::JobMover))
    ));
    assert!(matches!(
        h.supervisor.status(PipelineKind::LooseFileClassifier),
        Err(SupervisorError::NotConfigured(_))
    ));
}

#[tokio::test]
async fn test_invalid_reload_keeps_previous_rules() {
    let h = harness().await;
    let kind = PipelineKind::UploadRouter;

    let err = h
        .supervisor
        .reload_rules(kind, &[MatchRule::new("(unclosed", "/nowhere")])
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Rules { .. }));

    fs::write(h.upload.join("JOB-1_e.pdf"), b"e").unwrap();
    let report = h.supervisor.run_once(kind).await.unwrap();
    assert_eq!(report.moved.len(), 1);
}

#[tokio::test]
async fn test_events_are_broadcast_to_subscribers() {
    let h = harness().await;
    let kind = PipelineKind::UploadRouter;
    let mut rx = h.supervisor.subscribe();
    fs::write(h.upload.join("JOB-1_f.pdf"), b"f").unwrap();
    fs::write(h.upload.join("unrelated.pdf"), b"g").unwrap();

    h.supervisor.run_once(kind).await.unwrap();

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind());
        if let PipelineEvent::Moved { record } = &event {
            assert_eq!(record.job_id.as_deref(), Some("1"));
        }
    }
    assert!(kinds.contains(&"moved"));
    assert!(kinds.contains(&"skipped"));
}

/// Trigger that holds the cycle open and records how many cycles overlap.
#[derive(Default)]
struct SlowTrigger {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl TriggerDetector for SlowTrigger {
    fn is_ready(&self, _job_folder: &Path) -> bool {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(400));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        false
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_refuses_new_cycles_until_parked() {
    let h = harness().await;
    let kind = PipelineKind::JobMover;
    let billing = h.work.parent().unwrap().join("billing");
    fs::create_dir_all(&billing).unwrap();
    let trigger = Arc::new(SlowTrigger::default());
    h.supervisor
        .add_pipeline(
            ScanSettings::new(kind, &h.work).with_interval(Duration::from_millis(20)),
            RuleSet::compile(&[MatchRule::new(r"^JOB-(?P<job>\d+)$", billing.display().to_string())]).unwrap(),
            Some(trigger.clone() as Arc<dyn TriggerDetector>),
        )
        .unwrap();

    h.supervisor.start(kind).unwrap();
    wait_for("cycle in flight", || trigger.in_flight.load(Ordering::SeqCst) == 1).await;

    let ((), during) = tokio::join!(h.supervisor.shutdown(), h.supervisor.run_once(kind));
    assert!(matches!(during, Err(SupervisorError::ShuttingDown(PipelineKind::JobMover))));
    assert_eq!(trigger.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(h.supervisor.status(kind).unwrap().state, PipelineState::Stopped);

    // Parked again: a single cycle runs normally.
    let calls = trigger.calls.load(Ordering::SeqCst);
    let report = h.supervisor.run_once(kind).await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(trigger.calls.load(Ordering::SeqCst), calls + 1);
    assert_eq!(trigger.max_in_flight.load(Ordering::SeqCst), 1);
}
