use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::{tempdir, TempDir};
use tokio::sync::watch;

use ooc_router_core::activity::{ActivityAction, ActivityLog, ActivityQuery};
use ooc_router_core::config::ScanSettings;
use ooc_router_core::contract::{MockMoveLedger, MockTriggerDetector, MoveLedger, PipelineKind};
use ooc_router_core::error::LedgerError;
use ooc_router_core::events::{EventBus, PipelineEvent};
use ooc_router_core::ledger::JsonlLedger;
use ooc_router_core::matcher::{MatchRule, RuleBook, RuleSet};
use ooc_router_core::mover::Mover;
use ooc_router_core::scan::{CounterSnapshot, PipelineState, ScanLoop};

struct Fixture {
    dir: TempDir,
    upload: PathBuf,
    work: PathBuf,
    activity: ActivityLog,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let upload = dir.path().join("upload");
        let work = dir.path().join("work");
        fs::create_dir_all(&upload).unwrap();
        fs::create_dir_all(&work).unwrap();
        let activity = ActivityLog::open(dir.path().join("logs")).unwrap();
        Self {
            dir,
            upload,
            work,
            activity,
        }
    }

    fn job_rule(&self) -> RuleSet {
        RuleSet::compile(&[MatchRule::new(
            r"^JOB-(?P<job>\d+)",
            format!("{}/JOB-{{job}}", self.work.display()),
        )])
        .unwrap()
    }

    fn upload_loop(&self, ledger: Arc<dyn MoveLedger>, rules: RuleBook) -> ScanLoop {
        ScanLoop::new(
            ScanSettings::new(PipelineKind::UploadRouter, &self.upload),
            rules,
            Mover::new(ledger),
            self.activity.clone(),
            EventBus::new(),
        )
    }

    async fn ledger(&self) -> Arc<JsonlLedger> {
        Arc::new(JsonlLedger::open(self.dir.path().join("moves.jsonl")).await.unwrap())
    }
}

fn touch(path: &Path, contents: &[u8]) {
    fs::write(path, contents).unwrap();
}

fn counters(scan: &ScanLoop) -> CounterSnapshot {
    scan.monitor().counters()
}

#[tokio::test]
async fn test_cycle_moves_matching_files_and_skips_others() {
    let fx = Fixture::new();
    fs::create_dir(fx.work.join("JOB-1042")).unwrap();
    touch(&fx.upload.join("JOB-1042_invoice.pdf"), b"pdf");
    touch(&fx.upload.join("holiday.jpg"), b"jpg");
    let ledger = fx.ledger().await;

    let mut scan = fx.upload_loop(ledger.clone(), RuleBook::new(fx.job_rule()));
    let report = scan.run_cycle().await;

    assert_eq!(report.examined, 2);
    assert_eq!(report.moved.len(), 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.moved[0].job_id.as_deref(), Some("1042"));
    assert!(fx.work.join("JOB-1042/JOB-1042_invoice.pdf").exists());
    assert!(fx.upload.join("holiday.jpg").exists());
    assert_eq!(
        counters(&scan),
        CounterSnapshot {
            moved: 1,
            skipped: 1,
            errored: 0,
            scan_failures: 0
        }
    );
    assert_eq!(scan.monitor().state(), PipelineState::Stopped);
}

#[tokio::test]
async fn test_back_to_back_idle_cycles_change_nothing() {
    let fx = Fixture::new();
    touch(&fx.upload.join("holiday.jpg"), b"jpg");
    touch(&fx.upload.join("JOB-5_no_folder.pdf"), b"pdf");
    let ledger = fx.ledger().await;

    let mut scan = fx.upload_loop(ledger.clone(), RuleBook::new(fx.job_rule()));
    scan.run_cycle().await;
    let after_first = counters(&scan);
    let ledger_len = ledger.records().await.unwrap().len();

    let second = scan.run_cycle().await;
    assert!(second.moved.is_empty());
    assert_eq!(counters(&scan), after_first);
    assert_eq!(ledger.records().await.unwrap().len(), ledger_len);
    assert_eq!(ledger_len, 0);
}

#[tokio::test]
async fn test_collision_counts_one_error_and_keeps_both_files() {
    let fx = Fixture::new();
    let job = fx.work.join("JOB-9");
    fs::create_dir(&job).unwrap();
    touch(&job.join("JOB-9_a.pdf"), b"existing");
    touch(&fx.upload.join("JOB-9_a.pdf"), b"incoming");

    let mut ledger = MockMoveLedger::new();
    ledger.expect_append().never();
    let mut scan = fx.upload_loop(Arc::new(ledger), RuleBook::new(fx.job_rule()));

    let report = scan.run_cycle().await;
    assert_eq!(report.errored, 1);
    assert_eq!(counters(&scan).errored, 1);

    // Retried next cycle, but not counted again.
    scan.run_cycle().await;
    assert_eq!(counters(&scan).errored, 1);
    assert_eq!(fs::read(fx.upload.join("JOB-9_a.pdf")).unwrap(), b"incoming");
    assert_eq!(fs::read(job.join("JOB-9_a.pdf")).unwrap(), b"existing");

    let errors = fx
        .activity
        .query(&ActivityQuery {
            action: Some(ActivityAction::Error),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].outcome, "destination_collision");
}

#[tokio::test]
async fn test_unreachable_root_is_a_scan_failure_not_a_crash() {
    let fx = Fixture::new();
    let ledger = fx.ledger().await;
    let mut scan = ScanLoop::new(
        ScanSettings::new(PipelineKind::UploadRouter, fx.dir.path().join("offline-share")),
        RuleBook::new(fx.job_rule()),
        Mover::new(ledger),
        fx.activity.clone(),
        EventBus::new(),
    );

    let report = scan.run_cycle().await;
    assert!(report.scan_failed.is_some());
    scan.run_cycle().await;
    assert_eq!(counters(&scan).scan_failures, 2);

    let logged = fx
        .activity
        .query(&ActivityQuery {
            action: Some(ActivityAction::ScanFailed),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(logged.len(), 1);
}

#[tokio::test]
async fn test_reloaded_rules_apply_on_next_cycle() {
    let fx = Fixture::new();
    fs::create_dir(fx.work.join("JOB-3")).unwrap();
    touch(&fx.upload.join("job 3 scan.pdf"), b"pdf");
    let ledger = fx.ledger().await;

    let book = RuleBook::new(fx.job_rule());
    let mut scan = fx.upload_loop(ledger, book.clone());
    assert_eq!(scan.run_cycle().await.skipped, 1);

    book.replace(
        RuleSet::compile(&[MatchRule::new(
            r"(?i)^job (?P<job>\d+)",
            format!("{}/JOB-{{job}}", fx.work.display()),
        )])
        .unwrap(),
    );
    let report = scan.run_cycle().await;
    assert_eq!(report.moved.len(), 1);
    assert!(fx.work.join("JOB-3/job 3 scan.pdf").exists());
}

#[tokio::test]
async fn test_ledger_failure_raises_integrity_alert() {
    let fx = Fixture::new();
    fs::create_dir(fx.work.join("JOB-4")).unwrap();
    touch(&fx.upload.join("JOB-4.pdf"), b"pdf");

    let mut ledger = MockMoveLedger::new();
    ledger.expect_append().times(1).returning(|_| {
        Err(LedgerError::Write {
            path: PathBuf::from("moves.jsonl"),
            source: std::io::Error::other("read-only filesystem"),
        })
    });
    let events = EventBus::new();
    let mut rx = events.subscribe();
    let mut scan = ScanLoop::new(
        ScanSettings::new(PipelineKind::UploadRouter, &fx.upload),
        RuleBook::new(fx.job_rule()),
        Mover::new(Arc::new(ledger)),
        fx.activity.clone(),
        events,
    );

    let report = scan.run_cycle().await;
    assert_eq!(report.errored, 1);
    assert_eq!(counters(&scan).errored, 1);
    let alerts = fx.activity.integrity_alerts().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].outcome, "ledger_inconsistency");

    let mut saw_alert = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, PipelineEvent::IntegrityAlert(_)) {
            saw_alert = true;
        }
    }
    assert!(saw_alert);
}

#[tokio::test]
async fn test_job_mover_waits_for_trigger() {
    let fx = Fixture::new();
    let billing = fx.dir.path().join("billing");
    fs::create_dir(&billing).unwrap();
    fs::create_dir(fx.work.join("JOB-1")).unwrap();
    fs::create_dir(fx.work.join("Upload_ooc")).unwrap();
    let ledger = fx.ledger().await;

    let mut trigger = MockTriggerDetector::new();
    let mut ready = vec![true, false];
    trigger
        .expect_is_ready()
        .times(2)
        .returning(move |_| ready.pop().unwrap_or(false));

    let rules = RuleSet::compile(&[MatchRule::new(
        r"^JOB-(?P<job>\d+)$",
        billing.display().to_string(),
    )])
    .unwrap();
    let mut scan = ScanLoop::new(
        ScanSettings::new(PipelineKind::JobMover, &fx.work).with_exclude(["Upload_ooc"]),
        RuleBook::new(rules),
        Mover::new(ledger).with_destination_roots(vec![billing.clone()]),
        fx.activity.clone(),
        EventBus::new(),
    )
    .with_trigger(Arc::new(trigger));

    let first = scan.run_cycle().await;
    assert_eq!(first.examined, 1);
    assert_eq!(first.skipped, 1);
    assert!(fx.work.join("JOB-1").exists());

    let second = scan.run_cycle().await;
    assert_eq!(second.moved.len(), 1);
    assert!(billing.join("JOB-1").is_dir());
    assert!(fx.work.join("Upload_ooc").exists());
}

#[tokio::test]
async fn test_run_honours_stop_between_cycles() {
    let fx = Fixture::new();
    let ledger = fx.ledger().await;
    let scan = fx.upload_loop(ledger, RuleBook::new(fx.job_rule()));
    let monitor = scan.monitor();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(scan.run(stop_rx));

    tokio::time::timeout(Duration::from_secs(5), async {
        while monitor.state() == PipelineState::Stopped {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("loop starts");

    stop_tx.send(true).unwrap();
    let scan = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("loop stops promptly")
        .expect("task joins");
    assert_eq!(scan.monitor().state(), PipelineState::Stopped);
}
