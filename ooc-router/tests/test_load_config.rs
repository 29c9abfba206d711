use ooc_router::load_config::{load_config, BILLING_ROOT_ENV, UPLOAD_ROOT_ENV, WORKING_ROOT_ENV};
use ooc_router_core::contract::PipelineKind;
use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::NamedTempFile;

const FULL_CONFIG: &str = r#"
roots:
  upload: /mnt/ooc/Upload_ooc
  working: /mnt/ooc
  billing: /mnt/billing
ledger_path: /var/lib/ooc-router/moves.jsonl
log_dir: /var/log/ooc-router
operation_timeout_secs: 10
upload_router:
  interval_secs: 20
  rules:
    - name: import references
      pattern: '(?i)IR[_\s-]?(?P<num>\d{5})'
      destination: '/mnt/ooc/IR{num}'
      job_id: 'IR{num}'
    - name: export references
      pattern: '(?i)ER[_\s-]?(?P<num>\d{5})'
      destination: '/mnt/ooc/ER{num}'
      job_id: 'ER{num}'
job_mover:
  rules:
    - pattern: '^(?P<job>[IE]R\d{5})'
      destination: /mnt/billing
  trigger:
    prefixes: [OUT_OF_CHARGE_]
loose_file_classifier:
  rules:
    - pattern: '(?i)(?P<job>[IE]R\d{5})'
      destination: '{job:upper}'
"#;

fn config_file(contents: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), contents).unwrap();
    file
}

fn clear_root_overrides() {
    for var in [UPLOAD_ROOT_ENV, WORKING_ROOT_ENV, BILLING_ROOT_ENV] {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_load_config_success_full_file() {
    clear_root_overrides();
    let file = config_file(FULL_CONFIG);

    let config = load_config(file.path()).expect("Config should load");

    assert_eq!(config.roots.upload, PathBuf::from("/mnt/ooc/Upload_ooc"));
    assert_eq!(config.operation_timeout(), Duration::from_secs(10));
    assert_eq!(config.rules(PipelineKind::UploadRouter).len(), 2);
    assert_eq!(config.upload_router.rules[0].job_id.as_deref(), Some("IR{num}"));
    assert_eq!(config.job_mover.trigger.prefixes, vec!["OUT_OF_CHARGE_"]);
    assert_eq!(config.job_mover.trigger.extension, ".pdf");

    let upload = config.scan_settings(PipelineKind::UploadRouter);
    assert_eq!(upload.interval, Duration::from_secs(20));
    let jobs = config.scan_settings(PipelineKind::JobMover);
    assert_eq!(jobs.interval, Duration::from_secs(15));
    assert!(jobs.is_excluded("upload_ooc"));
}

#[test]
#[serial]
fn test_load_config_minimal_file_uses_defaults() {
    clear_root_overrides();
    let file = config_file(
        "roots: { upload: /u, working: /w, billing: /b }\nledger_path: /s/moves.jsonl\nlog_dir: /s/logs\n",
    );

    let config = load_config(file.path()).expect("Minimal config should load");

    assert!(config.rules(PipelineKind::JobMover).is_empty());
    assert_eq!(config.operation_timeout(), Duration::from_secs(30));
    assert_eq!(config.loose_file_classifier.extensions.len(), 6);
}

#[test]
#[serial]
fn test_environment_overrides_roots() {
    clear_root_overrides();
    let file = config_file(FULL_CONFIG);
    env::set_var(WORKING_ROOT_ENV, "/Volumes/OOC");
    env::set_var(BILLING_ROOT_ENV, "");

    let config = load_config(file.path()).expect("Config should load");
    clear_root_overrides();

    assert_eq!(config.roots.working, PathBuf::from("/Volumes/OOC"));
    // Empty values are ignored.
    assert_eq!(config.roots.billing, PathBuf::from("/mnt/billing"));
    assert_eq!(config.roots.upload, PathBuf::from("/mnt/ooc/Upload_ooc"));
}

#[test]
#[serial]
fn test_load_config_errors_for_invalid_file() {
    let file = config_file("not-yaml: [:::");
    let msg = load_config(file.path()).unwrap_err().to_string();
    assert!(
        msg.contains("parse") || msg.contains("YAML"),
        "Parse error expected, got: {msg}"
    );
}

#[test]
#[serial]
fn test_load_config_errors_on_missing_roots() {
    let file = config_file("ledger_path: /s/moves.jsonl\nlog_dir: /s/logs\n");
    let msg = load_config(file.path()).unwrap_err().to_string();
    assert!(msg.contains("roots"), "Missing field expected, got: {msg}");
}

#[test]
#[serial]
fn test_load_config_rejects_bad_rule_pattern() {
    clear_root_overrides();
    let file = config_file(
        r#"
roots: { upload: /u, working: /w, billing: /b }
ledger_path: /s/moves.jsonl
log_dir: /s/logs
job_mover:
  rules:
    - pattern: '(unclosed'
      destination: /b
"#,
    );
    let msg = load_config(file.path()).unwrap_err().to_string();
    assert!(msg.contains("job_mover"), "Pipeline should be named, got: {msg}");
}

#[test]
fn test_load_config_errors_for_missing_file() {
    let msg = load_config("/definitely/not/here.yaml").unwrap_err().to_string();
    assert!(msg.contains("Failed to read config file"));
}
