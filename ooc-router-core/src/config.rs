use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::contract::PipelineKind;
use crate::matcher::MatchRule;
use crate::mover::DEFAULT_OPERATION_TIMEOUT;

const DEFAULT_INTERVAL_SECS: u64 = 15;

/// Full router configuration, as deserialised from YAML by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub roots: Roots,
    pub ledger_path: PathBuf,
    pub log_dir: PathBuf,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default)]
    pub upload_router: UploadRouterConfig,
    #[serde(default)]
    pub job_mover: JobMoverConfig,
    #[serde(default)]
    pub loose_file_classifier: LooseFileConfig,
}

/// Filesystem roots. Treated as opaque paths, checked at every cycle start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Roots {
    pub upload: PathBuf,
    pub working: PathBuf,
    pub billing: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRouterConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub rules: Vec<MatchRule>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Default for UploadRouterConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            rules: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMoverConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub rules: Vec<MatchRule>,
    #[serde(default = "default_job_exclude")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub trigger: TriggerConfig,
}

impl Default for JobMoverConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            rules: Vec::new(),
            exclude: default_job_exclude(),
            trigger: TriggerConfig::default(),
        }
    }
}

/// Marker convention for out-of-charge job folders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default = "default_trigger_prefixes")]
    pub prefixes: Vec<String>,
    #[serde(default = "default_trigger_extension")]
    pub extension: String,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            prefixes: default_trigger_prefixes(),
            extension: default_trigger_extension(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LooseFileConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub rules: Vec<MatchRule>,
    /// Company folders under the billing root that are never scanned.
    #[serde(default = "default_loose_exclude")]
    pub exclude: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

impl Default for LooseFileConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_INTERVAL_SECS,
            rules: Vec::new(),
            exclude: default_loose_exclude(),
            extensions: default_extensions(),
        }
    }
}

/// Where and how one scan loop lists its candidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanSettings {
    pub kind: PipelineKind,
    pub source_root: PathBuf,
    /// Names skipped while listing. Compared case-insensitively.
    pub exclude: Vec<String>,
    /// Lower-case extensions with a leading dot. Empty accepts every file.
    pub extensions: Vec<String>,
    pub interval: Duration,
    /// Upper bound on one listing pass.
    pub listing_timeout: Duration,
}

impl ScanSettings {
    pub fn new(kind: PipelineKind, source_root: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            source_root: source_root.into(),
            exclude: Vec::new(),
            extensions: Vec::new(),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            listing_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_exclude<I: IntoIterator<Item = S>, S: Into<String>>(mut self, names: I) -> Self {
        self.exclude = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_extensions<I: IntoIterator<Item = S>, S: AsRef<str>>(mut self, exts: I) -> Self {
        self.extensions = exts.into_iter().map(|e| normalise_extension(e.as_ref())).collect();
        self
    }

    pub fn with_listing_timeout(mut self, timeout: Duration) -> Self {
        self.listing_timeout = timeout;
        self
    }

    pub fn is_excluded(&self, name: &str) -> bool {
        self.exclude.iter().any(|e| e.eq_ignore_ascii_case(name))
    }

    pub fn accepts_extension(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let lower = name.to_lowercase();
        self.extensions.iter().any(|ext| lower.ends_with(ext.as_str()))
    }
}

fn normalise_extension(ext: &str) -> String {
    let ext = ext.trim().to_lowercase();
    if ext.starts_with('.') {
        ext
    } else {
        format!(".{ext}")
    }
}

impl RouterConfig {
    pub fn trace_loaded(&self) {
        info!(
            upload_root = %self.roots.upload.display(),
            working_root = %self.roots.working.display(),
            billing_root = %self.roots.billing.display(),
            ledger = %self.ledger_path.display(),
            log_dir = %self.log_dir.display(),
            upload_rules = self.upload_router.rules.len(),
            job_rules = self.job_mover.rules.len(),
            loose_rules = self.loose_file_classifier.rules.len(),
            "Loaded RouterConfig"
        );
        debug!(?self, "RouterConfig loaded (full debug)");
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }

    /// Roots under which folder moves may create missing directories.
    pub fn destination_roots(&self) -> Vec<PathBuf> {
        vec![self.roots.working.clone(), self.roots.billing.clone()]
    }

    pub fn rules(&self, kind: PipelineKind) -> &[MatchRule] {
        match kind {
            PipelineKind::UploadRouter => &self.upload_router.rules,
            PipelineKind::JobMover => &self.job_mover.rules,
            PipelineKind::LooseFileClassifier => &self.loose_file_classifier.rules,
        }
    }

    pub fn scan_settings(&self, kind: PipelineKind) -> ScanSettings {
        let settings = match kind {
            PipelineKind::UploadRouter => ScanSettings::new(kind, &self.roots.upload)
                .with_interval(secs(self.upload_router.interval_secs))
                .with_exclude(self.upload_router.exclude.iter().cloned()),
            PipelineKind::JobMover => ScanSettings::new(kind, &self.roots.working)
                .with_interval(secs(self.job_mover.interval_secs))
                .with_exclude(self.job_mover.exclude.iter().cloned()),
            PipelineKind::LooseFileClassifier => ScanSettings::new(kind, &self.roots.billing)
                .with_interval(secs(self.loose_file_classifier.interval_secs))
                .with_exclude(self.loose_file_classifier.exclude.iter().cloned())
                .with_extensions(&self.loose_file_classifier.extensions),
        };
        settings.with_listing_timeout(self.operation_timeout())
    }
}

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.max(1))
}

fn default_operation_timeout_secs() -> u64 {
    DEFAULT_OPERATION_TIMEOUT.as_secs()
}

fn default_interval_secs() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_job_exclude() -> Vec<String> {
    vec!["Upload_ooc".to_string()]
}

fn default_trigger_prefixes() -> Vec<String> {
    vec!["OUT_OF_CHARGE_".to_string(), "OUT OF CHARGE_".to_string()]
}

fn default_trigger_extension() -> String {
    ".pdf".to_string()
}

fn default_loose_exclude() -> Vec<String> {
    [
        "BILL RECEVING COPY",
        "Automation Logs",
        "AUTO_SCRIPT",
        "File_Organization_Logs",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_extensions() -> Vec<String> {
    [".pdf", ".docx", ".xlsx", ".jpg", ".png", ".zip"]
        .into_iter()
        .map(String::from)
        .collect()
}
