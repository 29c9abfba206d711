//! Out-of-charge detection for job folders.
//!
//! A job is out of charge once its folder holds a marker document: a file
//! whose upper-cased name starts with one of the configured prefixes and ends
//! with the configured extension, and which is readable and non-empty. A
//! marker still being written (zero bytes) does not count.

use std::fs::{self, File};
use std::path::Path;

use tracing::{debug, warn};

use crate::config::TriggerConfig;
use crate::contract::TriggerDetector;

/// Marker-file based [`TriggerDetector`].
#[derive(Debug, Clone)]
pub struct MarkerTrigger {
    prefixes: Vec<String>,
    extension: String,
}

impl MarkerTrigger {
    pub fn new<I, S>(prefixes: I, extension: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extension = extension.trim().to_uppercase();
        let extension = if extension.is_empty() || extension.starts_with('.') {
            extension
        } else {
            format!(".{extension}")
        };
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.as_ref().to_uppercase())
                .filter(|p| !p.is_empty())
                .collect(),
            extension,
        }
    }

    pub fn from_config(config: &TriggerConfig) -> Self {
        Self::new(&config.prefixes, &config.extension)
    }

    /// Whether `file_name` follows the marker naming convention.
    pub fn is_marker_name(&self, file_name: &str) -> bool {
        let upper = file_name.to_uppercase();
        upper.ends_with(&self.extension) && self.prefixes.iter().any(|p| upper.starts_with(p))
    }

    fn is_usable_marker(path: &Path) -> bool {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => File::open(path).is_ok(),
            Ok(_) => false,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "marker not readable");
                false
            }
        }
    }
}

impl TriggerDetector for MarkerTrigger {
    fn is_ready(&self, job_folder: &Path) -> bool {
        let entries = match fs::read_dir(job_folder) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(folder = %job_folder.display(), error = %e, "cannot list job folder");
                return false;
            }
        };

        entries.flatten().any(|entry| {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                return false;
            };
            self.is_marker_name(name) && Self::is_usable_marker(&entry.path())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn trigger() -> MarkerTrigger {
        MarkerTrigger::new(["OUT_OF_CHARGE_", "OUT OF CHARGE_"], "pdf")
    }

    #[test]
    fn marker_names_are_case_insensitive() {
        let t = trigger();
        assert!(t.is_marker_name("OUT_OF_CHARGE_IR12345.pdf"));
        assert!(t.is_marker_name("out of charge_ir12345.PDF"));
        assert!(!t.is_marker_name("OUT_OF_CHARGE_IR12345.docx"));
        assert!(!t.is_marker_name("invoice.pdf"));
    }

    #[test]
    fn folder_with_marker_is_ready() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("invoice.pdf"), b"x").unwrap();
        assert!(!trigger().is_ready(dir.path()));

        fs::write(dir.path().join("OUT_OF_CHARGE_IR1.pdf"), b"%PDF").unwrap();
        assert!(trigger().is_ready(dir.path()));
    }

    #[test]
    fn empty_marker_is_not_ready() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("OUT_OF_CHARGE_IR1.pdf"), b"").unwrap();
        assert!(!trigger().is_ready(dir.path()));
    }

    #[test]
    fn directory_named_like_marker_is_ignored() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("OUT_OF_CHARGE_IR1.pdf")).unwrap();
        assert!(!trigger().is_ready(dir.path()));
    }

    #[test]
    fn unreadable_folder_is_not_ready() {
        let dir = tempdir().unwrap();
        assert!(!trigger().is_ready(&dir.path().join("missing")));
    }
}
