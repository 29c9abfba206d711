/// `load_config` module: loads the router's YAML configuration into the core [`RouterConfig`].
///
/// This is the only place where user-edited YAML is parsed. After parsing it:
/// - applies the per-workstation root overrides from the environment
///   (`OOC_UPLOAD_ROOT`, `OOC_WORKING_ROOT`, `OOC_BILLING_ROOT`), since mapped
///   drive letters differ between machines;
/// - compiles every pipeline's rules once, so a bad pattern fails at load time
///   with the pipeline and rule named instead of at the first scan.
///
/// All errors are `anyhow::Error` and surface at the CLI boundary.
use anyhow::{anyhow, Result};
use ooc_router_core::config::RouterConfig;
use ooc_router_core::contract::PipelineKind;
use ooc_router_core::matcher::RuleSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};

pub const UPLOAD_ROOT_ENV: &str = "OOC_UPLOAD_ROOT";
pub const WORKING_ROOT_ENV: &str = "OOC_WORKING_ROOT";
pub const BILLING_ROOT_ENV: &str = "OOC_BILLING_ROOT";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RouterConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let mut config: RouterConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    apply_env_overrides(&mut config);

    for kind in PipelineKind::ALL {
        if let Err(e) = RuleSet::compile(config.rules(kind)) {
            error!(pipeline = %kind, error = %e, "Invalid rules in config");
            return Err(anyhow!("Invalid rules for {kind}: {e}"));
        }
    }

    config.trace_loaded();
    Ok(config)
}

fn apply_env_overrides(config: &mut RouterConfig) {
    for (var, root) in [
        (UPLOAD_ROOT_ENV, &mut config.roots.upload),
        (WORKING_ROOT_ENV, &mut config.roots.working),
        (BILLING_ROOT_ENV, &mut config.roots.billing),
    ] {
        if let Some(value) = env::var_os(var).filter(|v| !v.is_empty()) {
            *root = PathBuf::from(value);
            info!(env = var, root = %root.display(), "Root overridden from environment");
        }
    }
}
