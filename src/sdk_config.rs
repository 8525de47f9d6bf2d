use std::{
    fs,
    io::ErrorKind as IoErrorKind,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    error::RunError,
    hooks::{HookScript, START_HOOK},
};

pub const HOOKS_CONFIG_PATH: &str = ".slack/hooks.json";

/// Project-level SDK declarations read from `.slack/hooks.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SdkCliConfig {
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub hooks: ProjectHooks,
    #[serde(default)]
    pub config: ProjectConfig,
    #[serde(skip)]
    pub working_directory: PathBuf,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectHooks {
    #[serde(default)]
    pub start: HookScript,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub watch: Option<WatchOpts>,
    #[serde(rename = "sdk-managed-connection-enabled", default)]
    pub sdk_managed_connection_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WatchTarget {
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(rename = "filter-regex", default)]
    pub filter_regex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct WatchOpts {
    #[serde(default)]
    pub manifest: Option<WatchTarget>,
    #[serde(default)]
    pub app: Option<WatchTarget>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(rename = "filter-regex", default)]
    pub filter_regex: Option<String>,
}

/// Resolved watch settings for one concern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchSpec {
    pub paths: Vec<PathBuf>,
    pub filter: Option<String>,
}

impl WatchSpec {
    pub fn is_enabled(&self) -> bool {
        !self.paths.is_empty()
    }

    fn resolve(base: &Path, paths: &[String], filter: &Option<String>) -> Self {
        Self {
            paths: paths.iter().map(|p| base.join(p)).collect(),
            filter: filter.clone().filter(|f| !f.trim().is_empty()),
        }
    }
}

impl WatchOpts {
    /// Manifest watching falls back to the legacy top-level `paths`.
    pub fn manifest_spec(&self, base: &Path) -> WatchSpec {
        match &self.manifest {
            Some(target) => WatchSpec::resolve(base, &target.paths, &target.filter_regex),
            None => WatchSpec::resolve(base, &self.paths, &self.filter_regex),
        }
    }

    pub fn app_spec(&self, base: &Path) -> WatchSpec {
        match &self.app {
            Some(target) => WatchSpec::resolve(base, &target.paths, &target.filter_regex),
            None => WatchSpec::default(),
        }
    }
}

impl SdkCliConfig {
    /// Reads the hooks file from `project_dir`. A missing file yields an
    /// empty config, so the start-hook check reports what is absent.
    pub fn load(project_dir: &Path) -> Result<Self, RunError> {
        let path = project_dir.join(HOOKS_CONFIG_PATH);
        let mut config = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<SdkCliConfig>(&raw)?,
            Err(error) if error.kind() == IoErrorKind::NotFound => {
                tracing::debug!(target = "local_run::sdk_config", path = %path.display(), "no hooks file found");
                SdkCliConfig::default()
            }
            Err(error) => return Err(error.into()),
        };
        config.hooks.start.name = START_HOOK.to_string();
        config.working_directory = project_dir.to_path_buf();
        Ok(config)
    }

    pub fn manifest_watch(&self) -> Option<WatchSpec> {
        self.config
            .watch
            .as_ref()
            .map(|watch| watch.manifest_spec(&self.working_directory))
    }

    pub fn app_watch(&self) -> Option<WatchSpec> {
        self.config
            .watch
            .as_ref()
            .map(|watch| watch.app_spec(&self.working_directory))
    }
}
