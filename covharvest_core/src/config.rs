use crate::corpus::ClassifyOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Problems with the invocation, configuration file, or corpus that prevent a
/// run from starting at all.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Target directory does not exist: {0:?}")]
    TargetMissing(PathBuf),

    #[error("No eligible program files found under {0:?}")]
    EmptyCorpus(PathBuf),

    #[error("Invalid filter pattern '{pattern}': {source}")]
    InvalidFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Interval must be a positive number of seconds, got {0}")]
    InvalidInterval(u64),

    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Corpus I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Library {
    Torch,
    Tf,
}

impl Library {
    pub fn as_str(&self) -> &'static str {
        match self {
            Library::Torch => "torch",
            Library::Tf => "tf",
        }
    }
}

/// What to do with the raw record of a task that was killed on timeout.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PartialRecordPolicy {
    #[default]
    Discard,
    Include,
}

/// How the script executor hands programs to the interpreter.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeMode {
    /// `session` for Python programs, `process` for anything else.
    #[default]
    Auto,
    /// One interpreter per directory executes every program through the
    /// staged Python runner.
    Session,
    /// A fresh interpreter process per program.
    Process,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentKind {
    #[default]
    Docker,
    Local,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<Library>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default = "default_output")]
    pub output: PathBuf,
    #[serde(default = "default_baseline")]
    pub baseline: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default)]
    pub partial_records: PartialRecordPolicy,
}

pub fn default_output() -> PathBuf {
    PathBuf::from("_result")
}
pub fn default_baseline() -> String {
    "acetest".to_string()
}
pub fn default_interval_secs() -> u64 {
    60
}
pub fn default_parallelism() -> usize {
    16
}
pub fn default_task_timeout_secs() -> u64 {
    180
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            target: None,
            library: None,
            version: None,
            output: default_output(),
            baseline: default_baseline(),
            interval_secs: default_interval_secs(),
            filter: None,
            parallelism: default_parallelism(),
            task_timeout_secs: default_task_timeout_secs(),
            partial_records: PartialRecordPolicy::default(),
        }
    }
}

impl RunSettings {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSettings {
    #[serde(default)]
    pub kind: EnvironmentKind,
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    /// Overrides `image-template` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "default_image_template")]
    pub image_template: String,
    #[serde(default = "default_container_root")]
    pub container_root: String,
    /// Binary staged into the environment to run `drive` and `exec`.
    /// Defaults to the currently running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harvest_binary: Option<PathBuf>,
}

pub fn default_docker_binary() -> String {
    "docker".to_string()
}
pub fn default_image_template() -> String {
    "covharvest/{library}-{version}-instrumented".to_string()
}
pub fn default_container_root() -> String {
    "/root".to_string()
}

impl Default for EnvironmentSettings {
    fn default() -> Self {
        Self {
            kind: EnvironmentKind::default(),
            docker_binary: default_docker_binary(),
            image: None,
            image_template: default_image_template(),
            container_root: default_container_root(),
            harvest_binary: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorSettings {
    #[serde(default = "default_interpreter")]
    pub interpreter: Vec<String>,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default = "default_program_timeout_ms")]
    pub program_timeout_ms: u64,
    #[serde(default = "default_error_marker")]
    pub error_marker: String,
    #[serde(default = "default_program_env")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime: RuntimeMode,
    /// Modules a session imports once and binds into every program's
    /// globals, written as `module` or `module as alias`. Modules that fail
    /// to import are skipped.
    #[serde(default = "default_preload")]
    pub preload: Vec<String>,
}

pub fn default_interpreter() -> Vec<String> {
    vec!["python3".to_string()]
}
pub fn default_extension() -> String {
    "py".to_string()
}
pub fn default_program_timeout_ms() -> u64 {
    30_000
}
pub fn default_error_marker() -> String {
    "Traceback (most recent call last)".to_string()
}

pub fn default_preload() -> Vec<String> {
    ["torch", "numpy", "numpy as np"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Pins the math and ML runtimes to one thread so concurrent tasks do not
/// oversubscribe the environment.
pub fn default_program_env() -> BTreeMap<String, String> {
    [
        "OMP_NUM_THREADS",
        "OMP_THREAD_LIMIT",
        "MKL_NUM_THREADS",
        "OPENBLAS_NUM_THREADS",
        "NUMEXPR_NUM_THREADS",
        "BLIS_NUM_THREADS",
        "VECLIB_MAXIMUM_THREADS",
        "TF_NUM_INTRAOP_THREADS",
        "TF_NUM_INTEROP_THREADS",
    ]
    .into_iter()
    .map(|key| (key.to_string(), "1".to_string()))
    .collect()
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            interpreter: default_interpreter(),
            extension: default_extension(),
            program_timeout_ms: default_program_timeout_ms(),
            error_marker: default_error_marker(),
            env: default_program_env(),
            runtime: RuntimeMode::default(),
            preload: default_preload(),
        }
    }
}

impl ExecutorSettings {
    pub fn program_timeout(&self) -> Duration {
        Duration::from_millis(self.program_timeout_ms)
    }

    pub fn uses_session(&self) -> bool {
        match self.runtime {
            RuntimeMode::Auto => self.extension == "py",
            RuntimeMode::Session => true,
            RuntimeMode::Process => false,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MergeSettings {
    /// Explicit merge tool; when unset the `candidates` are probed in order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default = "default_merge_candidates")]
    pub candidates: Vec<String>,
    #[serde(default = "default_artifact_name")]
    pub artifact_name: String,
}

pub fn default_merge_candidates() -> Vec<String> {
    vec![
        "llvm-profdata".to_string(),
        "llvm-profdata-18".to_string(),
        "llvm-profdata-17".to_string(),
    ]
}
pub fn default_artifact_name() -> String {
    "merged.profdata".to_string()
}

impl Default for MergeSettings {
    fn default() -> Self {
        Self {
            tool: None,
            candidates: default_merge_candidates(),
            artifact_name: default_artifact_name(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarvestConfig {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub environment: EnvironmentSettings,
    #[serde(default)]
    pub executor: ExecutorSettings,
    #[serde(default)]
    pub merge: MergeSettings,
}

impl HarvestConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&content).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_toml(&self) -> Result<String, ConfigurationError> {
        Ok(toml::to_string(self)?)
    }

    /// Checks the settings every subcommand relies on. Target, library and
    /// version are only required by `collect` and are checked there.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.run.interval_secs == 0 {
            return Err(ConfigurationError::InvalidInterval(0));
        }
        if self.run.parallelism == 0 {
            return Err(ConfigurationError::Invalid {
                field: "run.parallelism",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.run.task_timeout_secs == 0 {
            return Err(ConfigurationError::Invalid {
                field: "run.task-timeout-secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.executor.interpreter.is_empty() {
            return Err(ConfigurationError::Invalid {
                field: "executor.interpreter",
                reason: "command must not be empty".to_string(),
            });
        }
        if self.executor.extension.is_empty() || self.executor.extension.starts_with('.') {
            return Err(ConfigurationError::Invalid {
                field: "executor.extension",
                reason: format!(
                    "expected a bare extension such as 'py', got '{}'",
                    self.executor.extension
                ),
            });
        }
        if self.run.baseline.is_empty() || self.run.baseline.contains(['/', '\\']) {
            return Err(ConfigurationError::Invalid {
                field: "run.baseline",
                reason: format!("'{}' is not a valid directory name", self.run.baseline),
            });
        }
        Ok(())
    }

    /// Resolves the environment image from the explicit override or the
    /// `{library}`/`{version}` template.
    pub fn image_name(&self) -> Result<String, ConfigurationError> {
        if let Some(image) = &self.environment.image {
            return Ok(image.clone());
        }
        let library = self.run.library.ok_or(ConfigurationError::Missing("library"))?;
        let version = self
            .run
            .version
            .as_deref()
            .ok_or(ConfigurationError::Missing("version"))?;
        Ok(self
            .environment
            .image_template
            .replace("{library}", library.as_str())
            .replace("{version}", version))
    }

    /// Classifier options derived from the run settings. Buckets are
    /// materialised under `<output>/<baseline>`.
    pub fn classify_options(&self) -> ClassifyOptions {
        ClassifyOptions {
            interval_secs: self.run.interval_secs,
            filter: self.run.filter.clone(),
            extension: self.executor.extension.clone(),
            output_dir: self.run.output.join(&self.run.baseline),
        }
    }

    pub fn environment_name(&self) -> String {
        let library = self.run.library.map_or("lib", |l| l.as_str());
        let version = self.run.version.as_deref().unwrap_or("unversioned");
        // Container names reject '+', which shows up in versions like 2.2.0+cu121.
        let version: String = version
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        format!("covharvest_{library}_{version}-{}", self.run.baseline)
    }
}
