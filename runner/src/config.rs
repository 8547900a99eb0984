use crate::{collector::PromptRef, scheduler::BenchmarkMatrix};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound)
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("File not found")]
    FileNotFound,
    #[error("Metadata not found")]
    MetadataNotFound(#[source] Error),
    #[error("Failed to read config file {path:?}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: Error,
    },
    #[error("Failed to parse config")]
    ParseFailed(#[from] serde_yaml::Error),
    #[error("Config failed the preflight checks")]
    PreflightFailed,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BenchConfig {
    // Assistants as executables with fixed parameters, keyed by their name
    pub assistants: BTreeMap<String, AssistantConfig>,
    // Where to find the prompt files
    pub prompts: PromptConfig,
    #[serde(default = "default_runs_per_prompt")]
    pub runs_per_prompt: usize,
    // run the assistants of one prompt concurrently
    #[serde(default)]
    pub parallel_agents: bool,
    // upper bound for concurrent runs of one assistant/prompt pair, 0 and 1 disable it
    #[serde(default)]
    pub parallel_runs: usize,
    // scheduler side limit for a single trial, 0 = none
    #[serde(default)]
    pub trial_timeout_ms: u64,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub ingest: IngestorConfig,
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default = "default_output_path")]
    pub output: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AssistantConfig {
    pub exec: PathBuf,
    #[serde(default)]
    pub params: Vec<String>,
    // adapter internal timeout per attempt in seconds
    #[serde(default = "default_assistant_timeout")]
    pub timeout: u64,
    // additional attempts after a non-zero exit
    #[serde(default)]
    pub retries: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PromptConfig {
    pub path: Option<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default = "default_prompt_glob")]
    pub glob: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_path")]
    pub path: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            path: default_workspace_path(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum IngestorConfig {
    Null {
        #[serde(default)]
        metrics: Vec<String>,
    },
    Yaml {
        metrics: Vec<String>,
    },
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self::Null {
            metrics: Vec::new(),
        }
    }
}

impl IngestorConfig {
    pub fn metrics(&self) -> &[String] {
        match self {
            Self::Null { metrics } | Self::Yaml { metrics } => metrics,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields, default)]
pub struct ResourceConfig {
    // share of the free memory the benchmark may use
    pub memory_budget_percent: u64,
    // expected footprint of a single trial subprocess
    pub per_task_memory_mb: u64,
    pub memory_warning_percent: f64,
    pub cpu_warning_percent: f64,
    pub monitor_interval_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_budget_percent: 80,
            per_task_memory_mb: 500,
            memory_warning_percent: 80.0,
            cpu_warning_percent: 90.0,
            monitor_interval_ms: 5000,
        }
    }
}

impl ResourceConfig {
    pub fn per_task_memory_bytes(&self) -> u64 {
        self.per_task_memory_mb.saturating_mul(1024 * 1024)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|source| ConfigErrors::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn trial_timeout(&self) -> Option<Duration> {
        (self.trial_timeout_ms > 0).then(|| Duration::from_millis(self.trial_timeout_ms))
    }

    /// build the benchmark matrix for a set of collected prompts
    pub fn matrix(&self, prompts: Vec<PromptRef>) -> BenchmarkMatrix {
        BenchmarkMatrix {
            prompts,
            assistants: self.assistants.keys().cloned().collect(),
            runs_per_prompt: self.runs_per_prompt,
            parallel_agents: self.parallel_agents,
            parallel_runs: self.parallel_runs,
        }
    }

    /// returns `true` if any error was found, every problem is logged
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        if self.assistants.is_empty() {
            error!("No assistant was defined, unable to build a benchmark matrix");
            contains_error = true;
        }

        for (name, assistant) in self.assistants.iter() {
            match check_executable(&assistant.exec) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "Assistant {name} target {} is not executable",
                        assistant.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(ConfigErrors::FileNotFound) => {
                    error!(
                        "Failed to find assistants.{name}.exec, not a file or missing at {}",
                        assistant.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if assistants.{name}.exec ({}) is an executable: {e}",
                        assistant.exec.to_string_lossy()
                    );
                    contains_error = true;
                }
            }

            if assistant.timeout == 0 {
                error!("assistants.{name}.timeout cannot be 0");
                contains_error = true;
            }
        }

        if self.prompts.path.is_none() && self.prompts.paths.is_empty() {
            error!("prompts contains neither 'path' nor 'paths', nothing can be benchmarked");
            contains_error = true;
        } else if let Some(ref path) = self.prompts.path {
            if !self.prompts.paths.is_empty() {
                warn!("prompts contains both 'path' and 'paths', 'path' is added to 'paths'");
            }
            // merge path into paths if neccessary
            if !self.prompts.paths.contains(path) {
                self.prompts.paths.push(path.clone());
            }
        }

        if self.runs_per_prompt == 0 {
            error!("runs_per_prompt cannot be 0");
            contains_error = true;
        }

        if self.parallel_runs > self.runs_per_prompt {
            warn!(
                "parallel_runs ({}) exceeds runs_per_prompt ({}), a pair uses at most {} slots",
                self.parallel_runs, self.runs_per_prompt, self.runs_per_prompt
            );
        }

        if !self.workspace.path.is_dir() {
            error!(
                "workspace.path {} is not a directory",
                self.workspace.path.to_string_lossy()
            );
            contains_error = true;
        }

        if let IngestorConfig::Yaml { metrics } = &self.ingest {
            if metrics.is_empty() {
                warn!("ingest.metrics is empty, the yaml ingestor will not record anything");
            }
        }

        let resources = &self.resources;

        if !(1..=100).contains(&resources.memory_budget_percent) {
            error!("resources.memory_budget_percent must be within 1..=100");
            contains_error = true;
        }

        if resources.per_task_memory_mb == 0 {
            error!("resources.per_task_memory_mb cannot be 0");
            contains_error = true;
        }

        for (field, value) in [
            ("memory_warning_percent", resources.memory_warning_percent),
            ("cpu_warning_percent", resources.cpu_warning_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                error!("resources.{field} must be within (0, 100], got {value}");
                contains_error = true;
            }
        }

        if resources.monitor_interval_ms == 0 {
            error!("resources.monitor_interval_ms cannot be 0");
            contains_error = true;
        }

        contains_error
    }
}

fn default_runs_per_prompt() -> usize {
    1
}

fn default_assistant_timeout() -> u64 {
    600
}

fn default_prompt_glob() -> String {
    "*.md".to_owned()
}

fn default_workspace_path() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_path() -> PathBuf {
    PathBuf::from("agentbench-results.json")
}
