pub mod exec;


use crate::{
    collector::PromptRef,
    config::BenchConfig,
    task::{CancelSignal, WorkError},
};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Failed to spawn {exec:?}")]
    Spawn {
        exec: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to wait for the assistant process")]
    ChildError(#[from] io::Error),
    #[error("Assistant exited with status {status}: {stderr}")]
    ExitStatus { status: i32, stderr: String },
    #[error("Assistant did not finish within {0:?}")]
    ChildTimeout(Duration),
    #[error("Assistant was cancelled")]
    Cancelled,
}

/// What an assistant produced for one prompt
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdapterOutput {
    pub output: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Runs one assistant against one prompt.
///
/// Implementations carry their own retry and timeout policy, the scheduler
/// layers its per-trial timeout on top and fires `cancel` when it gives up.
#[async_trait]
pub trait Adapter: Send + Sync {
    async fn execute(
        &self,
        prompt: &PromptRef,
        working_dir: &Path,
        cancel: CancelSignal,
    ) -> Result<AdapterOutput, AdapterError>;
}

pub type AdapterMap = BTreeMap<String, Arc<dyn Adapter>>;

/// build one subprocess adapter per configured assistant
pub fn load_adapters(config: &BenchConfig) -> AdapterMap {
    config
        .assistants
        .iter()
        .map(|(name, assistant)| {
            let adapter: Arc<dyn Adapter> = Arc::new(exec::ExecAdapter::load(assistant));

            (name.clone(), adapter)
        })
        .collect()
}

/// Provides the working directory of a trial
pub trait WorkspaceStager: Send + Sync {
    fn stage(
        &self,
        prompt: &PromptRef,
        assistant: &str,
        run_id: usize,
    ) -> Result<PathBuf, WorkError>;
}

/// Every trial works in the same directory
#[derive(Debug, Clone)]
pub struct FixedWorkspace {
    path: PathBuf,
}

impl FixedWorkspace {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl WorkspaceStager for FixedWorkspace {
    fn stage(
        &self,
        _prompt: &PromptRef,
        _assistant: &str,
        _run_id: usize,
    ) -> Result<PathBuf, WorkError> {
        Ok(self.path.clone())
    }
}
