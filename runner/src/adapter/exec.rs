use super::{Adapter, AdapterError, AdapterOutput};
use crate::{collector::PromptRef, config::AssistantConfig, task::CancelSignal};
use async_trait::async_trait;
use serde_json::json;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Runs an assistant CLI as `exec params... <prompt file>` inside the working directory
#[derive(Debug, Clone)]
pub struct ExecAdapter {
    pub exec: PathBuf,
    pub params: Vec<String>,
    pub timeout: Duration,
    pub retries: u32,
}

impl ExecAdapter {
    pub fn new(
        exec: impl Into<PathBuf>,
        params: Vec<String>,
        timeout: Duration,
        retries: u32,
    ) -> Self {
        Self {
            exec: exec.into(),
            params,
            timeout,
            retries,
        }
    }

    pub fn load(config: &AssistantConfig) -> Self {
        Self::new(
            config.exec.clone(),
            config.params.clone(),
            Duration::from_secs(config.timeout),
            config.retries,
        )
    }

    async fn attempt(
        &self,
        prompt: &PromptRef,
        working_dir: &Path,
    ) -> Result<AdapterOutput, AdapterError> {
        // dropping the child kills it, this covers both timeouts and cancellation
        let child = Command::new(&self.exec)
            .args(self.params.iter())
            .arg(&prompt.path)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AdapterError::Spawn {
                exec: self.exec.clone(),
                source,
            })?;

        debug!("Assistant waiting on {:?}", child.id());

        let start = Instant::now();
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => return Err(AdapterError::ChildTimeout(self.timeout)),
        };
        let elapsed = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        debug!(
            "Finished in {} ms | status: {}",
            elapsed.as_millis(),
            output.status
        );
        trace!("Output: {stdout}");

        if !output.status.success() {
            return Err(AdapterError::ExitStatus {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let mut metadata = BTreeMap::new();
        metadata.insert("exit_code".to_owned(), json!(output.status.code()));
        metadata.insert("duration_ms".to_owned(), json!(elapsed.as_millis() as u64));
        metadata.insert("stderr_bytes".to_owned(), json!(output.stderr.len()));

        Ok(AdapterOutput {
            output: stdout,
            metadata,
        })
    }
}

#[async_trait]
impl Adapter for ExecAdapter {
    async fn execute(
        &self,
        prompt: &PromptRef,
        working_dir: &Path,
        cancel: CancelSignal,
    ) -> Result<AdapterOutput, AdapterError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                result = self.attempt(prompt, working_dir) => result,
                _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            };

            match result {
                Ok(mut output) => {
                    output
                        .metadata
                        .insert("attempts".to_owned(), json!(attempt));

                    return Ok(output);
                }
                Err(
                    error @ (AdapterError::ExitStatus { .. } | AdapterError::ChildTimeout(_)),
                ) if attempt <= self.retries => {
                    warn!(
                        prompt = %prompt.name,
                        attempt,
                        "Assistant attempt failed, retrying: {error}"
                    );
                }
                Err(error) => return Err(error),
            }
        }
    }
}
