//! Two level scheduling of a benchmark matrix.
//!
//! For every prompt the assistants are either run one after the other or as
//! concurrent tasks of a `BoundedRunner`. Inside each assistant the repeated
//! runs are again either sequential or a nested batch. Both levels are sized
//! on their own by the `ResourceProbe`, so up to `effective(A) * effective(R)`
//! trials can be in flight at once. There is no global cap across levels.
//!
//! Once scheduling began, failures only show up as `RunRecord::error`. The
//! result always has one record per prompt, assistant and run.

use crate::{
    adapter::{AdapterMap, WorkspaceStager},
    collector::PromptRef,
    events::{LogSubscriber, Subscriber, TaskEvent},
    executors::bounded::drive,
    ingest::{Ingestors, Metrics},
    resources::{MonitoredRunner, ResourceProbe},
    task::{BatchError, BatchResult, CancelSignal, Task, TaskOutcome, WorkError},
};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    fmt::Display,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one trial, written once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: usize,
    pub response_time_seconds: Option<f64>,
    pub metrics: Metrics,
    pub error: Option<String>,
}

impl RunRecord {
    /// a record for a failed trial, all metrics are `None`
    pub fn failed(run_id: usize, error: impl Display, metric_names: &[String]) -> Self {
        Self {
            run_id,
            response_time_seconds: None,
            metrics: metric_names
                .iter()
                .map(|name| (name.clone(), None))
                .collect(),
            error: Some(error.to_string()),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// All runs of one assistant for one prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkCell {
    pub prompt: PromptRef,
    pub assistant: String,
    pub runs: Vec<RunRecord>,
}

impl BenchmarkCell {
    pub fn new(prompt: PromptRef, assistant: String) -> Self {
        Self {
            prompt,
            assistant,
            runs: Vec::new(),
        }
    }

    /// a cell whose runs `1..=runs` all failed for the same reason
    pub fn failed(
        prompt: &PromptRef,
        assistant: &str,
        runs: usize,
        error: impl Display,
        metric_names: &[String],
    ) -> Self {
        let error = error.to_string();
        let mut cell = Self::new(prompt.clone(), assistant.to_owned());

        for run_id in 1..=runs {
            cell.push(RunRecord::failed(run_id, &error, metric_names));
        }

        cell
    }

    pub fn push(&mut self, record: RunRecord) {
        self.runs.push(record);
    }

    pub fn failures(&self) -> usize {
        self.runs.iter().filter(|run| !run.succeeded()).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkMatrix {
    pub prompts: Vec<PromptRef>,
    pub assistants: Vec<String>,
    pub runs_per_prompt: usize,
    pub parallel_agents: bool,
    pub parallel_runs: usize,
}

impl BenchmarkMatrix {
    pub fn total_trials(&self) -> usize {
        self.prompts.len() * self.assistants.len() * self.runs_per_prompt
    }

    /// whether the assistants of a prompt run as concurrent tasks
    pub fn parallel_assistants(&self) -> bool {
        self.parallel_agents && self.assistants.len() > 1
    }

    /// requested concurrency for the runs of one cell, `None` runs them in sequence
    pub fn run_level_request(&self) -> Option<usize> {
        (self.parallel_runs > 1 && self.runs_per_prompt > 1)
            .then(|| self.parallel_runs.min(self.runs_per_prompt))
    }
}

/// Merged result of a whole benchmark, ordered by prompt then assistant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResults {
    pub cells: Vec<BenchmarkCell>,
}

impl BenchmarkResults {
    pub fn total_runs(&self) -> usize {
        self.cells.iter().map(|cell| cell.runs.len()).sum()
    }

    pub fn cell(&self, prompt: &str, assistant: &str) -> Option<&BenchmarkCell> {
        self.cells
            .iter()
            .find(|cell| cell.prompt.name == prompt && cell.assistant == assistant)
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("The benchmark matrix contains no assistant")]
    NoAssistants,
    #[error("Assistant '{0}' is listed more than once")]
    DuplicateAssistant(String),
    #[error("No adapter is registered for assistant '{0}'")]
    MissingAdapter(String),
    #[error("runs_per_prompt must be at least 1")]
    NoRuns,
    #[error("Failed to schedule batch: {0}")]
    Batch(#[from] BatchError),
}

/// Everything needed to execute a single trial
pub struct TrialEnvironment {
    adapters: AdapterMap,
    ingestor: Ingestors,
    workspace: Arc<dyn WorkspaceStager>,
}

impl TrialEnvironment {
    pub fn new(
        adapters: AdapterMap,
        ingestor: Ingestors,
        workspace: Arc<dyn WorkspaceStager>,
    ) -> Self {
        Self {
            adapters,
            ingestor,
            workspace,
        }
    }

    pub fn metric_names(&self) -> &[String] {
        self.ingestor.metric_names()
    }

    /// run one assistant once against one prompt
    pub async fn attempt(
        &self,
        prompt: &PromptRef,
        assistant: &str,
        run_id: usize,
        cancel: CancelSignal,
    ) -> Result<RunRecord, WorkError> {
        let adapter = self
            .adapters
            .get(assistant)
            .ok_or_else(|| format!("no adapter for assistant '{assistant}'"))?;
        let working_dir = self.workspace.stage(prompt, assistant, run_id)?;

        let start = Instant::now();
        let output = adapter.execute(prompt, &working_dir, cancel).await?;
        let elapsed = start.elapsed();
        let metrics = self.ingestor.ingest(&output)?;

        Ok(RunRecord {
            run_id,
            response_time_seconds: Some(elapsed.as_secs_f64()),
            metrics,
            error: None,
        })
    }
}

/// Global trial counter, only used for progress reporting
#[derive(Debug)]
struct ProgressCounter {
    processed: AtomicUsize,
    total: usize,
}

impl ProgressCounter {
    fn new(total: usize) -> Self {
        Self {
            processed: AtomicUsize::new(0),
            total,
        }
    }

    fn advance(&self, prompt: &str, assistant: &str, succeeded: bool) {
        info!(
            prompt,
            assistant,
            succeeded,
            "Done with {}/{}",
            self.processed.fetch_add(1, Ordering::SeqCst) + 1,
            self.total
        );
    }
}

/// State shared by both levels, cloned into every assistant task
struct SchedulerContext {
    probe: Arc<ResourceProbe>,
    environment: Arc<TrialEnvironment>,
    trial_timeout: Option<Duration>,
    run_subscribers: Vec<Arc<dyn Subscriber<RunRecord>>>,
    progress: ProgressCounter,
}

impl SchedulerContext {
    fn trial_task(
        self: &Arc<Self>,
        prompt: &PromptRef,
        assistant: &str,
        run_id: usize,
    ) -> Task<RunRecord> {
        let context = self.clone();
        let work_prompt = prompt.clone();
        let work_assistant = assistant.to_owned();

        Task::new(format!("run-{run_id}"), move |cancel| async move {
            context
                .environment
                .attempt(&work_prompt, &work_assistant, run_id, cancel)
                .await
        })
        .with_timeout(self.trial_timeout)
        .with_metadata("prompt", prompt.name.as_str())
        .with_metadata("assistant", assistant)
    }

    /// produce all records of one cell, runs are numbered `1..=runs`
    #[instrument(skip(self, prompt), level = "debug", fields(prompt = %prompt.name))]
    async fn run_cell(
        self: &Arc<Self>,
        prompt: &PromptRef,
        assistant: &str,
        runs: usize,
        run_request: Option<usize>,
    ) -> BenchmarkCell {
        let mut cell = BenchmarkCell::new(prompt.clone(), assistant.to_owned());
        let metric_names = self.environment.metric_names();

        match run_request {
            Some(requested) => {
                let mut runner = self.progress_runner(prompt, assistant, requested);

                for subscriber in self.run_subscribers.iter() {
                    runner = runner.subscribe_shared(subscriber.clone());
                }

                debug!(
                    effective = runner.plan().effective,
                    "Running {runs} runs concurrently"
                );

                let tasks = (1..=runs)
                    .map(|run_id| self.trial_task(prompt, assistant, run_id))
                    .collect_vec();

                match runner.execute(tasks).await {
                    Ok(mut batch) => {
                        for run_id in 1..=runs {
                            let record = match batch.remove(&format!("run-{run_id}")) {
                                Some(TaskOutcome::Succeeded(record)) => record,
                                Some(TaskOutcome::Failed(error)) => {
                                    RunRecord::failed(run_id, error, metric_names)
                                }
                                None => RunRecord::failed(
                                    run_id,
                                    "no outcome recorded",
                                    metric_names,
                                ),
                            };

                            cell.push(record);
                        }
                    }
                    Err(error) => {
                        error!("Failed to schedule runs: {error}");
                        cell = BenchmarkCell::failed(prompt, assistant, runs, error, metric_names);
                    }
                }
            }
            None => {
                for run_id in 1..=runs {
                    let (id, timeout, work) =
                        self.trial_task(prompt, assistant, run_id).into_parts();
                    let record = match drive(&id, timeout, work).await {
                        TaskOutcome::Succeeded(record) => record,
                        TaskOutcome::Failed(error) => {
                            warn!(run_id, "Trial failed: {error}");
                            RunRecord::failed(run_id, error, metric_names)
                        }
                    };

                    self.progress.advance(&prompt.name, assistant, record.succeeded());
                    cell.push(record);
                }
            }
        }

        cell
    }

    /// run level runner that advances the global progress on every finished trial
    fn progress_runner(
        self: &Arc<Self>,
        prompt: &PromptRef,
        assistant: &str,
        requested: usize,
    ) -> MonitoredRunner<RunRecord> {
        let context = self.clone();
        let prompt = prompt.name.clone();
        let assistant = assistant.to_owned();
        let progress: Arc<dyn Subscriber<RunRecord>> =
            Arc::new(move |event: &TaskEvent<'_, RunRecord>| match event {
                TaskEvent::Complete { result, .. } => {
                    context.progress.advance(&prompt, &assistant, result.succeeded())
                }
                TaskEvent::Failed { .. } => context.progress.advance(&prompt, &assistant, false),
                TaskEvent::Start { .. } => {}
            });

        self.probe
            .wrap_runner::<RunRecord>(requested)
            .subscribe_shared(Arc::new(LogSubscriber { scope: "run" }))
            .subscribe_shared(progress)
    }
}

/// Runs a benchmark matrix with assistant level and run level parallelism
pub struct NestedScheduler {
    matrix: BenchmarkMatrix,
    probe: Arc<ResourceProbe>,
    environment: Arc<TrialEnvironment>,
    trial_timeout: Option<Duration>,
    agent_subscribers: Vec<Arc<dyn Subscriber<BenchmarkCell>>>,
    run_subscribers: Vec<Arc<dyn Subscriber<RunRecord>>>,
}

impl NestedScheduler {
    pub fn new(
        matrix: BenchmarkMatrix,
        probe: Arc<ResourceProbe>,
        environment: Arc<TrialEnvironment>,
    ) -> Self {
        Self {
            matrix,
            probe,
            environment,
            trial_timeout: None,
            agent_subscribers: Vec::new(),
            run_subscribers: Vec::new(),
        }
    }

    /// scheduler side limit for every trial, `None` or zero waits forever
    pub fn with_trial_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.trial_timeout = timeout.filter(|limit| !limit.is_zero());
        self
    }

    /// receive events of the assistant level tasks (`agent-<name>`)
    pub fn subscribe_agents(mut self, subscriber: Arc<dyn Subscriber<BenchmarkCell>>) -> Self {
        self.agent_subscribers.push(subscriber);
        self
    }

    /// receive events of run level tasks (`run-<n>`), only emitted for concurrent runs
    pub fn subscribe_runs(mut self, subscriber: Arc<dyn Subscriber<RunRecord>>) -> Self {
        self.run_subscribers.push(subscriber);
        self
    }

    pub fn matrix(&self) -> &BenchmarkMatrix {
        &self.matrix
    }

    /// reject a matrix that can not be scheduled, nothing is started on error
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.matrix.assistants.is_empty() {
            return Err(SchedulerError::NoAssistants);
        }

        if let Some(name) = self.matrix.assistants.iter().duplicates().next() {
            return Err(SchedulerError::DuplicateAssistant(name.clone()));
        }

        if let Some(name) = self
            .matrix
            .assistants
            .iter()
            .find(|name| !self.environment.adapters.contains_key(name.as_str()))
        {
            return Err(SchedulerError::MissingAdapter(name.clone()));
        }

        if self.matrix.runs_per_prompt == 0 {
            return Err(SchedulerError::NoRuns);
        }

        Ok(())
    }

    #[instrument(skip(self), level = "info", fields(
        prompts = self.matrix.prompts.len(),
        assistants = self.matrix.assistants.len(),
        runs = self.matrix.runs_per_prompt,
    ))]
    pub async fn run(&self) -> Result<BenchmarkResults, SchedulerError> {
        self.validate()?;

        let total = self.matrix.total_trials();
        let context = Arc::new(SchedulerContext {
            probe: self.probe.clone(),
            environment: self.environment.clone(),
            trial_timeout: self.trial_timeout,
            run_subscribers: self.run_subscribers.clone(),
            progress: ProgressCounter::new(total),
        });

        if self.matrix.parallel_assistants() && self.matrix.run_level_request().is_some() {
            debug!("Assistant and run level are both concurrent, their limits multiply");
        }

        let mut results = BenchmarkResults::default();

        for prompt in self.matrix.prompts.iter() {
            info!(prompt = %prompt.name, "Benchmarking prompt");

            if self.matrix.parallel_assistants() {
                let cells = self.run_assistants_concurrently(&context, prompt).await?;
                results.cells.extend(cells);
            } else {
                for assistant in self.matrix.assistants.iter() {
                    let cell = context
                        .run_cell(
                            prompt,
                            assistant,
                            self.matrix.runs_per_prompt,
                            self.matrix.run_level_request(),
                        )
                        .await;

                    results.cells.push(cell);
                }
            }
        }

        info!("Done with benchmarking {total} trials");

        Ok(results)
    }

    async fn run_assistants_concurrently(
        &self,
        context: &Arc<SchedulerContext>,
        prompt: &PromptRef,
    ) -> Result<Vec<BenchmarkCell>, SchedulerError> {
        let assistants = &self.matrix.assistants;
        let runs = self.matrix.runs_per_prompt;
        let run_request = self.matrix.run_level_request();

        let mut runner = self
            .probe
            .wrap_runner::<BenchmarkCell>(assistants.len())
            .subscribe_shared(Arc::new(LogSubscriber { scope: "assistant" }));

        for subscriber in self.agent_subscribers.iter() {
            runner = runner.subscribe_shared(subscriber.clone());
        }

        debug!(
            effective = runner.plan().effective,
            "Running {} assistants concurrently",
            assistants.len()
        );

        let tasks = assistants
            .iter()
            .map(|assistant| {
                let context = context.clone();
                let prompt = prompt.clone();
                let name = assistant.clone();

                Task::new(agent_task_id(assistant), move |_| async move {
                    Ok::<_, WorkError>(context.run_cell(&prompt, &name, runs, run_request).await)
                })
            })
            .collect_vec();

        let batch = runner.execute(tasks).await?;

        Ok(merge_assistant_cells(
            prompt,
            assistants,
            runs,
            batch,
            self.environment.metric_names(),
        ))
    }
}

/// one cell per assistant in configured order, independent of completion order
pub(crate) fn merge_assistant_cells(
    prompt: &PromptRef,
    assistants: &[String],
    runs: usize,
    mut batch: BatchResult<BenchmarkCell>,
    metric_names: &[String],
) -> Vec<BenchmarkCell> {
    assistants
        .iter()
        .map(|assistant| match batch.remove(&agent_task_id(assistant)) {
            Some(TaskOutcome::Succeeded(cell)) => cell,
            outcome => {
                let reason = match outcome {
                    Some(TaskOutcome::Failed(error)) => error.to_string(),
                    _ => "no outcome recorded".to_owned(),
                };
                error!(assistant = %assistant, "Assistant task failed: {reason}");

                BenchmarkCell::failed(prompt, assistant, runs, &reason, metric_names)
            }
        })
        .collect()
}

pub fn agent_task_id(assistant: &str) -> String {
    format!("agent-{assistant}")
}
