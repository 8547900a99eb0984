use itertools::Itertools;
use std::{
    collections::BTreeMap,
    error::Error,
    fmt,
    future::Future,
    pin::Pin,
    time::Duration,
};
use thiserror::Error;
use tokio::sync::watch;

pub type TaskId = String;

/// Error produced by a work unit, kept as-is for the caller
pub type WorkError = Box<dyn Error + Send + Sync + 'static>;

pub type WorkFuture<T> = Pin<Box<dyn Future<Output = Result<T, WorkError>> + Send + 'static>>;

pub(crate) type WorkFn<T> = Box<dyn FnOnce(CancelSignal) -> WorkFuture<T> + Send + 'static>;

/// Receiving side of a cancellation request handed to every work unit.
///
/// A signal whose trigger was dropped without firing never resolves `cancelled`.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

/// Sending side of a `CancelSignal`
#[derive(Debug)]
pub struct CancelTrigger(watch::Sender<bool>);

pub fn cancel_pair() -> (CancelTrigger, CancelSignal) {
    let (sender, receiver) = watch::channel(false);

    (CancelTrigger(sender), CancelSignal(receiver))
}

impl CancelTrigger {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

impl CancelSignal {
    /// a signal that is never fired
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// resolves once the paired trigger fired
    pub async fn cancelled(&self) {
        let mut receiver = self.0.clone();

        loop {
            if *receiver.borrow_and_update() {
                return;
            }

            if receiver.changed().await.is_err() {
                // trigger is gone without ever firing
                std::future::pending::<()>().await;
            }
        }
    }
}

/// One independent unit of asynchronous work submitted to a runner
pub struct Task<T> {
    pub id: TaskId,
    /// `None` waits for the work unit without limit
    pub timeout: Option<Duration>,
    pub metadata: BTreeMap<String, String>,
    work: WorkFn<T>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F, Fut>(id: impl Into<TaskId>, work: F) -> Self
    where
        F: FnOnce(CancelSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, WorkError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            timeout: None,
            metadata: BTreeMap::new(),
            work: Box::new(move |cancel| Box::pin(work(cancel))),
        }
    }
}

impl<T> Task<T> {
    /// set the timeout in milliseconds, 0 disables it
    pub fn with_timeout_ms(self, timeout_ms: u64) -> Self {
        self.with_timeout(Some(Duration::from_millis(timeout_ms)))
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|limit| !limit.is_zero());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub(crate) fn into_parts(self) -> (TaskId, Option<Duration>, WorkFn<T>) {
        (self.id, self.timeout, self.work)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("timeout", &self.timeout)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a single task: `Queued -> Running -> {Completed | FailedTimeout | FailedError}`.
/// `Cancelled` is only reachable from `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    FailedTimeout,
    FailedError,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}

/// Isolated failure of a single task
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },
    #[error("{0}")]
    Work(#[source] WorkError),
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task was cancelled before it started")]
    Cancelled,
}

impl TaskError {
    pub fn state(&self) -> TaskState {
        match self {
            Self::Timeout { .. } => TaskState::FailedTimeout,
            Self::Work(_) | Self::Panicked(_) => TaskState::FailedError,
            Self::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Errors raised before any task of a batch is scheduled
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("task id '{0}' was submitted more than once")]
    DuplicateId(TaskId),
    #[error("task ids must not be empty")]
    EmptyId,
}

/// check a batch before anything of it is scheduled
pub(crate) fn validate<T>(tasks: &[Task<T>]) -> Result<(), BatchError> {
    if tasks.iter().any(|task| task.id.is_empty()) {
        return Err(BatchError::EmptyId);
    }

    match tasks.iter().map(|task| task.id.as_str()).duplicates().next() {
        Some(id) => Err(BatchError::DuplicateId(id.to_owned())),
        None => Ok(()),
    }
}

#[derive(Debug)]
pub enum TaskOutcome<T> {
    Succeeded(T),
    Failed(TaskError),
}

impl<T> TaskOutcome<T> {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Succeeded(value) => Some(value),
            Self::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            Self::Succeeded(_) => None,
            Self::Failed(error) => Some(error),
        }
    }

    pub fn state(&self) -> TaskState {
        match self {
            Self::Succeeded(_) => TaskState::Completed,
            Self::Failed(error) => error.state(),
        }
    }

    pub fn into_result(self) -> Result<T, TaskError> {
        match self {
            Self::Succeeded(value) => Ok(value),
            Self::Failed(error) => Err(error),
        }
    }
}

/// Outcome of every task of one batch, exactly one entry per submitted id
#[derive(Debug)]
pub struct BatchResult<T> {
    outcomes: BTreeMap<TaskId, TaskOutcome<T>>,
    completion_order: Vec<TaskId>,
}

impl<T> BatchResult<T> {
    pub(crate) fn new() -> Self {
        Self {
            outcomes: BTreeMap::new(),
            completion_order: Vec::new(),
        }
    }

    pub(crate) fn record(&mut self, id: TaskId, outcome: TaskOutcome<T>) {
        self.completion_order.push(id.clone());
        self.outcomes.insert(id, outcome);
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TaskOutcome<T>> {
        self.outcomes.get(id)
    }

    pub fn remove(&mut self, id: &str) -> Option<TaskOutcome<T>> {
        self.outcomes.remove(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TaskId, &TaskOutcome<T>)> {
        self.outcomes.iter()
    }

    /// ids in the order their outcome was recorded
    pub fn completion_order(&self) -> &[TaskId] {
        &self.completion_order
    }

    pub fn succeeded_count(&self) -> usize {
        self.outcomes.values().filter(|outcome| outcome.succeeded()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.len() - self.succeeded_count()
    }
}

impl<T> IntoIterator for BatchResult<T> {
    type Item = (TaskId, TaskOutcome<T>);
    type IntoIter = std::collections::btree_map::IntoIter<TaskId, TaskOutcome<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}
