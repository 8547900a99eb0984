use crate::{
    events::{Subscriber, TaskEvent},
    task::{
        cancel_pair, validate, BatchError, BatchResult, Task, TaskError, TaskId, TaskOutcome,
        TaskState, WorkFn,
    },
};
use parking_lot::Mutex;
use std::{
    any::Any,
    collections::{BTreeSet, HashMap, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, instrument, trace};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(25);

type Subscribers<T> = Arc<[Arc<dyn Subscriber<T>>]>;

/// Executes a batch of independent tasks with at most `concurrency` of them in flight.
///
/// A runner is built for exactly one batch: `run`/`execute` consume it.
pub struct BoundedRunner<T> {
    concurrency: usize,
    poll_interval: Duration,
    subscribers: Vec<Arc<dyn Subscriber<T>>>,
    shared: Arc<Mutex<RunnerState<T>>>,
}

/// Cloneable view on a runner, usable while its batch executes
pub struct RunnerHandle<T> {
    poll_interval: Duration,
    shared: Arc<Mutex<RunnerState<T>>>,
}

pub(super) struct RunnerState<T> {
    queue: VecDeque<Task<T>>,
    running: BTreeSet<TaskId>,
    states: HashMap<TaskId, TaskState>,
    results: BatchResult<T>,
}

impl<T> RunnerState<T> {
    pub(super) fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            running: BTreeSet::new(),
            states: HashMap::new(),
            results: BatchResult::new(),
        }
    }

    fn counts(&self) -> (usize, usize) {
        (self.running.len(), self.queue.len())
    }

    pub(super) fn contains(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    pub(super) fn enqueue(&mut self, task: Task<T>) {
        self.states.insert(task.id.clone(), TaskState::Queued);
        self.queue.push_back(task);
    }

    /// move the next queued task into the running set, with the counts after the move
    pub(super) fn start_next(&mut self) -> Option<(Task<T>, usize, usize)> {
        let task = self.queue.pop_front()?;

        self.running.insert(task.id.clone());
        self.states.insert(task.id.clone(), TaskState::Running);
        let (running, queued) = self.counts();

        Some((task, running, queued))
    }

    /// leave the running set and record the outcome in one step
    pub(super) fn finish(&mut self, id: TaskId, outcome: TaskOutcome<T>) {
        self.running.remove(&id);
        self.states.insert(id.clone(), outcome.state());
        self.results.record(id, outcome);
    }

    /// record every queued task as cancelled
    pub(super) fn discard_pending(&mut self) -> usize {
        let drained = self.queue.drain(..).collect::<Vec<_>>();
        let count = drained.len();

        for task in drained {
            self.states.insert(task.id.clone(), TaskState::Cancelled);
            self.results
                .record(task.id, TaskOutcome::Failed(TaskError::Cancelled));
        }

        count
    }

    /// give every task left behind by a stopped worker an outcome, then hand out the results
    pub(super) fn settle(&mut self) -> BatchResult<T> {
        let orphaned = std::mem::take(&mut self.running);

        for id in orphaned {
            error!(id = %id, "Task was left running by a stopped worker");
            self.finish(
                id,
                TaskOutcome::Failed(TaskError::Panicked("runner worker stopped".to_owned())),
            );
        }

        let skipped = self.discard_pending();
        if skipped > 0 {
            error!("{skipped} queued tasks were never started");
        }

        std::mem::replace(&mut self.results, BatchResult::new())
    }
}

impl<T: Send + 'static> BoundedRunner<T> {
    /// create a runner, a concurrency of 0 is treated as 1
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            poll_interval: DEFAULT_POLL_INTERVAL,
            subscribers: Vec::new(),
            shared: Arc::new(Mutex::new(RunnerState::new())),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn subscribe(mut self, subscriber: impl Subscriber<T> + 'static) -> Self {
        self.subscribers.push(Arc::new(subscriber));
        self
    }

    pub fn subscribe_shared(mut self, subscriber: Arc<dyn Subscriber<T>>) -> Self {
        self.subscribers.push(subscriber);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn handle(&self) -> RunnerHandle<T> {
        RunnerHandle {
            poll_interval: self.poll_interval,
            shared: self.shared.clone(),
        }
    }

    /// validate and enqueue a batch without starting it
    pub fn submit(&mut self, tasks: Vec<Task<T>>) -> Result<(), BatchError> {
        validate(&tasks)?;

        let mut state = self.shared.lock();

        if let Some(task) = tasks.iter().find(|task| state.contains(&task.id)) {
            return Err(BatchError::DuplicateId(task.id.clone()));
        }

        for task in tasks {
            state.enqueue(task);
        }

        Ok(())
    }

    /// submit and run a batch in one go
    pub async fn execute(mut self, tasks: Vec<Task<T>>) -> Result<BatchResult<T>, BatchError> {
        self.submit(tasks)?;

        Ok(self.run().await)
    }

    /// run everything queued until the queue is empty and nothing is in flight
    #[instrument(skip(self), level = "debug", fields(concurrency = self.concurrency))]
    pub async fn run(self) -> BatchResult<T> {
        let queued = self.shared.lock().queue.len();
        let workers = self.concurrency.min(queued);
        let subscribers: Subscribers<T> = self.subscribers.into();

        debug!("Starting {workers} workers for {queued} queued tasks");

        let mut pool = JoinSet::new();

        for worker in 0..workers {
            pool.spawn(work_queue(worker, self.shared.clone(), subscribers.clone()));
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(error) = joined {
                error!(error = ?error, "Runner worker stopped unexpectedly");
            }
        }

        // a worker that stopped early may have left tasks behind
        self.shared.lock().settle()
    }
}

impl<T> RunnerHandle<T> {
    /// drop every task that has not started yet, returns how many were dropped
    pub fn cancel_pending(&self) -> usize {
        let count = self.shared.lock().discard_pending();

        if count > 0 {
            debug!("Cancelled {count} pending tasks");
        }

        count
    }

    /// resolves once no task is running
    pub async fn wait_for_idle(&self) {
        while self.running_count() > 0 {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn running_count(&self) -> usize {
        self.shared.lock().running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn state_of(&self, id: &str) -> Option<TaskState> {
        self.shared.lock().states.get(id).copied()
    }
}

impl<T> Clone for RunnerHandle<T> {
    fn clone(&self) -> Self {
        Self {
            poll_interval: self.poll_interval,
            shared: self.shared.clone(),
        }
    }
}

/// notify every subscriber, a panicking subscriber is logged and skipped
fn publish<T>(subscribers: &Subscribers<T>, event: TaskEvent<'_, T>) {
    for subscriber in subscribers.iter() {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| subscriber.notify(&event))) {
            error!(
                id = event.id(),
                "Subscriber panicked: {}",
                panic_message(payload.as_ref())
            );
        }
    }
}

/// a single worker: dequeue, run to completion, repeat
async fn work_queue<T: Send + 'static>(
    worker: usize,
    shared: Arc<Mutex<RunnerState<T>>>,
    subscribers: Subscribers<T>,
) {
    loop {
        let next = shared.lock().start_next();
        let Some((task, running, queued)) = next else {
            break;
        };
        let (id, timeout, work) = task.into_parts();

        trace!(worker, id = %id, "Worker picked up task");
        publish(
            &subscribers,
            TaskEvent::Start {
                id: &id,
                running,
                queued,
            },
        );

        let outcome = drive(&id, timeout, work).await;

        // the task still counts as running until its outcome is recorded
        let (running, queued) = {
            let state = shared.lock();
            let (running, queued) = state.counts();

            (running.saturating_sub(1), queued)
        };

        match &outcome {
            TaskOutcome::Succeeded(result) => publish(
                &subscribers,
                TaskEvent::Complete {
                    id: &id,
                    result,
                    running,
                    queued,
                },
            ),
            TaskOutcome::Failed(error) => publish(
                &subscribers,
                TaskEvent::Failed {
                    id: &id,
                    error,
                    running,
                    queued,
                },
            ),
        }

        shared.lock().finish(id, outcome);
    }

    trace!(worker, "Worker found an empty queue");
}

/// Aborts the wrapped task once dropped, so abandoning a `drive` also stops its work
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Race a work unit against its timeout. On timeout the work is signalled and aborted.
pub(crate) async fn drive<T: Send + 'static>(
    id: &str,
    timeout: Option<Duration>,
    work: WorkFn<T>,
) -> TaskOutcome<T> {
    let (trigger, signal) = cancel_pair();
    let start = Instant::now();
    // building the future happens inside the spawned task too, so a panic there stays isolated
    let mut handle = AbortOnDrop(tokio::spawn(async move { work(signal).await }));

    let joined = match timeout {
        None => (&mut handle.0).await,
        Some(limit) => match tokio::time::timeout(limit, &mut handle.0).await {
            Ok(joined) => joined,
            Err(_) => {
                let elapsed = start.elapsed();

                trigger.cancel();
                debug!(id, ?elapsed, ?limit, "Task ran into timeout, abandoning it");

                return TaskOutcome::Failed(TaskError::Timeout { elapsed, limit });
            }
        },
    };

    match joined {
        Ok(Ok(value)) => TaskOutcome::Succeeded(value),
        Ok(Err(error)) => TaskOutcome::Failed(TaskError::Work(error)),
        Err(error) => TaskOutcome::Failed(TaskError::Panicked(join_message(error))),
    }
}

fn join_message(error: JoinError) -> String {
    if error.is_cancelled() {
        return "work was aborted".to_owned();
    }

    panic_message(error.into_panic().as_ref())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
