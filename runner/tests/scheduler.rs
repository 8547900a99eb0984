use agentbench::{
    adapter::{Adapter, AdapterError, AdapterMap, AdapterOutput, FixedWorkspace},
    collector::PromptRef,
    config::ResourceConfig,
    events::{Subscriber, TaskEvent},
    ingest::Ingestors,
    resources::{FixedSource, ResourceProbe, ResourceSnapshot},
    scheduler::{
        BenchmarkCell, BenchmarkMatrix, NestedScheduler, RunRecord, SchedulerError,
        TrialEnvironment,
    },
    task::CancelSignal,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

const GIB: u64 = 1024 * 1024 * 1024;

/// In-flight counter shared by every scripted assistant of a test
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Leaves the gauge when dropped, also when the work unit is aborted
struct InFlight<'a>(&'a Gauge);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Gauge {
    fn enter(&self) -> InFlight<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        InFlight(self)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Answers with `score: <call>` after `delay`, fails on the listed calls, hangs if asked to
struct ScriptedAdapter {
    delay: Duration,
    fail_on: HashSet<usize>,
    hang: bool,
    calls: AtomicUsize,
    gauge: Arc<Gauge>,
}

impl ScriptedAdapter {
    fn new(gauge: &Arc<Gauge>, delay: Duration) -> Self {
        Self {
            delay,
            fail_on: HashSet::new(),
            hang: false,
            calls: AtomicUsize::new(0),
            gauge: gauge.clone(),
        }
    }

    fn failing_on(mut self, calls: &[usize]) -> Self {
        self.fail_on = calls.iter().copied().collect();
        self
    }

    fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    async fn execute(
        &self,
        _prompt: &PromptRef,
        _working_dir: &Path,
        cancel: CancelSignal,
    ) -> Result<AdapterOutput, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let in_flight = self.gauge.enter();
        let finished = tokio::select! {
            _ = async {
                if self.hang {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(self.delay).await;
            } => true,
            _ = cancel.cancelled() => false,
        };
        drop(in_flight);

        if !finished {
            return Err(AdapterError::Cancelled);
        }

        if self.fail_on.contains(&call) {
            return Err(AdapterError::ExitStatus {
                status: 1,
                stderr: format!("scripted failure on call {call}"),
            });
        }

        Ok(AdapterOutput {
            output: format!("score: {call}\n"),
            ..AdapterOutput::default()
        })
    }
}

fn prompts(count: usize) -> Vec<PromptRef> {
    (1..=count)
        .map(|index| PromptRef::from_path(PathBuf::from(format!("prompts/task-{index}.md"))))
        .collect()
}

fn probe(cpu_count: usize) -> Arc<ResourceProbe> {
    let source = FixedSource::new(ResourceSnapshot::idle(cpu_count, 64 * GIB, 128 * GIB));

    Arc::new(ResourceProbe::with_source(
        Arc::new(source),
        ResourceConfig::default(),
    ))
}

fn environment(adapters: Vec<(&str, ScriptedAdapter)>) -> Arc<TrialEnvironment> {
    let adapters: AdapterMap = adapters
        .into_iter()
        .map(|(name, adapter)| {
            let adapter: Arc<dyn Adapter> = Arc::new(adapter);
            (name.to_owned(), adapter)
        })
        .collect();

    Arc::new(TrialEnvironment::new(
        adapters,
        Ingestors::Yaml {
            metrics: vec!["score".to_owned()],
        },
        Arc::new(FixedWorkspace::new(std::env::temp_dir())),
    ))
}

fn matrix(
    prompt_count: usize,
    assistants: &[&str],
    runs_per_prompt: usize,
    parallel_agents: bool,
    parallel_runs: usize,
) -> BenchmarkMatrix {
    BenchmarkMatrix {
        prompts: prompts(prompt_count),
        assistants: assistants.iter().map(|name| name.to_string()).collect(),
        runs_per_prompt,
        parallel_agents,
        parallel_runs,
    }
}

fn run_ids(cell: &BenchmarkCell) -> Vec<usize> {
    cell.runs.iter().map(|run| run.run_id).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_assistants_with_sequential_runs_cover_the_matrix() {
    let gauge = Arc::new(Gauge::default());
    let delay = Duration::from_millis(5);
    let environment = environment(vec![
        ("alpha", ScriptedAdapter::new(&gauge, delay)),
        ("beta", ScriptedAdapter::new(&gauge, delay).failing_on(&[2, 3])),
        ("gamma", ScriptedAdapter::new(&gauge, delay)),
    ]);

    let agent_starts = Arc::new(Mutex::new(Vec::new()));
    let starts = agent_starts.clone();
    let subscriber: Arc<dyn Subscriber<BenchmarkCell>> =
        Arc::new(move |event: &TaskEvent<'_, BenchmarkCell>| {
            if let TaskEvent::Start { id, .. } = event {
                starts.lock().push(id.to_string());
            }
        });

    let scheduler = NestedScheduler::new(
        matrix(1, &["alpha", "beta", "gamma"], 4, true, 0),
        probe(8),
        environment,
    )
    .subscribe_agents(subscriber);

    let results = scheduler.run().await.unwrap();

    let mut started = agent_starts.lock().clone();
    started.sort();
    assert_eq!(started, vec!["agent-alpha", "agent-beta", "agent-gamma"]);

    assert_eq!(results.total_runs(), 12);
    let assistants = results
        .cells
        .iter()
        .map(|cell| cell.assistant.as_str())
        .collect::<Vec<_>>();
    assert_eq!(assistants, vec!["alpha", "beta", "gamma"]);

    for cell in results.cells.iter() {
        assert_eq!(run_ids(cell), vec![1, 2, 3, 4]);
    }

    let beta = results.cell("task-1", "beta").unwrap();
    assert_eq!(beta.failures(), 2);
    let failed = &beta.runs[1];
    assert!(failed.error.as_deref().unwrap().contains("scripted failure"));
    assert_eq!(failed.response_time_seconds, None);
    assert_eq!(failed.metrics["score"], None);

    // sequential runs keep the call order of the assistant
    let alpha = results.cell("task-1", "alpha").unwrap();
    let scores = alpha
        .runs
        .iter()
        .map(|run| run.metrics["score"])
        .collect::<Vec<_>>();
    assert_eq!(scores, vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
    assert!(alpha.runs.iter().all(|run| run.response_time_seconds.is_some()));
}

#[tokio::test]
async fn sequential_assistants_never_use_the_agent_level() {
    let gauge = Arc::new(Gauge::default());
    let delay = Duration::from_millis(1);
    let environment = environment(vec![
        ("alpha", ScriptedAdapter::new(&gauge, delay)),
        ("beta", ScriptedAdapter::new(&gauge, delay)),
    ]);

    let agent_events = Arc::new(AtomicUsize::new(0));
    let counter = agent_events.clone();
    let subscriber: Arc<dyn Subscriber<BenchmarkCell>> =
        Arc::new(move |_: &TaskEvent<'_, BenchmarkCell>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let matrix = matrix(2, &["alpha", "beta"], 2, false, 0);
    let results = NestedScheduler::new(matrix, probe(8), environment)
        .subscribe_agents(subscriber)
        .run()
        .await
        .unwrap();

    assert_eq!(agent_events.load(Ordering::SeqCst), 0);
    assert_eq!(gauge.peak(), 1);
    assert_eq!(results.total_runs(), 8);

    let order = results
        .cells
        .iter()
        .map(|cell| (cell.prompt.name.as_str(), cell.assistant.as_str()))
        .collect::<Vec<_>>();
    assert_eq!(
        order,
        vec![
            ("task-1", "alpha"),
            ("task-1", "beta"),
            ("task-2", "alpha"),
            ("task-2", "beta"),
        ]
    );
}

#[tokio::test]
async fn single_assistant_ignores_parallel_agents() {
    let gauge = Arc::new(Gauge::default());
    let environment = environment(vec![(
        "solo",
        ScriptedAdapter::new(&gauge, Duration::from_millis(1)),
    )]);

    let agent_events = Arc::new(AtomicUsize::new(0));
    let counter = agent_events.clone();
    let subscriber: Arc<dyn Subscriber<BenchmarkCell>> =
        Arc::new(move |_: &TaskEvent<'_, BenchmarkCell>| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let results = NestedScheduler::new(matrix(1, &["solo"], 3, true, 0), probe(8), environment)
        .subscribe_agents(subscriber)
        .run()
        .await
        .unwrap();

    assert_eq!(agent_events.load(Ordering::SeqCst), 0);
    assert_eq!(run_ids(&results.cells[0]), vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_runs_are_bounded_by_the_probe() {
    let gauge = Arc::new(Gauge::default());
    let environment = environment(vec![(
        "alpha",
        ScriptedAdapter::new(&gauge, Duration::from_millis(30)).failing_on(&[4]),
    )]);

    let run_events = Arc::new(Mutex::new(Vec::new()));
    let events = run_events.clone();
    let subscriber: Arc<dyn Subscriber<RunRecord>> =
        Arc::new(move |event: &TaskEvent<'_, RunRecord>| {
            events.lock().push((event.id().to_owned(), event.counts().0));
        });

    // 4 cores leave 3 slots, the request of 6 is capped
    let results = NestedScheduler::new(matrix(1, &["alpha"], 6, false, 8), probe(4), environment)
        .subscribe_runs(subscriber)
        .run()
        .await
        .unwrap();

    assert!(gauge.peak() <= 3);
    assert!(run_events.lock().iter().all(|(_, running)| *running <= 3));
    assert_eq!(run_events.lock().len(), 12);

    let cell = &results.cells[0];
    assert_eq!(run_ids(cell), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(cell.failures(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn nested_levels_multiply_their_limits() {
    let gauge = Arc::new(Gauge::default());
    let delay = Duration::from_millis(200);
    let environment = environment(vec![
        ("alpha", ScriptedAdapter::new(&gauge, delay)),
        ("beta", ScriptedAdapter::new(&gauge, delay)),
    ]);

    // 2 assistant slots times 3 run slots
    let matrix = matrix(1, &["alpha", "beta"], 3, true, 3);
    let results = NestedScheduler::new(matrix, probe(8), environment)
        .run()
        .await
        .unwrap();

    assert_eq!(results.total_runs(), 6);
    assert!(gauge.peak() > 3, "peak was {}", gauge.peak());
    assert!(gauge.peak() <= 6);
}

#[tokio::test]
async fn timed_out_trials_are_recorded_and_cancelled() {
    let gauge = Arc::new(Gauge::default());
    let environment = environment(vec![
        (
            "stuck",
            ScriptedAdapter::new(&gauge, Duration::from_millis(1)).hanging(),
        ),
        ("quick", ScriptedAdapter::new(&gauge, Duration::from_millis(1))),
    ]);

    let matrix = matrix(1, &["stuck", "quick"], 2, true, 2);
    let results = NestedScheduler::new(matrix, probe(8), environment)
        .with_trial_timeout(Some(Duration::from_millis(50)))
        .run()
        .await
        .unwrap();

    let stuck = results.cell("task-1", "stuck").unwrap();
    assert_eq!(run_ids(stuck), vec![1, 2]);
    for run in stuck.runs.iter() {
        assert!(run.error.as_deref().unwrap().contains("timed out"));
        assert_eq!(run.response_time_seconds, None);
        assert_eq!(run.metrics["score"], None);
    }

    let quick = results.cell("task-1", "quick").unwrap();
    assert_eq!(quick.failures(), 0);

    // the hanging work units are gone once the trials timed out
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gauge.current.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn invalid_matrices_are_rejected_before_scheduling() {
    let gauge = Arc::new(Gauge::default());
    let adapter = ScriptedAdapter::new(&gauge, Duration::from_millis(1));
    let environment = environment(vec![("alpha", adapter)]);

    let ghost = matrix(1, &["alpha", "ghost"], 1, true, 0);
    let missing = NestedScheduler::new(ghost, probe(8), environment.clone())
        .run()
        .await;
    assert!(matches!(missing, Err(SchedulerError::MissingAdapter(name)) if name == "ghost"));

    let twice = matrix(1, &["alpha", "alpha"], 1, true, 0);
    let duplicate = NestedScheduler::new(twice, probe(8), environment.clone())
        .run()
        .await;
    assert!(matches!(duplicate, Err(SchedulerError::DuplicateAssistant(_))));

    let empty = NestedScheduler::new(matrix(1, &[], 1, true, 0), probe(8), environment.clone())
        .run()
        .await;
    assert!(matches!(empty, Err(SchedulerError::NoAssistants)));

    let no_runs = NestedScheduler::new(matrix(1, &["alpha"], 0, false, 0), probe(8), environment)
        .run()
        .await;
    assert!(matches!(no_runs, Err(SchedulerError::NoRuns)));

    assert_eq!(gauge.peak(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_run_subscriber_keeps_full_coverage() {
    let gauge = Arc::new(Gauge::default());
    let delay = Duration::from_millis(2);
    let environment = environment(vec![
        ("alpha", ScriptedAdapter::new(&gauge, delay)),
        ("beta", ScriptedAdapter::new(&gauge, delay).failing_on(&[1])),
    ]);

    let subscriber: Arc<dyn Subscriber<RunRecord>> =
        Arc::new(|event: &TaskEvent<'_, RunRecord>| match event {
            TaskEvent::Complete { .. } | TaskEvent::Failed { .. } => {
                panic!("run subscriber failed")
            }
            TaskEvent::Start { .. } => {}
        });

    let matrix = matrix(2, &["alpha", "beta"], 3, true, 3);
    let results = NestedScheduler::new(matrix, probe(8), environment)
        .subscribe_runs(subscriber)
        .run()
        .await
        .unwrap();

    assert_eq!(results.total_runs(), 12);
    assert_eq!(results.cells.len(), 4);
    for cell in results.cells.iter() {
        assert_eq!(run_ids(cell), vec![1, 2, 3]);
    }

    // the panics never reach the records, only the scripted failure does
    let failures = results
        .cells
        .iter()
        .map(|cell| cell.failures())
        .sum::<usize>();
    assert_eq!(failures, 1);
    assert!(results
        .cells
        .iter()
        .flat_map(|cell| cell.runs.iter())
        .filter_map(|run| run.error.as_deref())
        .all(|error| error.contains("scripted failure")));
}
