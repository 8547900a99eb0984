use crate::{
    collector::PromptRef,
    scheduler::{agent_task_id, merge_assistant_cells, BenchmarkCell, RunRecord},
    task::{BatchResult, TaskError, TaskOutcome},
};
use std::{collections::BTreeMap, path::PathBuf};

fn assistants() -> Vec<String> {
    ["alpha", "beta", "gamma"].map(str::to_owned).to_vec()
}

#[test]
pub fn failed_and_missing_assistant_tasks_fill_their_cells() {
    let prompt = PromptRef::from_path(PathBuf::from("prompts/fix.md"));
    let metric_names = vec!["score".to_owned()];

    let mut alpha = BenchmarkCell::new(prompt.clone(), "alpha".to_owned());
    for run_id in 1..=2 {
        alpha.push(RunRecord {
            run_id,
            response_time_seconds: Some(1.0),
            metrics: BTreeMap::from([("score".to_owned(), Some(1.0))]),
            error: None,
        });
    }

    // gamma never reports back
    let mut batch = BatchResult::new();
    batch.record(
        agent_task_id("beta"),
        TaskOutcome::Failed(TaskError::Panicked("assistant worker died".to_owned())),
    );
    batch.record(agent_task_id("alpha"), TaskOutcome::Succeeded(alpha.clone()));

    let cells = merge_assistant_cells(&prompt, &assistants(), 2, batch, &metric_names);

    let order = cells
        .iter()
        .map(|cell| cell.assistant.as_str())
        .collect::<Vec<_>>();
    assert_eq!(order, vec!["alpha", "beta", "gamma"]);
    assert_eq!(cells[0], alpha);

    for cell in &cells[1..] {
        assert_eq!(cell.prompt, prompt);
        assert_eq!(cell.failures(), 2);

        let run_ids = cell.runs.iter().map(|run| run.run_id).collect::<Vec<_>>();
        assert_eq!(run_ids, vec![1, 2]);

        for run in cell.runs.iter() {
            assert_eq!(run.response_time_seconds, None);
            assert_eq!(run.metrics, BTreeMap::from([("score".to_owned(), None)]));
        }
    }

    assert!(cells[1].runs[0].error.as_deref().unwrap().contains("assistant worker died"));
    assert_eq!(cells[2].runs[0].error.as_deref(), Some("no outcome recorded"));
}

#[test]
pub fn failed_cell_numbers_every_run() {
    let prompt = PromptRef::from_path(PathBuf::from("prompts/fix.md"));
    let cell = BenchmarkCell::failed(&prompt, "alpha", 3, "timed out", &[]);

    assert_eq!(cell.assistant, "alpha");
    assert_eq!(cell.failures(), 3);
    assert_eq!(
        cell.runs.iter().map(|run| run.run_id).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert!(cell.runs.iter().all(|run| run.metrics.is_empty()));
}
