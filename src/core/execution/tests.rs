use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::json;

use super::*;
use crate::core::remote::testing::FakeOrchestrator;
use crate::core::store::testing::{new_run, seeded_store};
use crate::core::store::{
    NewPrompt, NewRun, PromptFilter, PromptRecord, RunFilter, RunUpdate, SqliteStore, StoreError,
};

/// Delegates to SQLite but refuses to record `failed` for the listed runs.
struct RefusesFailure {
    inner: Arc<SqliteStore>,
    refuse: HashSet<String>,
}

#[async_trait]
impl EntityStore for RefusesFailure {
    async fn create_prompt(&self, prompt: NewPrompt) -> Result<PromptRecord, StoreError> {
        self.inner.create_prompt(prompt).await
    }
    async fn create_run(&self, run: NewRun) -> Result<Option<RunRecord>, StoreError> {
        self.inner.create_run(run).await
    }
    async fn get_prompt(&self, id: &str) -> Result<Option<PromptRecord>, StoreError> {
        self.inner.get_prompt(id).await
    }
    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        self.inner.get_run(id).await
    }
    async fn list_prompts(&self, filter: &PromptFilter) -> Result<Vec<PromptRecord>, StoreError> {
        self.inner.list_prompts(filter).await
    }
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StoreError> {
        self.inner.list_runs(filter).await
    }
    async fn search_prompts(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PromptRecord>, StoreError> {
        self.inner.search_prompts(query, limit).await
    }
    async fn update_run(&self, id: &str, update: RunUpdate) -> Result<bool, StoreError> {
        if update.status == RunStatus::Failed && self.refuse.contains(id) {
            return Err(StoreError::Corrupt {
                id: id.to_string(),
                reason: "disk full".to_string(),
            });
        }
        self.inner.update_run(id, update).await
    }
    async fn update_run_status(&self, id: &str, status: RunStatus) -> Result<bool, StoreError> {
        self.inner.update_run_status(id, status).await
    }
    async fn annotate_prompt(
        &self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.inner.annotate_prompt(id, key, value).await
    }
    async fn delete_run(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_run(id).await
    }
    async fn delete_prompt(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_prompt(id).await
    }
}

fn request(ids: &[&str], name: &str) -> BatchRequest {
    BatchRequest {
        batch_name: Some(name.to_string()),
        ..BatchRequest::new(ids.iter().map(|id| id.to_string()).collect())
    }
}

async fn status_of(store: &SqliteStore, id: &str) -> RunStatus {
    store.get_run(id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn batch_completes_runs_with_output_and_fails_the_rest() {
    let (store, _, runs) = seeded_store(3).await;
    let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
    let fake = Arc::new(FakeOrchestrator::with_batch_outputs(&[
        (ids[0], "outputs/run_a/output.mp4"),
        (ids[2], "outputs/run_c/output.mp4"),
    ]));
    let reconciler = BatchReconciler::new(store.clone(), fake.clone());

    let report = reconciler.execute(&request(&ids, "nightly")).await.unwrap();
    assert_eq!(report.total, 3);
    assert_eq!(report.successful_count(), 2);
    assert_eq!(report.failed, vec![ids[1].to_string()]);
    assert!(report.accounting_warnings.is_empty());
    assert!(report.outputs.is_none());

    let first = store.get_run(ids[0]).await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.output_path(), Some("outputs/run_a/output.mp4"));
    assert_eq!(first.outputs.get("batch_name"), Some(&json!("nightly")));
    assert_eq!(first.outputs.get("batch"), Some(&json!(true)));

    let second = store.get_run(ids[1]).await.unwrap().unwrap();
    assert_eq!(second.status, RunStatus::Failed);
    assert_eq!(second.error_message(), Some(NO_OUTPUT_ERROR));
    assert_eq!(status_of(&store, ids[2]).await, RunStatus::Completed);

    let calls = fake.batch_calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, ids.iter().map(|s| s.to_string()).collect::<Vec<_>>());
    assert_eq!(calls[0].1, "nightly");
}

#[tokio::test]
async fn whole_batch_failure_marks_every_run_failed() {
    let (store, _, runs) = seeded_store(2).await;
    let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
    let fake = Arc::new(FakeOrchestrator::with_batch_error("CUDA out of memory"));
    let reconciler = BatchReconciler::new(store.clone(), fake);

    let err = reconciler.execute(&request(&ids, "oom")).await.unwrap_err();
    match err {
        RunError::BatchExecution {
            message,
            accounting,
        } => {
            assert!(message.contains("CUDA out of memory"));
            assert!(accounting.is_empty());
        }
        other => panic!("unexpected error: {other}"),
    }
    for id in ids {
        let run = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message().unwrap().contains("CUDA out of memory"));
    }
}

#[tokio::test]
async fn no_run_is_left_running_after_a_batch() {
    let (store, _, runs) = seeded_store(4).await;
    let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
    let fake = Arc::new(FakeOrchestrator::with_batch_outputs(&[(
        ids[3],
        "outputs/run_d/output.mp4",
    )]));
    let reconciler = BatchReconciler::new(store.clone(), fake);
    reconciler.execute(&request(&ids, "sweep")).await.unwrap();

    for id in ids {
        assert!(status_of(&store, id).await.is_terminal());
    }
}

#[tokio::test]
async fn unfailable_runs_are_reported_as_accounting_warnings() {
    let (sqlite, _, runs) = seeded_store(2).await;
    let ids: Vec<&str> = runs.iter().map(|r| r.id.as_str()).collect();
    let store = Arc::new(RefusesFailure {
        inner: sqlite.clone(),
        refuse: HashSet::from([ids[0].to_string()]),
    });
    let fake = Arc::new(FakeOrchestrator::with_batch_error("ssh: connection reset"));
    let reconciler = BatchReconciler::new(store, fake);

    let err = reconciler.execute(&request(&ids, "flaky")).await.unwrap_err();
    let RunError::BatchExecution {
        message,
        accounting,
    } = err
    else {
        panic!("expected batch execution error");
    };
    assert!(message.contains("connection reset"));
    assert_eq!(accounting.len(), 1);
    assert_eq!(accounting[0].run_id, ids[0]);
    assert!(accounting[0].message.contains("disk full"));

    assert_eq!(status_of(&sqlite, ids[0]).await, RunStatus::Running);
    assert_eq!(status_of(&sqlite, ids[1]).await, RunStatus::Failed);
}

#[tokio::test]
async fn batch_aborts_before_invoking_orchestrator_when_a_run_cannot_start() {
    let (store, _, runs) = seeded_store(2).await;
    let lifecycle = RunLifecycle::new(store.clone());
    lifecycle.start(&runs[1].id).await.unwrap();

    let fake = Arc::new(FakeOrchestrator::with_batch_outputs(&[]));
    let reconciler = BatchReconciler::new(store.clone(), fake.clone());
    let ids = [runs[0].id.as_str(), runs[1].id.as_str()];
    let err = reconciler.execute(&request(&ids, "dup")).await.unwrap_err();

    assert!(matches!(err, RunError::InvalidState { .. }));
    assert!(fake.batch_calls.lock().unwrap().is_empty());
    assert_eq!(status_of(&store, &runs[0].id).await, RunStatus::Running);
}

#[tokio::test]
async fn unknown_run_fails_resolution_without_touching_others() {
    let (store, _, runs) = seeded_store(1).await;
    let fake = Arc::new(FakeOrchestrator::default());
    let reconciler = BatchReconciler::new(store.clone(), fake.clone());

    let err = reconciler
        .execute(&request(&[runs[0].id.as_str(), "rs_0000000000000000"], "missing"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("rs_0000000000000000"));
    assert_eq!(status_of(&store, &runs[0].id).await, RunStatus::Pending);
    assert!(fake.batch_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn repeated_ids_are_executed_once() {
    let (store, _, runs) = seeded_store(1).await;
    let id = runs[0].id.as_str();
    let fake = Arc::new(FakeOrchestrator::with_batch_outputs(&[(id, "out.mp4")]));
    let reconciler = BatchReconciler::new(store.clone(), fake.clone());

    let mut req = request(&[id, id], "twice");
    req.include_outputs = true;
    let report = reconciler.execute(&req).await.unwrap();
    assert_eq!(report.total, 1);
    assert_eq!(report.completed, vec![id.to_string()]);
    let outputs = report.outputs.unwrap();
    assert_eq!(outputs.get(id).map(String::as_str), Some("out.mp4"));
}

#[tokio::test]
async fn stray_outputs_are_not_reported() {
    let (store, _, runs) = seeded_store(1).await;
    let id = runs[0].id.as_str();
    let fake = Arc::new(FakeOrchestrator::with_batch_outputs(&[
        (id, "a.mp4"),
        ("rs_ffffffffffffffff", "b.mp4"),
    ]));
    let reconciler = BatchReconciler::new(store, fake);
    let mut req = request(&[id], "stray");
    req.include_outputs = true;
    let report = reconciler.execute(&req).await.unwrap();
    assert_eq!(report.outputs.unwrap().len(), 1);
}

#[tokio::test]
async fn single_run_success_records_artifacts() {
    let (store, _, runs) = seeded_store(1).await;
    let fake = Arc::new(FakeOrchestrator::with_run_result(Ok(RunArtifacts {
        output_path: PathBuf::from("outputs/run_x/output.mp4"),
        upscaled_path: Some(PathBuf::from("outputs/run_x/upscaled/output.mp4")),
    })));
    let executor = RunExecutor::new(store.clone(), fake.clone());

    let run = executor.execute(&runs[0].id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output_path(), Some("outputs/run_x/output.mp4"));
    assert_eq!(
        run.outputs.get("upscaled_path"),
        Some(&json!("outputs/run_x/upscaled/output.mp4"))
    );
    assert!(run.started_at.is_some());
    assert_eq!(*fake.run_calls.lock().unwrap(), vec![runs[0].id.clone()]);
}

#[tokio::test]
async fn single_run_failure_is_recorded_and_returned() {
    let (store, _, runs) = seeded_store(1).await;
    let fake = Arc::new(FakeOrchestrator::with_run_result(Err(
        "container exited 137".to_string(),
    )));
    let executor = RunExecutor::new(store.clone(), fake);

    let err = executor.execute(&runs[0].id).await.unwrap_err();
    assert!(matches!(err, RunError::Execution(ref m) if m.contains("exited 137")));
    let run = store.get_run(&runs[0].id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message().unwrap().contains("exited 137"));
}

#[tokio::test]
async fn single_run_with_deleted_prompt_fails_without_remote_call() {
    let (store, prompt, runs) = seeded_store(0).await;
    assert!(runs.is_empty());
    let run = store.create_run(new_run(&prompt.id)).await.unwrap().unwrap();
    store.delete_prompt(&prompt.id).await.unwrap();

    let fake = Arc::new(FakeOrchestrator::default());
    let executor = RunExecutor::new(store.clone(), fake.clone());
    let err = executor.execute(&run.id).await.unwrap_err();
    assert!(matches!(err, RunError::NotFound { .. }));
    assert_eq!(status_of(&store, &run.id).await, RunStatus::Failed);
    assert!(fake.run_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn completed_run_cannot_be_executed_again() {
    let (store, _, runs) = seeded_store(1).await;
    let fake = Arc::new(FakeOrchestrator::with_run_result(Ok(RunArtifacts {
        output_path: PathBuf::from("o.mp4"),
        upscaled_path: None,
    })));
    let executor = RunExecutor::new(store, fake);
    executor.execute(&runs[0].id).await.unwrap();
    let err = executor.execute(&runs[0].id).await.unwrap_err();
    assert!(matches!(err, RunError::InvalidState { .. }));
}
