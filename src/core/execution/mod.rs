//! Drives runs through the remote orchestrator.
//!
//! - [`RunExecutor`]: one run, one container.
//! - [`BatchReconciler`]: N runs, one container, per-run reconciliation of the shared result.

mod batch;

use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::core::errors::RunError;
use crate::core::lifecycle::RunLifecycle;
use crate::core::remote::{GpuOrchestrator, RunArtifacts};
use crate::core::store::types::OUTPUT_PATH_KEY;
use crate::core::store::{EntityStore, RunRecord, RunStatus};

pub use batch::{BatchReconciler, BatchReport, BatchRequest, NO_OUTPUT_ERROR, default_batch_name};

pub fn artifact_outputs(artifacts: &RunArtifacts) -> Map<String, Value> {
    let mut outputs = Map::new();
    outputs.insert(
        OUTPUT_PATH_KEY.to_string(),
        json!(artifacts.output_path.to_string_lossy()),
    );
    if let Some(upscaled) = &artifacts.upscaled_path {
        outputs.insert(
            "upscaled_path".to_string(),
            json!(upscaled.to_string_lossy()),
        );
    }
    outputs
}

pub struct RunExecutor {
    store: Arc<dyn EntityStore>,
    lifecycle: RunLifecycle,
    orchestrator: Arc<dyn GpuOrchestrator>,
}

impl RunExecutor {
    pub fn new(store: Arc<dyn EntityStore>, orchestrator: Arc<dyn GpuOrchestrator>) -> Self {
        Self {
            lifecycle: RunLifecycle::new(store.clone()),
            store,
            orchestrator,
        }
    }

    /// Execute one pending run to completion. Blocks until the remote call returns.
    pub async fn execute(&self, run_id: &str) -> Result<RunRecord, RunError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunError::run_not_found(run_id))?;

        let Some(prompt) = self.store.get_prompt(&run.prompt_id).await? else {
            if run.status == RunStatus::Pending {
                let message = format!("Prompt {} not found", run.prompt_id);
                if let Err(e) = self.lifecycle.fail(run_id, &message, None).await {
                    warn!(run_id, "Could not record missing prompt: {}", e);
                }
            }
            return Err(RunError::prompt_not_found(run.prompt_id));
        };

        let run = self.lifecycle.start(run_id).await?;
        info!(run_id, prompt_id = %prompt.id, "Executing run");

        match self.orchestrator.execute_run(&run, &prompt).await {
            Ok(artifacts) => {
                self.lifecycle
                    .complete(run_id, artifact_outputs(&artifacts))
                    .await
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(accounting) = self.lifecycle.fail(run_id, &message, None).await {
                    warn!(run_id, "Could not record run failure: {}", accounting);
                }
                Err(RunError::Execution(message))
            }
        }
    }
}

#[cfg(test)]
mod tests;
