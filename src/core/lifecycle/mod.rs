//! Run lifecycle: the only code allowed to move a run between statuses.
//!
//! ```text
//! pending ──start──▶ running ──complete──▶ completed
//!    │                  │
//!    └──────fail────────┴──────fail──────▶ failed
//! ```
//!
//! `completed` and `failed` are terminal. Re-running means creating a new run.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::errors::RunError;
use crate::core::store::types::ERROR_KEY;
use crate::core::store::{EntityStore, NewRun, RunRecord, RunStatus, RunUpdate};

pub fn can_transition(from: RunStatus, to: RunStatus) -> bool {
    match from {
        RunStatus::Pending => matches!(to, RunStatus::Running | RunStatus::Failed),
        RunStatus::Running => matches!(to, RunStatus::Completed | RunStatus::Failed),
        RunStatus::Completed | RunStatus::Failed => false,
    }
}

#[derive(Clone)]
pub struct RunLifecycle {
    store: Arc<dyn EntityStore>,
}

impl RunLifecycle {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Create a run in `pending`. Fails with NotFound when the prompt does not exist.
    pub async fn create_run(&self, run: NewRun) -> Result<RunRecord, RunError> {
        run.execution_config
            .validate()
            .map_err(|reason| RunError::Invalid {
                field: "execution config",
                reason,
            })?;
        let prompt_id = run.prompt_id.clone();
        let record = self
            .store
            .create_run(run)
            .await?
            .ok_or_else(|| RunError::prompt_not_found(prompt_id))?;
        info!(run_id = %record.id, prompt_id = %record.prompt_id, "Created run");
        Ok(record)
    }

    pub async fn start(&self, run_id: &str) -> Result<RunRecord, RunError> {
        let run = self.load(run_id).await?;
        check_transition(&run, RunStatus::Running)?;
        let update = RunUpdate {
            status: RunStatus::Running,
            outputs: None,
            started_at: Some(Utc::now()),
            completed_at: None,
        };
        let run = self.apply(run, update).await?;
        info!(run_id, "Run started");
        Ok(run)
    }

    /// Move a running run to `completed`. The stored outputs become the previous
    /// outputs overlaid with `outputs`, so they are always a superset of the argument.
    pub async fn complete(
        &self,
        run_id: &str,
        outputs: Map<String, Value>,
    ) -> Result<RunRecord, RunError> {
        let run = self.load(run_id).await?;
        check_transition(&run, RunStatus::Completed)?;
        if outputs.is_empty() {
            return Err(RunError::EmptyOutputs(run_id.to_string()));
        }
        let mut merged = run.outputs.clone();
        merged.extend(outputs);
        let update = RunUpdate {
            status: RunStatus::Completed,
            outputs: Some(merged),
            started_at: None,
            completed_at: Some(Utc::now()),
        };
        let run = self.apply(run, update).await?;
        info!(run_id, output = ?run.output_path(), "Run completed");
        Ok(run)
    }

    /// Move a pending or running run to `failed`, replacing its outputs with the
    /// partial outputs plus the error message. The explicit message wins over any
    /// `error` key in `partial_outputs`.
    pub async fn fail(
        &self,
        run_id: &str,
        error_message: &str,
        partial_outputs: Option<Map<String, Value>>,
    ) -> Result<RunRecord, RunError> {
        let run = self.load(run_id).await?;
        check_transition(&run, RunStatus::Failed)?;
        let mut outputs = partial_outputs.unwrap_or_default();
        outputs.insert(
            ERROR_KEY.to_string(),
            Value::String(error_message.to_string()),
        );
        let update = RunUpdate {
            status: RunStatus::Failed,
            outputs: Some(outputs),
            started_at: None,
            completed_at: Some(Utc::now()),
        };
        let run = self.apply(run, update).await?;
        warn!(run_id, error = error_message, "Run failed");
        Ok(run)
    }

    async fn load(&self, run_id: &str) -> Result<RunRecord, RunError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| RunError::run_not_found(run_id))
    }

    async fn apply(&self, run: RunRecord, update: RunUpdate) -> Result<RunRecord, RunError> {
        debug!(run_id = %run.id, from = %run.status, to = %update.status, "Applying transition");
        if !self.store.update_run(&run.id, update.clone()).await? {
            return Err(RunError::run_not_found(run.id));
        }
        let RunUpdate {
            status,
            outputs,
            started_at,
            completed_at,
        } = update;
        Ok(RunRecord {
            status,
            outputs: outputs.unwrap_or(run.outputs),
            started_at: started_at.or(run.started_at),
            completed_at: completed_at.or(run.completed_at),
            ..run
        })
    }
}

fn check_transition(run: &RunRecord, to: RunStatus) -> Result<(), RunError> {
    if can_transition(run.status, to) {
        Ok(())
    } else {
        Err(RunError::InvalidState {
            run_id: run.id.clone(),
            from: run.status,
            to,
        })
    }
}
