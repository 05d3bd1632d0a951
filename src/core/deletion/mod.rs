//! Cascading deletion of prompts and runs, always split into preview and execute.
//!
//! Confirmation is the caller's job. Business refusals (unknown ID, active runs)
//! come back as `success: false` outcomes; only store failures are `Err`.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::core::errors::RunError;
use crate::core::store::types::run_dir_name;
use crate::core::store::{EntityStore, PromptRecord, RunFilter, RunRecord, RunStatus, StoreError};

pub const ACTIVE_RUNS_ERROR: &str = "Cannot delete prompt with active runs";

#[derive(Debug, Clone, Default, Serialize)]
pub struct PromptDeletionPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<PromptRecord>,
    pub runs: Vec<RunRecord>,
    pub directories: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PromptDeletionPreview {
    pub fn active_runs(&self) -> impl Iterator<Item = &RunRecord> {
        self.runs.iter().filter(|run| run.status.is_active())
    }

    /// The outcome `delete_prompt` would return without touching anything, if any.
    pub fn refusal(&self) -> Option<DeletionOutcome> {
        if let Some(error) = &self.error {
            return Some(DeletionOutcome::refused(error.clone()));
        }
        if self.active_runs().next().is_some() {
            return Some(DeletionOutcome::refused(ACTIVE_RUNS_ERROR));
        }
        None
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunDeletionPreview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletionOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_prompt: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted_runs: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub deleted_directories: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl DeletionOutcome {
    fn refused(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

pub struct DeletionPlanner {
    store: Arc<dyn EntityStore>,
    outputs_dir: PathBuf,
}

impl DeletionPlanner {
    pub fn new(store: Arc<dyn EntityStore>, outputs_dir: PathBuf) -> Self {
        Self { store, outputs_dir }
    }

    pub fn run_directory(&self, run_id: &str) -> PathBuf {
        self.outputs_dir.join(run_dir_name(run_id))
    }

    async fn existing_directory(&self, run_id: &str) -> Option<PathBuf> {
        let dir = self.run_directory(run_id);
        // An unstat-able directory is still listed so the user sees it.
        match tokio::fs::try_exists(&dir).await {
            Ok(false) => None,
            Ok(true) | Err(_) => Some(dir),
        }
    }

    pub async fn preview_prompt_deletion(
        &self,
        prompt_id: &str,
    ) -> Result<PromptDeletionPreview, StoreError> {
        let Some(prompt) = self.store.get_prompt(prompt_id).await? else {
            return Ok(PromptDeletionPreview {
                error: Some(RunError::prompt_not_found(prompt_id).to_string()),
                ..PromptDeletionPreview::default()
            });
        };
        let runs = self
            .store
            .list_runs(&RunFilter {
                prompt_id: Some(prompt_id.to_string()),
                ..RunFilter::default()
            })
            .await?;
        let mut directories = Vec::new();
        for run in &runs {
            if let Some(dir) = self.existing_directory(&run.id).await {
                directories.push(dir);
            }
        }
        Ok(PromptDeletionPreview {
            prompt: Some(prompt),
            runs,
            directories,
            error: None,
        })
    }

    /// Deletes every run of the prompt, their output directories, then the prompt.
    /// Refused while any run is pending or running.
    pub async fn delete_prompt(&self, prompt_id: &str) -> Result<DeletionOutcome, StoreError> {
        let preview = self.preview_prompt_deletion(prompt_id).await?;
        if let Some(refusal) = preview.refusal() {
            let active = preview.active_runs().count();
            warn!(prompt_id, active, "Refusing to delete prompt: {:?}", refusal.error);
            return Ok(refusal);
        }

        let mut outcome = DeletionOutcome {
            success: true,
            ..DeletionOutcome::default()
        };
        for run in &preview.runs {
            if self.store.delete_run(&run.id).await? {
                outcome.deleted_runs.push(run.id.clone());
            }
            self.remove_directory(&run.id, &mut outcome).await;
        }
        if self.store.delete_prompt(prompt_id).await? {
            outcome.deleted_prompt = Some(prompt_id.to_string());
        }
        info!(
            prompt_id,
            runs = outcome.deleted_runs.len(),
            directories = outcome.deleted_directories.len(),
            "Deleted prompt"
        );
        Ok(outcome)
    }

    pub async fn preview_run_deletion(
        &self,
        run_id: &str,
    ) -> Result<RunDeletionPreview, StoreError> {
        let Some(run) = self.store.get_run(run_id).await? else {
            return Ok(RunDeletionPreview {
                error: Some(RunError::run_not_found(run_id).to_string()),
                ..RunDeletionPreview::default()
            });
        };
        let mut warnings = Vec::new();
        if run.status == RunStatus::Running {
            warnings.push(format!(
                "Run {} is still running; its container may keep writing outputs",
                run.id
            ));
        }
        Ok(RunDeletionPreview {
            directory: self.existing_directory(&run.id).await,
            run: Some(run),
            warnings,
            error: None,
        })
    }

    /// Running runs may be deleted; the outcome carries a warning for them.
    pub async fn delete_run(&self, run_id: &str) -> Result<DeletionOutcome, StoreError> {
        let preview = self.preview_run_deletion(run_id).await?;
        if let Some(error) = preview.error {
            return Ok(DeletionOutcome::refused(error));
        }
        for warning in &preview.warnings {
            warn!(run_id, "{}", warning);
        }
        let mut outcome = DeletionOutcome {
            success: true,
            warnings: preview.warnings,
            ..DeletionOutcome::default()
        };
        if self.store.delete_run(run_id).await? {
            outcome.deleted_runs.push(run_id.to_string());
        }
        self.remove_directory(run_id, &mut outcome).await;
        info!(run_id, "Deleted run");
        Ok(outcome)
    }

    async fn remove_directory(&self, run_id: &str, outcome: &mut DeletionOutcome) {
        let dir = self.run_directory(run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => outcome.deleted_directories.push(dir),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                warn!(run_id, dir = %dir.display(), "Could not remove output directory: {}", e);
                outcome
                    .warnings
                    .push(format!("Could not remove {}: {}", dir.display(), e));
            }
        }
    }
}
