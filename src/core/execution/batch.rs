use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::core::errors::{AccountingWarning, RunError};
use crate::core::lifecycle::RunLifecycle;
use crate::core::remote::{BatchOutputs, GpuOrchestrator};
use crate::core::store::types::OUTPUT_PATH_KEY;
use crate::core::store::{EntityStore, PromptRecord, RunRecord};

pub const NO_OUTPUT_ERROR: &str = "No output generated in batch";

pub fn default_batch_name() -> String {
    format!("batch_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub run_ids: Vec<String>,
    pub batch_name: Option<String>,
    pub num_gpu: u32,
    pub cuda_devices: String,
    pub include_outputs: bool,
}

impl BatchRequest {
    pub fn new(run_ids: Vec<String>) -> Self {
        Self {
            run_ids,
            batch_name: None,
            num_gpu: 1,
            cuda_devices: "0".to_string(),
            include_outputs: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub batch_name: String,
    pub total: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub accounting_warnings: Vec<AccountingWarning>,
}

impl BatchReport {
    pub fn successful_count(&self) -> usize {
        self.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }
}

/// Runs a set of runs as one orchestrator call and settles every member into a
/// terminal state before returning.
pub struct BatchReconciler {
    store: Arc<dyn EntityStore>,
    lifecycle: RunLifecycle,
    orchestrator: Arc<dyn GpuOrchestrator>,
}

impl BatchReconciler {
    pub fn new(store: Arc<dyn EntityStore>, orchestrator: Arc<dyn GpuOrchestrator>) -> Self {
        Self {
            lifecycle: RunLifecycle::new(store.clone()),
            store,
            orchestrator,
        }
    }

    /// Load every run and its prompt, failing on the first missing ID.
    /// Repeated run IDs are collapsed, keeping first-seen order.
    pub async fn resolve(
        &self,
        run_ids: &[String],
    ) -> Result<Vec<(RunRecord, PromptRecord)>, RunError> {
        if run_ids.is_empty() {
            return Err(RunError::Invalid {
                field: "batch",
                reason: "at least one run ID is required".to_string(),
            });
        }
        let mut seen = HashSet::new();
        let mut pairs = Vec::with_capacity(run_ids.len());
        for run_id in run_ids {
            if !seen.insert(run_id.as_str()) {
                debug!(run_id = %run_id, "Ignoring repeated run in batch");
                continue;
            }
            let run = self
                .store
                .get_run(run_id)
                .await?
                .ok_or_else(|| RunError::run_not_found(run_id.as_str()))?;
            let prompt = self
                .store
                .get_prompt(&run.prompt_id)
                .await?
                .ok_or_else(|| RunError::prompt_not_found(run.prompt_id.as_str()))?;
            pairs.push((run, prompt));
        }
        Ok(pairs)
    }

    pub async fn execute(&self, request: &BatchRequest) -> Result<BatchReport, RunError> {
        let pairs = self.resolve(&request.run_ids).await?;
        let batch_name = request
            .batch_name
            .clone()
            .unwrap_or_else(default_batch_name);
        info!(batch = %batch_name, runs = pairs.len(), "Starting batch");

        // Runs already moved to running stay there if a later start fails.
        let mut started = Vec::with_capacity(pairs.len());
        for (run, prompt) in &pairs {
            started.push((self.lifecycle.start(&run.id).await?, prompt.clone()));
        }

        let result = self
            .orchestrator
            .execute_batch_runs(
                &started,
                &batch_name,
                request.num_gpu,
                &request.cuda_devices,
            )
            .await;

        match result {
            Err(e) => {
                let message = e.to_string();
                error!(batch = %batch_name, "Batch execution failed: {}", message);
                let accounting = self.fail_all(&started, &message).await;
                Err(RunError::BatchExecution {
                    message,
                    accounting,
                })
            }
            Ok(outputs) => Ok(self
                .reconcile(&started, &batch_name, outputs, request.include_outputs)
                .await),
        }
    }

    /// Best-effort: a run that cannot be marked failed becomes an accounting warning.
    async fn fail_all(
        &self,
        pairs: &[(RunRecord, PromptRecord)],
        message: &str,
    ) -> Vec<AccountingWarning> {
        let mut accounting = Vec::new();
        for (run, _) in pairs {
            if let Err(e) = self.lifecycle.fail(&run.id, message, None).await {
                warn!(run_id = %run.id, "Could not mark run failed after batch error: {}", e);
                accounting.push(AccountingWarning {
                    run_id: run.id.clone(),
                    message: e.to_string(),
                });
            }
        }
        accounting
    }

    async fn reconcile(
        &self,
        pairs: &[(RunRecord, PromptRecord)],
        batch_name: &str,
        outputs: BatchOutputs,
        include_outputs: bool,
    ) -> BatchReport {
        let mut report = BatchReport {
            batch_name: batch_name.to_string(),
            total: pairs.len(),
            completed: Vec::new(),
            failed: Vec::new(),
            outputs: None,
            accounting_warnings: Vec::new(),
        };

        for (run, _) in pairs {
            let outcome = match outputs.outputs.get(&run.id) {
                Some(path) => {
                    let mut run_outputs = batch_metadata(batch_name);
                    run_outputs.insert(
                        OUTPUT_PATH_KEY.to_string(),
                        json!(path.to_string_lossy()),
                    );
                    self.lifecycle
                        .complete(&run.id, run_outputs)
                        .await
                        .map(|_| true)
                }
                None => self
                    .lifecycle
                    .fail(&run.id, NO_OUTPUT_ERROR, Some(batch_metadata(batch_name)))
                    .await
                    .map(|_| false),
            };
            match outcome {
                Ok(true) => report.completed.push(run.id.clone()),
                Ok(false) => report.failed.push(run.id.clone()),
                Err(e) => {
                    warn!(run_id = %run.id, "Could not reconcile batch result: {}", e);
                    report.accounting_warnings.push(AccountingWarning {
                        run_id: run.id.clone(),
                        message: e.to_string(),
                    });
                    report.failed.push(run.id.clone());
                }
            }
        }

        let members: HashSet<&str> = pairs.iter().map(|(run, _)| run.id.as_str()).collect();
        for stray in outputs.outputs.keys().filter(|id| !members.contains(id.as_str())) {
            warn!(run_id = %stray, batch = batch_name, "Orchestrator returned output for a run outside the batch");
        }

        if include_outputs {
            report.outputs = Some(
                outputs
                    .outputs
                    .into_iter()
                    .filter(|(id, _)| members.contains(id.as_str()))
                    .map(|(id, path)| (id, path.to_string_lossy().to_string()))
                    .collect(),
            );
        }

        info!(
            batch = batch_name,
            completed = report.successful_count(),
            failed = report.failed_count(),
            "Batch reconciled"
        );
        report
    }
}

fn batch_metadata(batch_name: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("batch_name".to_string(), json!(batch_name));
    map.insert("batch".to_string(), json!(true));
    map
}
