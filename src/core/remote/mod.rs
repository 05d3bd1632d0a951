//! Boundary to the remote GPU host.
//!
//! The lifecycle and batch code only see [`GpuOrchestrator`]; the SSH + Docker
//! transport lives in [`ssh`] and the pure command/spec builders in [`commands`].

pub mod commands;
mod ssh;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::core::store::{PromptRecord, RunRecord};

pub use ssh::SshDockerOrchestrator;

/// Docker label carrying the comma-separated run IDs a container works on.
pub const RUNS_LABEL: &str = "cosmos.runs";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("failed to encode run spec: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("remote host is not configured (set [remote] host in cosmos.toml)")]
    NotConfigured,
    #[error("{0}")]
    MissingOutput(String),
    #[error("local filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

/// Files a single run produced, already copied into the local outputs directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RunArtifacts {
    pub output_path: PathBuf,
    pub upscaled_path: Option<PathBuf>,
}

/// Per-run result of one batch invocation. Runs missing from `outputs` produced nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutputs {
    pub outputs: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerInfo {
    pub name: String,
    pub run_ids: Vec<String>,
}

impl ContainerInfo {
    /// Label match, or the exact name a single-run container gets.
    pub fn carries(&self, run_id: &str) -> bool {
        self.run_ids.iter().any(|id| id == run_id)
            || self.name == commands::container_name(run_id)
    }
}

#[async_trait]
pub trait GpuOrchestrator: Send + Sync {
    async fn execute_run(
        &self,
        run: &RunRecord,
        prompt: &PromptRecord,
    ) -> Result<RunArtifacts, OrchestratorError>;

    /// Execute every pair in one remote invocation. An `Err` means the whole
    /// batch failed; an `Ok` may still cover only some of the runs.
    async fn execute_batch_runs(
        &self,
        pairs: &[(RunRecord, PromptRecord)],
        batch_name: &str,
        num_gpu: u32,
        cuda_devices: &str,
    ) -> Result<BatchOutputs, OrchestratorError>;

    async fn active_containers(&self) -> Result<Vec<ContainerInfo>, OrchestratorError>;
}
