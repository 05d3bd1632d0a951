use serde::Serialize;
use tracing::warn;

use super::VerifyError;
use crate::core::remote::{ContainerInfo, GpuOrchestrator};
use crate::core::store::{EntityStore, RunFilter, RunRecord, RunStatus};

/// Running runs with no container on the GPU host.
pub fn find_zombie_runs<'a>(
    running: &'a [RunRecord],
    containers: &[ContainerInfo],
) -> Vec<&'a RunRecord> {
    running
        .iter()
        .filter(|run| run.status == RunStatus::Running)
        .filter(|run| !containers.iter().any(|c| c.carries(&run.id)))
        .collect()
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ZombieReport {
    pub pending: Vec<RunRecord>,
    pub running: Vec<RunRecord>,
    pub containers: Vec<ContainerInfo>,
    pub zombies: Vec<String>,
    /// Set when the host could not be queried; zombies are then undetermined.
    pub remote_warning: Option<String>,
}

pub async fn detect_zombies(
    store: &dyn EntityStore,
    orchestrator: &dyn GpuOrchestrator,
) -> Result<ZombieReport, VerifyError> {
    let by_status = |status| RunFilter {
        status: Some(status),
        ..RunFilter::default()
    };
    let pending = store.list_runs(&by_status(RunStatus::Pending)).await?;
    let running = store.list_runs(&by_status(RunStatus::Running)).await?;

    let mut report = ZombieReport {
        pending,
        ..ZombieReport::default()
    };
    if running.is_empty() {
        return Ok(report);
    }

    match orchestrator.active_containers().await {
        Ok(containers) => {
            report.zombies = find_zombie_runs(&running, &containers)
                .into_iter()
                .map(|run| run.id.clone())
                .collect();
            report.containers = containers;
        }
        Err(e) => {
            warn!("Cannot list containers on GPU host: {}", e);
            report.remote_warning = Some(e.to_string());
        }
    }
    report.running = running;
    Ok(report)
}
