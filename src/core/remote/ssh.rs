use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::commands::{
    self, DockerInvocation, OUTPUT_FILE, SshTarget, UPSCALED_DIR, build_run_spec, connection_args,
    container_name, docker_run_command, remote_input_path, remote_output_dir, remote_spec_path,
};
use super::{BatchOutputs, ContainerInfo, GpuOrchestrator, OrchestratorError, RunArtifacts};
use crate::core::config::RemoteConfig;
use crate::core::store::types::run_dir_name;
use crate::core::store::{PromptRecord, RunRecord};

/// Runs inference on a GPU host by shelling out to `ssh`/`scp` and `docker`.
pub struct SshDockerOrchestrator {
    remote: RemoteConfig,
    outputs_dir: PathBuf,
}

impl SshDockerOrchestrator {
    pub fn new(remote: RemoteConfig, outputs_dir: PathBuf) -> Self {
        Self {
            remote,
            outputs_dir,
        }
    }

    fn target(&self) -> SshTarget<'_> {
        SshTarget {
            port: self.remote.port,
            ssh_key: self.remote.ssh_key.as_deref(),
        }
    }

    fn ensure_configured(&self) -> Result<(), OrchestratorError> {
        if self.remote.is_configured() {
            Ok(())
        } else {
            Err(OrchestratorError::NotConfigured)
        }
    }

    fn remote_path(&self, relative: &str) -> String {
        format!("{}/{}", self.remote.remote_dir.trim_end_matches('/'), relative)
    }

    fn ssh(&self, remote_command: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(connection_args(&self.target(), "-p"))
            .arg(self.remote.target())
            .arg(remote_command);
        cmd
    }

    async fn run_remote(&self, remote_command: &str) -> Result<String, OrchestratorError> {
        debug!(command = remote_command, "ssh");
        let output = run_checked(self.ssh(remote_command), "ssh").await?;
        Ok(String::from_utf8_lossy(&output).to_string())
    }

    /// Write `content` to a remote file through ssh stdin.
    async fn upload_text(&self, relative: &str, content: &str) -> Result<(), OrchestratorError> {
        let path = self.remote_path(relative);
        let parent = path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or(".");
        let remote_command = format!(
            "mkdir -p {} && cat > {}",
            commands::shell_quote(parent),
            commands::shell_quote(&path)
        );
        let mut child = self
            .ssh(&remote_command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| OrchestratorError::Spawn {
                program: "ssh".to_string(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(content.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        let output = child.wait_with_output().await?;
        check_status("ssh upload", &output)?;
        Ok(())
    }

    async fn upload_file(&self, local: &Path, relative: &str) -> Result<(), OrchestratorError> {
        let path = self.remote_path(relative);
        if let Some((dir, _)) = path.rsplit_once('/') {
            self.run_remote(&format!("mkdir -p {}", commands::shell_quote(dir)))
                .await?;
        }
        let mut cmd = Command::new("scp");
        cmd.args(connection_args(&self.target(), "-P"))
            .arg(local)
            .arg(format!("{}:{}", self.remote.target(), path));
        run_checked(cmd, "scp").await?;
        Ok(())
    }

    /// Copy `outputs/run_<id>` from the host into the local outputs directory.
    async fn download_run_dir(&self, run_id: &str) -> Result<PathBuf, OrchestratorError> {
        tokio::fs::create_dir_all(&self.outputs_dir).await?;
        let mut cmd = Command::new("scp");
        cmd.args(connection_args(&self.target(), "-P"))
            .arg("-r")
            .arg(format!(
                "{}:{}",
                self.remote.target(),
                self.remote_path(&remote_output_dir(run_id))
            ))
            .arg(&self.outputs_dir);
        run_checked(cmd, "scp").await?;
        Ok(self.outputs_dir.join(run_dir_name(run_id)))
    }

    async fn upload_prompt_inputs(&self, prompt: &PromptRecord) -> Result<(), OrchestratorError> {
        for (name, local) in &prompt.inputs {
            let relative = remote_input_path(&prompt.id, name, local);
            info!(prompt_id = %prompt.id, input = %name, "Uploading input");
            self.upload_file(Path::new(local), &relative).await?;
        }
        Ok(())
    }

    async fn run_container(
        &self,
        name: &str,
        run_ids: &[String],
        cuda_devices: &str,
        script: &str,
    ) -> Result<(), OrchestratorError> {
        let docker = docker_run_command(&DockerInvocation {
            image: &self.remote.docker_image,
            remote_dir: &self.remote.remote_dir,
            container_name: name,
            run_ids,
            cuda_devices,
            script,
        });
        info!(container = name, runs = run_ids.len(), "Launching container");
        self.run_remote(&docker).await?;
        Ok(())
    }

    fn artifacts_in(&self, local_dir: &Path) -> Option<RunArtifacts> {
        let output_path = local_dir.join(OUTPUT_FILE);
        if !output_path.is_file() {
            return None;
        }
        let upscaled = local_dir.join(UPSCALED_DIR).join(OUTPUT_FILE);
        Some(RunArtifacts {
            output_path,
            upscaled_path: upscaled.is_file().then_some(upscaled),
        })
    }
}

async fn run_checked(mut cmd: Command, program: &str) -> Result<Vec<u8>, OrchestratorError> {
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| OrchestratorError::Spawn {
            program: program.to_string(),
            source,
        })?;
    check_status(program, &output)?;
    Ok(output.stdout)
}

fn check_status(program: &str, output: &std::process::Output) -> Result<(), OrchestratorError> {
    if output.status.success() {
        return Ok(());
    }
    Err(OrchestratorError::CommandFailed {
        command: program.to_string(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

#[async_trait]
impl GpuOrchestrator for SshDockerOrchestrator {
    async fn execute_run(
        &self,
        run: &RunRecord,
        prompt: &PromptRecord,
    ) -> Result<RunArtifacts, OrchestratorError> {
        self.ensure_configured()?;
        self.upload_prompt_inputs(prompt).await?;
        let spec = serde_json::to_string_pretty(&build_run_spec(run, prompt))?;
        self.upload_text(&remote_spec_path(&run.id), &spec).await?;

        let ids = vec![run.id.clone()];
        self.run_container(
            &container_name(&run.id),
            &ids,
            "0",
            &commands::single_run_script(run),
        )
        .await?;

        let local_dir = self.download_run_dir(&run.id).await?;
        self.artifacts_in(&local_dir).ok_or_else(|| {
            OrchestratorError::MissingOutput(format!(
                "inference finished but {} was not produced",
                local_dir.join(OUTPUT_FILE).display()
            ))
        })
    }

    async fn execute_batch_runs(
        &self,
        pairs: &[(RunRecord, PromptRecord)],
        batch_name: &str,
        num_gpu: u32,
        cuda_devices: &str,
    ) -> Result<BatchOutputs, OrchestratorError> {
        self.ensure_configured()?;
        let mut lines = Vec::with_capacity(pairs.len());
        let mut uploaded = std::collections::HashSet::new();
        for (run, prompt) in pairs {
            if uploaded.insert(prompt.id.clone()) {
                self.upload_prompt_inputs(prompt).await?;
            }
            lines.push(serde_json::to_string(&build_run_spec(run, prompt))?);
        }
        let batch_file = format!("{}/batch.jsonl", commands::batch_dir(batch_name));
        self.upload_text(&batch_file, &lines.join("\n")).await?;

        let runs: Vec<&RunRecord> = pairs.iter().map(|(run, _)| run).collect();
        let ids: Vec<String> = runs.iter().map(|run| run.id.clone()).collect();
        self.run_container(
            &container_name(&format!("batch_{}", batch_name)),
            &ids,
            cuda_devices,
            &commands::batch_script(&runs, batch_name, num_gpu),
        )
        .await?;

        let mut outputs = BatchOutputs::default();
        for run in runs {
            match self.download_run_dir(&run.id).await {
                Ok(local_dir) => {
                    if let Some(artifacts) = self.artifacts_in(&local_dir) {
                        outputs.outputs.insert(run.id.clone(), artifacts.output_path);
                    }
                }
                Err(e) => warn!(run_id = %run.id, "No output downloaded: {}", e),
            }
        }
        Ok(outputs)
    }

    async fn active_containers(&self) -> Result<Vec<ContainerInfo>, OrchestratorError> {
        self.ensure_configured()?;
        let stdout = self.run_remote(&commands::docker_ps_command()).await?;
        Ok(commands::parse_docker_ps(&stdout))
    }
}
