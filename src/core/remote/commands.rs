//! Pure builders for the JSON specs and shell commands sent to the GPU host.
//!
//! Paths in specs are relative to the container working directory, which is the
//! remote checkout mounted at `/workspace`.

use std::path::Path;

use serde_json::{Map, Value, json};

use super::{ContainerInfo, RUNS_LABEL};
use crate::core::store::types::run_dir_name;
use crate::core::store::{PromptRecord, RunRecord};

pub const OUTPUT_FILE: &str = "output.mp4";
pub const UPSCALED_DIR: &str = "upscaled";

const INFERENCE_SCRIPT: &str = "cosmos_transfer1/diffusion/inference/transfer.py";
const CHECKPOINT_DIR: &str = "checkpoints";

/// Remote location (relative to the checkout) of an uploaded prompt input.
pub fn remote_input_path(prompt_id: &str, input_name: &str, local_path: &str) -> String {
    let extension = Path::new(local_path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
        .unwrap_or_default();
    format!("inputs/{}/{}{}", prompt_id, input_name, extension)
}

pub fn remote_spec_path(run_id: &str) -> String {
    format!("runs/{}/spec.json", run_id)
}

pub fn remote_output_dir(run_id: &str) -> String {
    format!("outputs/{}", run_dir_name(run_id))
}

pub fn batch_dir(batch_name: &str) -> String {
    format!("runs/batch_{}", batch_name)
}

/// Controlnet spec consumed by the transfer inference script.
pub fn build_run_spec(run: &RunRecord, prompt: &PromptRecord) -> Value {
    let cfg = &run.execution_config;
    let mut spec = Map::new();
    spec.insert("prompt".to_string(), json!(prompt.prompt_text));
    if let Some(negative) = &prompt.negative_prompt {
        spec.insert("negative_prompt".to_string(), json!(negative));
    }
    if let Some(video) = prompt.inputs.get("video") {
        spec.insert(
            "input_video_path".to_string(),
            json!(remote_input_path(&prompt.id, "video", video)),
        );
    }
    spec.insert("num_steps".to_string(), json!(cfg.num_steps));
    spec.insert("guidance".to_string(), json!(cfg.guidance));
    spec.insert("seed".to_string(), json!(cfg.seed));
    spec.insert("sigma_max".to_string(), json!(cfg.sigma_max));
    spec.insert("fps".to_string(), json!(cfg.fps));

    spec.insert(
        "vis".to_string(),
        json!({ "control_weight": cfg.weights.vis, "blur_strength": cfg.blur_strength }),
    );
    spec.insert(
        "edge".to_string(),
        json!({ "control_weight": cfg.weights.edge, "canny_threshold": cfg.canny_threshold }),
    );
    for (name, weight) in [("depth", cfg.weights.depth), ("seg", cfg.weights.seg)] {
        let mut control = Map::new();
        control.insert("control_weight".to_string(), json!(weight));
        if let Some(local) = prompt.inputs.get(name) {
            control.insert(
                "input_control".to_string(),
                json!(remote_input_path(&prompt.id, name, local)),
            );
        }
        spec.insert(name.to_string(), Value::Object(control));
    }
    Value::Object(spec)
}

/// Wrap `value` in single quotes for POSIX shells.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn container_name(label: &str) -> String {
    let sanitized: String = label
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("cosmos_{}", sanitized)
}

/// `torchrun` invocation for one run (`spec_path`) or one batch (`batch_path`).
fn inference_invocation(num_gpu: u32, save_folder: &str, input_flag: &str, input: &str) -> String {
    format!(
        "torchrun --nproc_per_node={n} --nnodes=1 --node_rank=0 {script} \
         --checkpoint_dir {ckpt} --video_save_folder {save} {flag} {input} \
         --num_gpus {n} --offload_text_encoder_model",
        n = num_gpu.max(1),
        script = INFERENCE_SCRIPT,
        ckpt = CHECKPOINT_DIR,
        save = shell_quote(save_folder),
        flag = input_flag,
        input = shell_quote(input),
    )
}

fn upscale_invocation(run: &RunRecord) -> String {
    let out_dir = remote_output_dir(&run.id);
    format!(
        "python3 {script} --checkpoint_dir {ckpt} --input_video {input} \
         --video_save_folder {save} --upscale --upscale_weight {weight}",
        script = INFERENCE_SCRIPT,
        ckpt = CHECKPOINT_DIR,
        input = shell_quote(&format!("{}/{}", out_dir, OUTPUT_FILE)),
        save = shell_quote(&format!("{}/{}", out_dir, UPSCALED_DIR)),
        weight = run.execution_config.upscale_weight,
    )
}

/// Shell script executed inside the container for a single run.
pub fn single_run_script(run: &RunRecord) -> String {
    let mut steps = vec![inference_invocation(
        1,
        &remote_output_dir(&run.id),
        "--controlnet_specs",
        &remote_spec_path(&run.id),
    )];
    if run.execution_config.upscale {
        steps.push(upscale_invocation(run));
    }
    steps.join(" && ")
}

/// Shell script for a batch: one inference pass over the JSONL, then each indexed
/// result is moved into its run's output directory. Missing results are skipped so
/// partial success survives to the reconciliation step.
pub fn batch_script(runs: &[&RunRecord], batch_name: &str, num_gpu: u32) -> String {
    let dir = batch_dir(batch_name);
    let mut steps = vec![inference_invocation(
        num_gpu,
        &format!("{}/results", dir),
        "--batch_input_path",
        &format!("{}/batch.jsonl", dir),
    )];
    for (index, run) in runs.iter().enumerate() {
        let result = format!("{}/results/video_{}.mp4", dir, index);
        let out_dir = remote_output_dir(&run.id);
        steps.push(format!(
            "if [ -f {result} ]; then mkdir -p {out} && mv {result} {out}/{file}; fi",
            result = shell_quote(&result),
            out = shell_quote(&out_dir),
            file = OUTPUT_FILE,
        ));
        if run.execution_config.upscale {
            steps.push(format!(
                "if [ -f {out}/{file} ]; then {upscale}; fi",
                out = shell_quote(&out_dir),
                file = OUTPUT_FILE,
                upscale = upscale_invocation(run),
            ));
        }
    }
    steps.join("; ")
}

pub struct DockerInvocation<'a> {
    pub image: &'a str,
    pub remote_dir: &'a str,
    pub container_name: &'a str,
    pub run_ids: &'a [String],
    pub cuda_devices: &'a str,
    pub script: &'a str,
}

pub fn docker_run_command(invocation: &DockerInvocation<'_>) -> String {
    format!(
        "docker run --rm --gpus all --ipc=host --name {name} --label {label}={ids} \
         -e CUDA_VISIBLE_DEVICES={devices} -v {dir}:/workspace -w /workspace {image} bash -lc {script}",
        name = shell_quote(invocation.container_name),
        label = RUNS_LABEL,
        ids = shell_quote(&invocation.run_ids.join(",")),
        devices = shell_quote(invocation.cuda_devices),
        dir = shell_quote(invocation.remote_dir),
        image = shell_quote(invocation.image),
        script = shell_quote(invocation.script),
    )
}

pub fn docker_ps_command() -> String {
    format!(
        "docker ps --filter label={label} --format '{{{{.Names}}}}|{{{{.Label \"{label}\"}}}}'",
        label = RUNS_LABEL
    )
}

/// Parse `name|id1,id2` lines emitted by [`docker_ps_command`].
pub fn parse_docker_ps(stdout: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let (name, ids) = line.split_once('|').unwrap_or((line, ""));
            ContainerInfo {
                name: name.trim().to_string(),
                run_ids: ids
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect(),
            }
        })
        .collect()
}

pub struct SshTarget<'a> {
    pub port: u16,
    pub ssh_key: Option<&'a str>,
}

/// Arguments shared by ssh and scp (`-p` vs `-P` differs).
pub fn connection_args(target: &SshTarget<'_>, port_flag: &str) -> Vec<String> {
    let mut args = vec![
        port_flag.to_string(),
        target.port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    if let Some(key) = target.ssh_key {
        args.push("-i".to_string());
        args.push(expand_home(key));
    }
    args
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().to_string(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::core::store::{ExecutionConfig, ModelType, RunStatus};

    fn prompt() -> PromptRecord {
        let mut inputs = BTreeMap::new();
        inputs.insert("video".to_string(), "/data/clips/street.mp4".to_string());
        inputs.insert("depth".to_string(), "/data/clips/street_depth.mp4".to_string());
        PromptRecord {
            id: "ps_1".to_string(),
            prompt_text: "rainy street".to_string(),
            negative_prompt: Some("blurry".to_string()),
            model_type: ModelType::Transfer,
            inputs,
            parameters: Map::new(),
            created_at: Utc::now(),
        }
    }

    fn run(id: &str, upscale: bool) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            prompt_id: "ps_1".to_string(),
            model_type: ModelType::Transfer,
            status: RunStatus::Pending,
            execution_config: ExecutionConfig {
                upscale,
                ..ExecutionConfig::default()
            },
            outputs: Map::new(),
            metadata: Map::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn spec_references_uploaded_inputs() {
        let spec = build_run_spec(&run("rs_1", false), &prompt());
        assert_eq!(spec["input_video_path"], json!("inputs/ps_1/video.mp4"));
        assert_eq!(
            spec["depth"]["input_control"],
            json!("inputs/ps_1/depth.mp4")
        );
        assert!(spec["seg"].get("input_control").is_none());
        assert_eq!(spec["negative_prompt"], json!("blurry"));
        assert_eq!(spec["num_steps"], json!(35));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn container_name_is_sanitized() {
        assert_eq!(container_name("batch nightly/1"), "cosmos_batch_nightly_1");
    }

    #[test]
    fn single_run_script_appends_upscale_pass() {
        let plain = single_run_script(&run("rs_1", false));
        assert!(plain.contains("--controlnet_specs 'runs/rs_1/spec.json'"));
        assert!(!plain.contains("--upscale"));

        let upscaled = single_run_script(&run("rs_1", true));
        assert!(upscaled.contains("--upscale_weight 0.5"));
        assert!(upscaled.contains("'outputs/run_rs_1/upscaled'"));
    }

    #[test]
    fn batch_script_moves_each_indexed_result() {
        let a = run("rs_a", false);
        let b = run("rs_b", false);
        let script = batch_script(&[&a, &b], "nightly", 4);
        assert!(script.contains("--nproc_per_node=4"));
        assert!(script.contains("'runs/batch_nightly/batch.jsonl'"));
        assert!(script.contains("video_0.mp4"));
        assert!(script.contains("'outputs/run_rs_b'"));
    }

    #[test]
    fn docker_command_labels_container_with_run_ids() {
        let ids = vec!["rs_a".to_string(), "rs_b".to_string()];
        let cmd = docker_run_command(&DockerInvocation {
            image: "cosmos:latest",
            remote_dir: "/home/ubuntu/cosmos",
            container_name: "cosmos_batch_x",
            run_ids: &ids,
            cuda_devices: "0,1",
            script: "echo hi",
        });
        assert!(cmd.contains("--label cosmos.runs='rs_a,rs_b'"));
        assert!(cmd.contains("-e CUDA_VISIBLE_DEVICES='0,1'"));
        assert!(cmd.ends_with("bash -lc 'echo hi'"));
    }

    #[test]
    fn parses_docker_ps_lines() {
        let out = "cosmos_rs_a|rs_a\ncosmos_batch_x|rs_b, rs_c\n\nstray\n";
        let containers = parse_docker_ps(out);
        assert_eq!(containers.len(), 3);
        assert_eq!(containers[1].run_ids, vec!["rs_b", "rs_c"]);
        assert!(containers[2].run_ids.is_empty());
        assert!(containers[0].carries("rs_a"));
    }

    #[test]
    fn docker_ps_format_escapes_braces() {
        let cmd = docker_ps_command();
        assert!(cmd.contains("{{.Names}}"));
        assert!(cmd.contains("{{.Label \"cosmos.runs\"}}"));
    }
}
