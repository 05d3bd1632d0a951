use anyhow::Result;
use console::style;
use serde_json::Map;

use super::{Context, ShowArgs, flag_value, parse_number, print_json, reject_flag, usage};
use crate::core::errors::RunError;
use crate::core::execution::RunExecutor;
use crate::core::lifecycle::RunLifecycle;
use crate::core::store::{ControlWeights, ExecutionConfig, ModelType, NewRun, RunFilter, RunStatus};
use crate::core::terminal::{
    GuideSection, print_info, print_status, print_step, print_success, styled_status,
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CreateRunArgs {
    pub prompt_id: String,
    pub config: ExecutionConfig,
}

pub(crate) fn parse_create_run(args: &[String], start: usize) -> Result<CreateRunArgs> {
    let mut prompt_id = None;
    let mut config = ExecutionConfig::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--weights" => {
                config.weights = ControlWeights::parse_list(&flag_value(args, i)?).map_err(usage)?;
                i += 2;
            }
            "--steps" => {
                config.num_steps = parse_number("--steps", &flag_value(args, i)?)?;
                i += 2;
            }
            "--guidance" => {
                config.guidance = parse_number("--guidance", &flag_value(args, i)?)?;
                i += 2;
            }
            "--seed" => {
                config.seed = parse_number("--seed", &flag_value(args, i)?)?;
                i += 2;
            }
            "--upscale" => {
                config.upscale = true;
                i += 1;
            }
            "--upscale-weight" => {
                config.upscale_weight = parse_number("--upscale-weight", &flag_value(args, i)?)?;
                i += 2;
            }
            flag if flag.starts_with("--") => return Err(reject_flag(flag)),
            value => {
                if prompt_id.is_some() {
                    return Err(usage(format!("unexpected argument: {}", value)));
                }
                prompt_id = Some(value.to_string());
                i += 1;
            }
        }
    }
    let prompt_id =
        prompt_id.ok_or_else(|| usage("Usage: cosmos create run <prompt_id> [options]"))?;
    config.validate().map_err(usage)?;
    Ok(CreateRunArgs { prompt_id, config })
}

pub async fn run_create(ctx: &Context, parsed: CreateRunArgs) -> Result<()> {
    let lifecycle = RunLifecycle::new(ctx.store.clone());
    let run = lifecycle
        .create_run(NewRun {
            prompt_id: parsed.prompt_id,
            execution_config: parsed.config,
            metadata: Map::new(),
        })
        .await?;
    print_success(&format!("Created run {}", run.id));
    print_status("Prompt", &run.prompt_id);
    print_status("Status", &styled_status(run.status));
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ListRunsArgs {
    pub status: Option<RunStatus>,
    pub model: Option<ModelType>,
    pub prompt_id: Option<String>,
    pub limit: Option<usize>,
    pub json: bool,
}

pub(crate) fn parse_list_runs(args: &[String], start: usize) -> Result<ListRunsArgs> {
    let mut parsed = ListRunsArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--status" => {
                let raw = flag_value(args, i)?;
                parsed.status = Some(
                    RunStatus::from_status(&raw)
                        .ok_or_else(|| usage(format!("unknown run status '{}'", raw)))?,
                );
                i += 2;
            }
            "--model" => {
                let raw = flag_value(args, i)?;
                parsed.model = Some(
                    ModelType::from_name(&raw)
                        .ok_or_else(|| usage(format!("unknown model type '{}'", raw)))?,
                );
                i += 2;
            }
            "--prompt" => {
                parsed.prompt_id = Some(flag_value(args, i)?);
                i += 2;
            }
            "--limit" => {
                parsed.limit = Some(parse_number("--limit", &flag_value(args, i)?)?);
                i += 2;
            }
            "--json" => {
                parsed.json = true;
                i += 1;
            }
            other => return Err(reject_flag(other)),
        }
    }
    Ok(parsed)
}

pub async fn run_list(ctx: &Context, parsed: ListRunsArgs) -> Result<()> {
    let runs = ctx
        .store
        .list_runs(&RunFilter {
            status: parsed.status,
            model_type: parsed.model,
            prompt_id: parsed.prompt_id,
            limit: parsed.limit,
        })
        .await?;
    if parsed.json {
        return print_json(&runs);
    }
    if runs.is_empty() {
        print_info("No runs found");
        return Ok(());
    }
    let mut section = GuideSection::new(&format!("Runs ({})", runs.len()));
    for run in &runs {
        section = section.bullet(&format!(
            "{} [{}] prompt {} · {}",
            style(&run.id).white().bold(),
            styled_status(run.status),
            run.prompt_id,
            run.created_at.format("%Y-%m-%d %H:%M")
        ));
    }
    section.print();
    println!();
    Ok(())
}

pub async fn run_show(ctx: &Context, parsed: ShowArgs) -> Result<()> {
    let run = ctx
        .store
        .get_run(&parsed.id)
        .await?
        .ok_or_else(|| RunError::run_not_found(parsed.id.as_str()))?;
    if parsed.json {
        return print_json(&run);
    }
    let cfg = &run.execution_config;
    let mut section = GuideSection::new(&format!("Run {}", run.id))
        .status("Prompt", &run.prompt_id)
        .status("Model", run.model_type.as_str())
        .status("Status", &styled_status(run.status))
        .status("Created", &run.created_at.to_rfc3339())
        .status(
            "Weights",
            &format!(
                "vis {} · edge {} · depth {} · seg {}",
                cfg.weights.vis, cfg.weights.edge, cfg.weights.depth, cfg.weights.seg
            ),
        )
        .status(
            "Sampling",
            &format!(
                "{} steps · guidance {} · seed {}",
                cfg.num_steps, cfg.guidance, cfg.seed
            ),
        );
    if let Some(started) = run.started_at {
        section = section.status("Started", &started.to_rfc3339());
    }
    if let Some(completed) = run.completed_at {
        section = section.status("Finished", &completed.to_rfc3339());
    }
    for (key, value) in &run.outputs {
        let shown = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
        section = section.status(key, &shown);
    }
    section.print();
    println!();
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InferenceArgs {
    pub run_id: String,
}

pub(crate) fn parse_inference(args: &[String], start: usize) -> Result<InferenceArgs> {
    match &args[start.min(args.len())..] {
        [run_id] if !run_id.starts_with("--") => Ok(InferenceArgs {
            run_id: run_id.clone(),
        }),
        _ => Err(usage("Usage: cosmos inference <run_id>")),
    }
}

pub async fn run_inference(ctx: &Context, parsed: InferenceArgs) -> Result<()> {
    print_step(&format!(
        "Running inference for {} on {}",
        parsed.run_id,
        ctx.config.remote.target()
    ));
    let executor = RunExecutor::new(ctx.store.clone(), ctx.orchestrator());
    let run = executor.execute(&parsed.run_id).await?;
    print_success(&format!("Run {} completed", run.id));
    if let Some(path) = run.output_path() {
        print_status("Output", path);
    }
    Ok(())
}
