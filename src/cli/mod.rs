mod batch;
mod delete;
mod prompts;
mod runs;
mod status;
mod verify;

use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use console::style;
use serde::Serialize;

use crate::core::config::{self, CosmosConfig};
use crate::core::remote::{GpuOrchestrator, SshDockerOrchestrator};
use crate::core::store::{EntityStore, SqliteStore};
use crate::core::terminal::{GuideSection, print_info};
use crate::logging;

/// Bad command-line input. `main` maps it to exit code 2.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct UsageError(pub String);

pub(crate) fn usage(message: impl Into<String>) -> anyhow::Error {
    UsageError(message.into()).into()
}

fn print_help() {
    GuideSection::new("Prompts")
        .command("create prompt", "Register a prompt and its input videos")
        .command("list prompts", "List prompts, newest first")
        .command("search", "Search prompt text")
        .command("show prompt", "Show one prompt and its runs")
        .command("annotate", "Attach a key=value parameter to a prompt")
        .print();

    GuideSection::new("Runs")
        .command("create run", "Create a pending run for a prompt")
        .command("list runs", "List runs, filterable by status/model/prompt")
        .command("show run", "Show one run")
        .command("inference", "Execute one run on the GPU host")
        .command("batch-inference", "Execute several runs in one container")
        .print();

    GuideSection::new("Maintenance")
        .command("delete", "Delete a prompt (with its runs) or a run")
        .command("verify", "Check database records against files on disk")
        .command("status", "Show active runs and detect zombies")
        .print();

    println!(
        "\n {} {} <command> [options] [-v|--verbose]\n",
        style("Usage:").bold(),
        style("cosmos").green()
    );
}

/// Everything a command needs, resolved once per invocation.
pub(crate) struct Context {
    pub data_dir: PathBuf,
    pub config: CosmosConfig,
    pub store: Arc<dyn EntityStore>,
}

impl Context {
    async fn open(data_dir: PathBuf, config: CosmosConfig) -> Result<Self> {
        let store = SqliteStore::open(config.database_path(&data_dir)).await?;
        Ok(Self {
            data_dir,
            config,
            store: Arc::new(store),
        })
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.config.outputs_dir(&self.data_dir)
    }

    pub fn orchestrator(&self) -> Arc<dyn GpuOrchestrator> {
        Arc::new(SshDockerOrchestrator::new(
            self.config.remote.clone(),
            self.outputs_dir(),
        ))
    }
}

/// Value following the flag at `i`.
pub(crate) fn flag_value(args: &[String], i: usize) -> Result<String> {
    args.get(i + 1)
        .cloned()
        .ok_or_else(|| usage(format!("{} requires a value", args[i])))
}

pub(crate) fn parse_number<T: FromStr>(flag: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| usage(format!("invalid value for {}: '{}'", flag, raw)))
}

pub(crate) fn reject_flag(arg: &str) -> anyhow::Error {
    usage(format!("unknown option: {}", arg))
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Informational line that must stay out of stdout when stdout carries JSON.
pub(crate) fn print_notice(json: bool, msg: &str) {
    if json {
        let _ = write_notice(&mut std::io::stderr(), msg);
    } else {
        print_info(msg);
    }
}

fn write_notice(out: &mut impl Write, msg: &str) -> std::io::Result<()> {
    writeln!(out, "{}", msg)
}

/// `show prompt|run <id> [--json]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShowArgs {
    pub id: String,
    pub json: bool,
}

fn parse_show_args(args: &[String], start: usize, what: &str) -> Result<ShowArgs> {
    let mut id = None;
    let mut json = false;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--json" => {
                json = true;
                i += 1;
            }
            flag if flag.starts_with("--") => return Err(reject_flag(flag)),
            value => {
                if id.is_some() {
                    return Err(usage(format!("unexpected argument: {}", value)));
                }
                id = Some(value.to_string());
                i += 1;
            }
        }
    }
    let id = id.ok_or_else(|| usage(format!("Usage: cosmos show {} <id>", what)))?;
    Ok(ShowArgs { id, json })
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    CreatePrompt(prompts::CreatePromptArgs),
    CreateRun(runs::CreateRunArgs),
    ListPrompts(prompts::ListPromptsArgs),
    ListRuns(runs::ListRunsArgs),
    Search(prompts::SearchArgs),
    ShowPrompt(ShowArgs),
    ShowRun(ShowArgs),
    Annotate(prompts::AnnotateArgs),
    Inference(runs::InferenceArgs),
    Batch(batch::BatchArgs),
    Delete(delete::DeleteArgs),
    Verify(verify::VerifyArgs),
    Status(status::StatusArgs),
}

/// Remove `-v`/`--verbose` wherever they appear.
pub(crate) fn strip_verbose(args: Vec<String>) -> (Vec<String>, bool) {
    let is_verbose = |arg: &str| arg == "-v" || arg == "--verbose";
    let verbose = args.iter().skip(1).any(|arg| is_verbose(arg));
    let args = args
        .into_iter()
        .enumerate()
        .filter(|(i, arg)| *i == 0 || !is_verbose(arg))
        .map(|(_, arg)| arg)
        .collect();
    (args, verbose)
}

/// `Ok(None)` means help was requested.
pub(crate) fn parse_command(args: &[String]) -> Result<Option<Command>> {
    let Some(cmd) = args.get(1).map(String::as_str) else {
        return Ok(None);
    };
    let sub = args.get(2).map(String::as_str).unwrap_or("");
    let command = match cmd {
        "create" => match sub {
            "prompt" => Command::CreatePrompt(prompts::parse_create_prompt(args, 3)?),
            "run" => Command::CreateRun(runs::parse_create_run(args, 3)?),
            _ => return Err(usage("Usage: cosmos create <prompt|run> ...")),
        },
        "list" | "ls" => match sub {
            "prompts" => Command::ListPrompts(prompts::parse_list_prompts(args, 3)?),
            "runs" => Command::ListRuns(runs::parse_list_runs(args, 3)?),
            _ => return Err(usage("Usage: cosmos list <prompts|runs> [options]")),
        },
        "search" => Command::Search(prompts::parse_search(args, 2)?),
        "show" => match sub {
            "prompt" => Command::ShowPrompt(parse_show_args(args, 3, "prompt")?),
            "run" => Command::ShowRun(parse_show_args(args, 3, "run")?),
            _ => return Err(usage("Usage: cosmos show <prompt|run> <id>")),
        },
        "annotate" => Command::Annotate(prompts::parse_annotate(args, 2)?),
        "inference" => Command::Inference(runs::parse_inference(args, 2)?),
        "batch-inference" => Command::Batch(batch::parse_batch_args(args, 2)?),
        "delete" => Command::Delete(delete::parse_delete_args(args, 2)?),
        "verify" => Command::Verify(verify::parse_verify_args(args, 2)?),
        "status" => Command::Status(status::parse_status_args(args, 2)?),
        "help" | "--help" | "-h" => return Ok(None),
        _ => return Err(usage(format!("Unknown command: {}", cmd))),
    };
    Ok(Some(command))
}

pub async fn run_main() -> Result<()> {
    let (args, verbose) = strip_verbose(std::env::args().collect());
    let command = match parse_command(&args) {
        Ok(Some(command)) => command,
        Ok(None) => {
            print_help();
            return Ok(());
        }
        Err(e) => {
            if args.len() < 3 {
                print_help();
            }
            return Err(e);
        }
    };

    let data_dir = config::data_dir()?;
    let config = CosmosConfig::load(&data_dir).await?;
    logging::init(&data_dir, config.logging.tracing_level(), verbose)?;
    config.log_summary(&data_dir);
    let ctx = Context::open(data_dir, config).await?;

    match command {
        Command::CreatePrompt(parsed) => prompts::run_create(&ctx, parsed).await,
        Command::CreateRun(parsed) => runs::run_create(&ctx, parsed).await,
        Command::ListPrompts(parsed) => prompts::run_list(&ctx, parsed).await,
        Command::ListRuns(parsed) => runs::run_list(&ctx, parsed).await,
        Command::Search(parsed) => prompts::run_search(&ctx, parsed).await,
        Command::ShowPrompt(parsed) => prompts::run_show(&ctx, parsed).await,
        Command::ShowRun(parsed) => runs::run_show(&ctx, parsed).await,
        Command::Annotate(parsed) => prompts::run_annotate(&ctx, parsed).await,
        Command::Inference(parsed) => runs::run_inference(&ctx, parsed).await,
        Command::Batch(parsed) => batch::run_batch(&ctx, parsed).await,
        Command::Delete(parsed) => delete::run_delete(&ctx, parsed).await,
        Command::Verify(parsed) => verify::run_verify(&ctx, parsed).await,
        Command::Status(parsed) => status::run_status(&ctx, parsed).await,
    }
}

#[cfg(test)]
pub(crate) fn argv(line: &str) -> Vec<String> {
    std::iter::once("cosmos")
        .chain(line.split_whitespace())
        .map(str::to_string)
        .collect()
}
