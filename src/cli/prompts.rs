use std::collections::BTreeMap;

use anyhow::{Result, anyhow};
use console::style;
use serde_json::{Map, Value, json};

use super::{Context, ShowArgs, flag_value, parse_number, print_json, reject_flag, usage};
use crate::core::errors::RunError;
use crate::core::store::{ModelType, NewPrompt, PromptFilter, PromptRecord, RunFilter};
use crate::core::terminal::{GuideSection, print_info, print_status, print_success, truncate};

const INPUT_FLAGS: [(&str, &str); 3] = [("--video", "video"), ("--depth", "depth"), ("--seg", "seg")];
const DEFAULT_SEARCH_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CreatePromptArgs {
    pub text: String,
    pub inputs: BTreeMap<String, String>,
    pub negative: Option<String>,
    pub model: ModelType,
    pub parent: Option<String>,
}

fn parse_model(raw: &str) -> Result<ModelType> {
    ModelType::from_name(raw).ok_or_else(|| {
        usage(format!(
            "unknown model type '{}' (expected transfer, enhancement, reason or predict)",
            raw
        ))
    })
}

pub(crate) fn parse_create_prompt(args: &[String], start: usize) -> Result<CreatePromptArgs> {
    let mut text: Option<String> = None;
    let mut inputs = BTreeMap::new();
    let mut negative = None;
    let mut model = ModelType::Transfer;
    let mut parent = None;
    let mut i = start;
    while i < args.len() {
        let arg = args[i].as_str();
        if let Some((_, name)) = INPUT_FLAGS.iter().find(|(flag, _)| *flag == arg) {
            inputs.insert(name.to_string(), flag_value(args, i)?);
            i += 2;
            continue;
        }
        match arg {
            "--negative" => {
                negative = Some(flag_value(args, i)?);
                i += 2;
            }
            "--model" => {
                model = parse_model(&flag_value(args, i)?)?;
                i += 2;
            }
            "--parent" => {
                parent = Some(flag_value(args, i)?);
                i += 2;
            }
            flag if flag.starts_with("--") => return Err(reject_flag(flag)),
            value => {
                // Unquoted prompt words are joined back together.
                text = Some(match text {
                    Some(existing) => format!("{} {}", existing, value),
                    None => value.to_string(),
                });
                i += 1;
            }
        }
    }
    let text = text.ok_or_else(|| {
        usage("Usage: cosmos create prompt <text> --video <path> [--depth <path>] [--seg <path>]")
    })?;
    if !inputs.contains_key("video") {
        return Err(usage("create prompt requires --video <path>"));
    }
    Ok(CreatePromptArgs {
        text,
        inputs,
        negative,
        model,
        parent,
    })
}

pub async fn run_create(ctx: &Context, parsed: CreatePromptArgs) -> Result<()> {
    let mut inputs = BTreeMap::new();
    for (name, raw) in parsed.inputs {
        let path = tokio::fs::canonicalize(&raw)
            .await
            .map_err(|e| anyhow!("{} input '{}' is not readable: {}", name, raw, e))?;
        inputs.insert(name, path.to_string_lossy().to_string());
    }

    let mut parameters = Map::new();
    if let Some(parent) = parsed.parent {
        if ctx.store.get_prompt(&parent).await?.is_none() {
            return Err(RunError::prompt_not_found(parent).into());
        }
        parameters.insert("parent_prompt_id".to_string(), json!(parent));
    }

    let new_prompt = NewPrompt {
        prompt_text: parsed.text,
        negative_prompt: parsed.negative,
        model_type: parsed.model,
        inputs,
        parameters,
    };
    new_prompt.validate().map_err(usage)?;
    let prompt = ctx.store.create_prompt(new_prompt).await?;

    print_success(&format!("Created prompt {}", prompt.id));
    print_status("Model", prompt.model_type.as_str());
    for (name, path) in &prompt.inputs {
        print_status(name, path);
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ListPromptsArgs {
    pub model: Option<ModelType>,
    pub limit: Option<usize>,
    pub json: bool,
}

pub(crate) fn parse_list_prompts(args: &[String], start: usize) -> Result<ListPromptsArgs> {
    let mut parsed = ListPromptsArgs::default();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--model" => {
                parsed.model = Some(parse_model(&flag_value(args, i)?)?);
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

fn print_prompt_list(title: &str, prompts: &[PromptRecord]) {
    if prompts.is_empty() {
        print_info("No prompts found");
        return;
    }
    let mut section = GuideSection::new(title);
    for prompt in prompts {
        section = section.bullet(&format!(
            "{} [{}] {}",
            style(&prompt.id).white().bold(),
            prompt.model_type,
            truncate(&prompt.prompt_text, 60)
        ));
    }
    section.print();
    println!();
}

pub async fn run_list(ctx: &Context, parsed: ListPromptsArgs) -> Result<()> {
    let prompts = ctx
        .store
        .list_prompts(&PromptFilter {
            model_type: parsed.model,
            limit: parsed.limit,
        })
        .await?;
    if parsed.json {
        return print_json(&prompts);
    }
    print_prompt_list(&format!("Prompts ({})", prompts.len()), &prompts);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SearchArgs {
    pub query: String,
    pub limit: usize,
    pub json: bool,
}

pub(crate) fn parse_search(args: &[String], start: usize) -> Result<SearchArgs> {
    let mut words: Vec<String> = Vec::new();
    let mut limit = DEFAULT_SEARCH_LIMIT;
    let mut json = false;
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--limit" => {
                limit = parse_number("--limit", &flag_value(args, i)?)?;
                i += 2;
            }
            "--json" => {
                json = true;
                i += 1;
            }
            flag if flag.starts_with("--") => return Err(reject_flag(flag)),
            word => {
                words.push(word.to_string());
                i += 1;
            }
        }
    }
    if words.is_empty() {
        return Err(usage("Usage: cosmos search <query> [--limit N] [--json]"));
    }
    Ok(SearchArgs {
        query: words.join(" "),
        limit,
        json,
    })
}

pub async fn run_search(ctx: &Context, parsed: SearchArgs) -> Result<()> {
    let prompts = ctx.store.search_prompts(&parsed.query, parsed.limit).await?;
    if parsed.json {
        return print_json(&prompts);
    }
    print_prompt_list(&format!("Matches for \"{}\"", parsed.query), &prompts);
    Ok(())
}

pub async fn run_show(ctx: &Context, parsed: ShowArgs) -> Result<()> {
    let prompt = ctx
        .store
        .get_prompt(&parsed.id)
        .await?
        .ok_or_else(|| RunError::prompt_not_found(parsed.id.as_str()))?;
    let runs = ctx
        .store
        .list_runs(&RunFilter {
            prompt_id: Some(prompt.id.clone()),
            ..RunFilter::default()
        })
        .await?;
    if parsed.json {
        return print_json(&json!({ "prompt": prompt, "runs": runs }));
    }

    let mut section = GuideSection::new(&format!("Prompt {}", prompt.id))
        .status("Text", &prompt.prompt_text)
        .status("Model", prompt.model_type.as_str())
        .status("Created", &prompt.created_at.to_rfc3339());
    if let Some(negative) = &prompt.negative_prompt {
        section = section.status("Negative", negative);
    }
    for (name, path) in &prompt.inputs {
        section = section.status(name, path);
    }
    for (key, value) in &prompt.parameters {
        section = section.status(key, &value.to_string());
    }
    section = section.blank().text(&format!("{} run(s)", runs.len()));
    for run in &runs {
        section = section.bullet(&format!("{} {}", run.id, run.status));
    }
    section.print();
    println!();
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AnnotateArgs {
    pub prompt_id: String,
    pub key: String,
    pub value: Value,
}

/// `annotate <ps_id> <key>=<value>`; the value is JSON when it parses as JSON.
pub(crate) fn parse_annotate(args: &[String], start: usize) -> Result<AnnotateArgs> {
    let usage_line = "Usage: cosmos annotate <prompt_id> <key>=<value>";
    let positional: Vec<&String> = args.iter().skip(start).collect();
    let [prompt_id, pair] = positional.as_slice() else {
        return Err(usage(usage_line));
    };
    let Some((key, raw)) = pair.split_once('=') else {
        return Err(usage(usage_line));
    };
    if key.trim().is_empty() {
        return Err(usage("annotation key must not be empty"));
    }
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok(AnnotateArgs {
        prompt_id: prompt_id.to_string(),
        key: key.trim().to_string(),
        value,
    })
}

pub async fn run_annotate(ctx: &Context, parsed: AnnotateArgs) -> Result<()> {
    if !ctx
        .store
        .annotate_prompt(&parsed.prompt_id, &parsed.key, parsed.value.clone())
        .await?
    {
        return Err(RunError::prompt_not_found(parsed.prompt_id).into());
    }
    print_success(&format!(
        "Annotated {}: {} = {}",
        parsed.prompt_id, parsed.key, parsed.value
    ));
    Ok(())
}
