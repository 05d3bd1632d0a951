use anyhow::{Result, anyhow};
use inquire::InquireError;

use super::{Context, print_json, print_notice, reject_flag, usage};
use crate::core::deletion::{DeletionOutcome, DeletionPlanner};
use crate::core::terminal::{GuideSection, print_success, print_warn, styled_status, truncate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DeleteTarget {
    Prompt(String),
    Run(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeleteArgs {
    pub target: DeleteTarget,
    pub force: bool,
    pub json: bool,
}

pub(crate) fn parse_delete_args(args: &[String], start: usize) -> Result<DeleteArgs> {
    let mut positional = Vec::new();
    let mut force = false;
    let mut json = false;
    for arg in args.iter().skip(start) {
        match arg.as_str() {
            "--force" | "-f" => force = true,
            "--json" => json = true,
            flag if flag.starts_with("--") => return Err(reject_flag(flag)),
            value => positional.push(value.to_string()),
        }
    }
    let target = match positional.as_slice() {
        [kind, id] if kind == "prompt" => DeleteTarget::Prompt(id.clone()),
        [kind, id] if kind == "run" => DeleteTarget::Run(id.clone()),
        _ => return Err(usage("Usage: cosmos delete <prompt|run> <id> [--force]")),
    };
    Ok(DeleteArgs {
        target,
        force,
        json,
    })
}

fn confirm(question: &str) -> Result<bool> {
    match inquire::Confirm::new(question).with_default(false).prompt() {
        Ok(answer) => Ok(answer),
        Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => Ok(false),
        Err(e) => Err(anyhow!(
            "cannot ask for confirmation ({}); pass --force to delete without asking",
            e
        )),
    }
}

fn report(outcome: &DeletionOutcome, json: bool) -> Result<()> {
    if json {
        print_json(outcome)?;
    }
    if !outcome.success {
        return Err(anyhow!(
            "{}",
            outcome.error.as_deref().unwrap_or("deletion failed")
        ));
    }
    if !json {
        for warning in &outcome.warnings {
            print_warn(warning);
        }
        if let Some(prompt_id) = &outcome.deleted_prompt {
            print_success(&format!("Deleted prompt {}", prompt_id));
        }
        print_success(&format!(
            "Deleted {} run(s) and {} output director{}",
            outcome.deleted_runs.len(),
            outcome.deleted_directories.len(),
            if outcome.deleted_directories.len() == 1 { "y" } else { "ies" }
        ));
    }
    Ok(())
}

pub async fn run_delete(ctx: &Context, parsed: DeleteArgs) -> Result<()> {
    let planner = DeletionPlanner::new(ctx.store.clone(), ctx.outputs_dir());

    let question = match &parsed.target {
        DeleteTarget::Prompt(prompt_id) => {
            let preview = planner.preview_prompt_deletion(prompt_id).await?;
            if let Some(error) = &preview.error {
                return Err(anyhow!("{}", error));
            }
            let mut section = GuideSection::new(&format!("Delete prompt {}", prompt_id));
            if let Some(prompt) = &preview.prompt {
                section = section.status("Text", &truncate(&prompt.prompt_text, 70));
            }
            for run in &preview.runs {
                section = section.bullet(&format!("run {} [{}]", run.id, styled_status(run.status)));
            }
            for dir in &preview.directories {
                section = section.bullet(&format!("dir {}", dir.display()));
            }
            if !parsed.json {
                section.print();
                println!();
            }
            if let Some(refusal) = preview.refusal() {
                if !parsed.json {
                    print_warn(&format!(
                        "{} run(s) are still pending or running; the prompt cannot be deleted",
                        preview.active_runs().count()
                    ));
                }
                return report(&refusal, parsed.json);
            }
            format!(
                "Delete prompt {} with {} run(s)?",
                prompt_id,
                preview.runs.len()
            )
        }
        DeleteTarget::Run(run_id) => {
            let preview = planner.preview_run_deletion(run_id).await?;
            if let Some(error) = preview.error {
                return Err(anyhow!(error));
            }
            let mut section = GuideSection::new(&format!("Delete run {}", run_id));
            if let Some(run) = &preview.run {
                section = section
                    .status("Prompt", &run.prompt_id)
                    .status("Status", &styled_status(run.status));
            }
            if let Some(dir) = &preview.directory {
                section = section.bullet(&format!("dir {}", dir.display()));
            }
            if !parsed.json {
                section.print();
                println!();
                for warning in &preview.warnings {
                    print_warn(warning);
                }
            }
            format!("Delete run {}?", run_id)
        }
    };

    if !parsed.force && !confirm(&question)? {
        print_notice(parsed.json, "Deletion cancelled");
        return Ok(());
    }

    let outcome = match &parsed.target {
        DeleteTarget::Prompt(prompt_id) => planner.delete_prompt(prompt_id).await?,
        DeleteTarget::Run(run_id) => planner.delete_run(run_id).await?,
    };
    report(&outcome, parsed.json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::argv;

    #[test]
    fn delete_parses_target_and_force() {
        let parsed = parse_delete_args(&argv("delete prompt ps_1 --force"), 2).unwrap();
        assert_eq!(parsed.target, DeleteTarget::Prompt("ps_1".to_string()));
        assert!(parsed.force);

        let parsed = parse_delete_args(&argv("delete run rs_1"), 2).unwrap();
        assert_eq!(parsed.target, DeleteTarget::Run("rs_1".to_string()));
        assert!(!parsed.force);
    }

    #[test]
    fn delete_rejects_unknown_kinds() {
        assert!(parse_delete_args(&argv("delete batch b1"), 2).is_err());
        assert!(parse_delete_args(&argv("delete run"), 2).is_err());
    }
}
