use anyhow::{Result, anyhow};
use console::style;

use super::{Context, flag_value, parse_number, print_json, reject_flag, usage};
use crate::core::errors::RunError;
use crate::core::execution::{BatchReconciler, BatchReport, BatchRequest};
use crate::core::terminal::{
    GuideSection, print_error, print_info, print_status, print_step, print_success, print_warn,
    truncate,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BatchArgs {
    pub run_ids: Vec<String>,
    pub batch_name: Option<String>,
    pub num_gpu: u32,
    pub cuda_devices: String,
    pub dry_run: bool,
    pub json: bool,
}

pub(crate) fn parse_batch_args(args: &[String], start: usize) -> Result<BatchArgs> {
    let mut parsed = BatchArgs {
        run_ids: Vec::new(),
        batch_name: None,
        num_gpu: 1,
        cuda_devices: "0".to_string(),
        dry_run: false,
        json: false,
    };
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--batch-name" => {
                parsed.batch_name = Some(flag_value(args, i)?);
                i += 2;
            }
            "--num-gpu" => {
                parsed.num_gpu = parse_number("--num-gpu", &flag_value(args, i)?)?;
                i += 2;
            }
            "--cuda-devices" => {
                parsed.cuda_devices = flag_value(args, i)?;
                i += 2;
            }
            "--dry-run" => {
                parsed.dry_run = true;
                i += 1;
            }
            "--json" => {
                parsed.json = true;
                i += 1;
            }
            flag if flag.starts_with("--") => return Err(reject_flag(flag)),
            run_id => {
                parsed.run_ids.push(run_id.to_string());
                i += 1;
            }
        }
    }
    if parsed.run_ids.is_empty() {
        return Err(usage(
            "Usage: cosmos batch-inference <run_ids...> [--batch-name N] [--num-gpu N] [--cuda-devices D] [--dry-run]",
        ));
    }
    if parsed.num_gpu == 0 {
        return Err(usage("--num-gpu must be at least 1"));
    }
    Ok(parsed)
}

fn print_report(report: &BatchReport) {
    let mut section = GuideSection::new(&format!("Batch {}", report.batch_name))
        .status("Runs", &report.total.to_string())
        .status(
            "Completed",
            &style(report.successful_count()).green().to_string(),
        )
        .status("Failed", &style(report.failed_count()).red().to_string());
    for run_id in &report.failed {
        section = section.bullet(&format!("{} {}", run_id, style("failed").red()));
    }
    section.print();
    println!();
}

pub async fn run_batch(ctx: &Context, parsed: BatchArgs) -> Result<()> {
    let reconciler = BatchReconciler::new(ctx.store.clone(), ctx.orchestrator());

    if parsed.dry_run {
        let pairs = reconciler.resolve(&parsed.run_ids).await?;
        if parsed.json {
            let plan: Vec<_> = pairs
                .iter()
                .map(|(run, prompt)| serde_json::json!({"run_id": run.id, "prompt_id": prompt.id, "status": run.status}))
                .collect();
            return print_json(&plan);
        }
        let mut section = GuideSection::new("Batch plan (dry run)");
        for (run, prompt) in &pairs {
            section = section.bullet(&format!(
                "{} [{}] {}",
                run.id,
                run.status,
                truncate(&prompt.prompt_text, 50)
            ));
        }
        section.print();
        println!();
        print_info(&format!(
            "{} run(s) would execute on {} GPU(s); nothing was changed",
            pairs.len(),
            parsed.num_gpu
        ));
        return Ok(());
    }

    let request = BatchRequest {
        run_ids: parsed.run_ids,
        batch_name: parsed.batch_name,
        num_gpu: parsed.num_gpu,
        cuda_devices: parsed.cuda_devices,
        include_outputs: true,
    };
    if !parsed.json {
        print_step(&format!(
            "Submitting {} run(s) to {}",
            request.run_ids.len(),
            ctx.config.remote.target()
        ));
    }

    match reconciler.execute(&request).await {
        Ok(report) => {
            if parsed.json {
                return print_json(&report);
            }
            for warning in &report.accounting_warnings {
                print_warn(&format!("Could not record result for {}", warning));
            }
            print_report(&report);
            if report.failed.is_empty() {
                print_success("All runs completed");
            } else {
                print_warn(&format!(
                    "{} of {} run(s) produced no output",
                    report.failed_count(),
                    report.total
                ));
            }
            if let Some(outputs) = &report.outputs {
                for (run_id, path) in outputs {
                    print_status(run_id, path);
                }
            }
            Ok(())
        }
        Err(RunError::BatchExecution {
            message,
            accounting,
        }) => {
            for warning in &accounting {
                print_error(&format!("Could not mark run failed: {}", warning));
            }
            Err(anyhow!("Batch execution failed: {}", message))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{UsageError, argv};

    #[test]
    fn batch_args_collect_ids_and_options() {
        let args = argv(
            "batch-inference rs_1 rs_2 --batch-name nightly --num-gpu 4 --cuda-devices 0,1,2,3 --dry-run",
        );
        let parsed = parse_batch_args(&args, 2).unwrap();
        assert_eq!(parsed.run_ids, vec!["rs_1", "rs_2"]);
        assert_eq!(parsed.batch_name.as_deref(), Some("nightly"));
        assert_eq!(parsed.num_gpu, 4);
        assert_eq!(parsed.cuda_devices, "0,1,2,3");
        assert!(parsed.dry_run);
    }

    #[test]
    fn batch_requires_runs_and_a_gpu() {
        assert!(
            parse_batch_args(&argv("batch-inference --dry-run"), 2)
                .unwrap_err()
                .is::<UsageError>()
        );
        assert!(
            parse_batch_args(&argv("batch-inference rs_1 --num-gpu 0"), 2)
                .unwrap_err()
                .is::<UsageError>()
        );
    }
}
