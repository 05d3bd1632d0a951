use anyhow::Result;

use super::{Context, print_json, reject_flag};
use crate::core::integrity::detect_zombies;
use crate::core::terminal::{GuideSection, print_info, print_success, print_warn, styled_status};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StatusArgs {
    pub json: bool,
}

pub(crate) fn parse_status_args(args: &[String], start: usize) -> Result<StatusArgs> {
    let mut parsed = StatusArgs::default();
    for arg in args.iter().skip(start) {
        match arg.as_str() {
            "--json" => parsed.json = true,
            other => return Err(reject_flag(other)),
        }
    }
    Ok(parsed)
}

pub async fn run_status(ctx: &Context, parsed: StatusArgs) -> Result<()> {
    let orchestrator = ctx.orchestrator();
    let report = detect_zombies(ctx.store.as_ref(), orchestrator.as_ref()).await?;
    if parsed.json {
        return print_json(&report);
    }

    if report.pending.is_empty() && report.running.is_empty() {
        print_info("No active runs");
        return Ok(());
    }
    let mut section = GuideSection::new("Active runs");
    for run in report.running.iter().chain(report.pending.iter()) {
        let marker = if report.zombies.contains(&run.id) {
            " (no container)"
        } else {
            ""
        };
        section = section.bullet(&format!(
            "{} [{}]{}",
            run.id,
            styled_status(run.status),
            marker
        ));
    }
    if !report.containers.is_empty() {
        section = section.blank();
        for container in &report.containers {
            section = section.status(&container.name, &container.run_ids.join(", "));
        }
    }
    section.print();
    println!();

    if let Some(warning) = &report.remote_warning {
        print_warn(&format!("Could not check containers: {}", warning));
    } else if report.zombies.is_empty() {
        print_success("Every running run has a live container");
    } else {
        print_warn(&format!(
            "{} zombie run(s): marked running but no container is working on them",
            report.zombies.len()
        ));
    }
    Ok(())
}
