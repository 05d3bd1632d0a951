use anyhow::Result;

use super::{Context, print_json, print_notice, reject_flag};
use crate::core::integrity::{IntegrityIssue, IntegrityVerifier};
use crate::core::terminal::{GuideSection, print_success, print_warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct VerifyArgs {
    pub fix: bool,
    pub json: bool,
}

pub(crate) fn parse_verify_args(args: &[String], start: usize) -> Result<VerifyArgs> {
    let mut parsed = VerifyArgs::default();
    for arg in args.iter().skip(start) {
        match arg.as_str() {
            "--fix" => parsed.fix = true,
            "--json" => parsed.json = true,
            other => return Err(reject_flag(other)),
        }
    }
    Ok(parsed)
}

fn describe(issue: &IntegrityIssue) -> String {
    match issue {
        IntegrityIssue::MissingOutput { run_id, path } => {
            format!("missing output  {} → {}", run_id, path)
        }
        IntegrityIssue::MissingInput { prompt_id, path } => {
            format!("missing input   {} → {}", prompt_id, path)
        }
        IntegrityIssue::OrphanedDirectory { path } => format!("orphaned dir    {}", path),
    }
}

pub async fn run_verify(ctx: &Context, parsed: VerifyArgs) -> Result<()> {
    let verifier = IntegrityVerifier::new(
        ctx.store.clone(),
        ctx.outputs_dir(),
        ctx.data_dir.clone(),
    );
    let report = verifier.verify().await?;

    if parsed.json {
        print_json(&report)?;
    } else {
        let stats = &report.stats;
        let mut section = GuideSection::new("Verification")
            .status("Runs", &stats.total_runs.to_string())
            .status("Checked", &stats.checked_runs.to_string())
            .status("Missing files", &stats.missing_files.to_string())
            .status("Orphaned directories", &stats.orphaned_dirs.to_string());
        if !report.issues.is_empty() {
            section = section.blank();
            for issue in &report.issues {
                section = section.bullet(&describe(issue));
            }
        }
        section.print();
        println!();
        for warning in &report.warnings {
            print_warn(warning);
        }
        if report.issues.is_empty() {
            print_success("No integrity issues found");
        } else {
            print_warn(&format!("{} issue(s) found", report.issues.len()));
        }
    }

    if parsed.fix {
        print_notice(parsed.json, "--fix is not implemented yet; no changes were made");
    }
    Ok(())
}
