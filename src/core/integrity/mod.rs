//! Read-only consistency check between the run database and the outputs tree.

mod zombies;

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::store::types::run_id_from_dir_name;
use crate::core::store::{EntityStore, PromptFilter, RunFilter, RunStatus, StoreError};

pub use zombies::{ZombieReport, detect_zombies, find_zombie_runs};

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot read outputs directory {}: {source}", .path.display())]
    OutputsRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrityIssue {
    MissingOutput { run_id: String, path: String },
    MissingInput { prompt_id: String, path: String },
    OrphanedDirectory { path: String },
}

impl IntegrityIssue {
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrityIssue::MissingOutput { .. } => "missing_output",
            IntegrityIssue::MissingInput { .. } => "missing_input",
            IntegrityIssue::OrphanedDirectory { .. } => "orphaned_directory",
        }
    }

    pub fn subject_id(&self) -> Option<&str> {
        match self {
            IntegrityIssue::MissingOutput { run_id, .. } => Some(run_id),
            IntegrityIssue::MissingInput { prompt_id, .. } => Some(prompt_id),
            IntegrityIssue::OrphanedDirectory { .. } => None,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            IntegrityIssue::MissingOutput { path, .. }
            | IntegrityIssue::MissingInput { path, .. }
            | IntegrityIssue::OrphanedDirectory { path } => path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationStats {
    pub total_runs: usize,
    pub checked_runs: usize,
    pub missing_files: usize,
    pub orphaned_dirs: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub stats: VerificationStats,
    pub issues: Vec<IntegrityIssue>,
    pub warnings: Vec<String>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty() && self.warnings.is_empty()
    }

    fn push(&mut self, issue: IntegrityIssue) {
        match issue {
            IntegrityIssue::OrphanedDirectory { .. } => self.stats.orphaned_dirs += 1,
            _ => self.stats.missing_files += 1,
        }
        self.issues.push(issue);
    }
}

enum Presence {
    Present,
    Missing,
    Unknown(std::io::Error),
}

async fn presence(path: &Path) -> Presence {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Presence::Present,
        Ok(false) => Presence::Missing,
        Err(e) => Presence::Unknown(e),
    }
}

pub struct IntegrityVerifier {
    store: Arc<dyn EntityStore>,
    outputs_dir: PathBuf,
    base_dir: PathBuf,
}

impl IntegrityVerifier {
    /// Relative paths recorded in the database are resolved against `base_dir`.
    pub fn new(store: Arc<dyn EntityStore>, outputs_dir: PathBuf, base_dir: PathBuf) -> Self {
        Self {
            store,
            outputs_dir,
            base_dir,
        }
    }

    fn resolve(&self, recorded: &str) -> PathBuf {
        let path = Path::new(recorded);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Never writes. Only the database or an unreadable outputs root is fatal;
    /// any single path that cannot be checked becomes a warning.
    pub async fn verify(&self) -> Result<VerificationReport, VerifyError> {
        let mut report = VerificationReport::default();
        let runs = self.store.list_runs(&RunFilter::default()).await?;
        report.stats.total_runs = runs.len();

        for run in &runs {
            if run.status != RunStatus::Completed {
                continue;
            }
            report.stats.checked_runs += 1;
            let Some(recorded) = run.output_path() else {
                report.warnings.push(format!(
                    "Run {} is completed but has no output_path recorded",
                    run.id
                ));
                continue;
            };
            match presence(&self.resolve(recorded)).await {
                Presence::Present => {}
                Presence::Missing => report.push(IntegrityIssue::MissingOutput {
                    run_id: run.id.clone(),
                    path: recorded.to_string(),
                }),
                Presence::Unknown(e) => report
                    .warnings
                    .push(format!("Cannot check output of run {} at {}: {}", run.id, recorded, e)),
            }
        }

        let prompts = self.store.list_prompts(&PromptFilter::default()).await?;
        for prompt in &prompts {
            for (name, recorded) in &prompt.inputs {
                match presence(&self.resolve(recorded)).await {
                    Presence::Present => {}
                    Presence::Missing => report.push(IntegrityIssue::MissingInput {
                        prompt_id: prompt.id.clone(),
                        path: recorded.clone(),
                    }),
                    Presence::Unknown(e) => report.warnings.push(format!(
                        "Cannot check {} input of prompt {} at {}: {}",
                        name, prompt.id, recorded, e
                    )),
                }
            }
        }

        let known: HashSet<&str> = runs.iter().map(|run| run.id.as_str()).collect();
        self.scan_orphans(&known, &mut report).await?;

        info!(
            runs = report.stats.total_runs,
            checked = report.stats.checked_runs,
            issues = report.issues.len(),
            warnings = report.warnings.len(),
            "Verification finished"
        );
        Ok(report)
    }

    async fn scan_orphans(
        &self,
        known: &HashSet<&str>,
        report: &mut VerificationReport,
    ) -> Result<(), VerifyError> {
        let root_error = |source: std::io::Error| VerifyError::OutputsRoot {
            path: self.outputs_dir.clone(),
            source,
        };
        let mut entries = match tokio::fs::read_dir(&self.outputs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(dir = %self.outputs_dir.display(), "No outputs directory yet");
                return Ok(());
            }
            Err(e) => return Err(root_error(e)),
        };

        let mut orphans = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(&root_error)? {
            let path = entry.path();
            match entry.file_type().await {
                Ok(kind) if !kind.is_dir() => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(path = %path.display(), "Cannot stat output entry: {}", e);
                    report
                        .warnings
                        .push(format!("Cannot stat {}: {}", path.display(), e));
                    continue;
                }
            }
            let name = entry.file_name();
            let owned = name
                .to_str()
                .and_then(run_id_from_dir_name)
                .is_some_and(|id| known.contains(id));
            if !owned {
                orphans.push(path);
            }
        }

        orphans.sort();
        for path in orphans {
            report.push(IntegrityIssue::OrphanedDirectory {
                path: path.to_string_lossy().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;
    use crate::core::lifecycle::RunLifecycle;
    use crate::core::store::testing::{new_prompt, new_run};
    use crate::core::store::{EntityStore, SqliteStore};

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("inputs")).unwrap();
            std::fs::create_dir_all(dir.path().join("outputs")).unwrap();
            Self {
                dir,
                store: Arc::new(SqliteStore::open_in_memory().unwrap()),
            }
        }

        fn verifier(&self) -> IntegrityVerifier {
            IntegrityVerifier::new(
                self.store.clone(),
                self.dir.path().join("outputs"),
                self.dir.path().to_path_buf(),
            )
        }

        fn touch(&self, relative: &str) {
            let path = self.dir.path().join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, b"data").unwrap();
        }

        async fn completed_run(&self, prompt_id: &str, output: &str) -> String {
            let lifecycle = RunLifecycle::new(self.store.clone());
            let run = lifecycle.create_run(new_run(prompt_id)).await.unwrap();
            lifecycle.start(&run.id).await.unwrap();
            let mut outputs = Map::new();
            outputs.insert("output_path".to_string(), json!(output));
            lifecycle.complete(&run.id, outputs).await.unwrap();
            run.id
        }
    }

    #[tokio::test]
    async fn missing_output_is_reported_once_with_recorded_path() {
        let fx = Fixture::new();
        fx.touch("inputs/a.mp4");
        let prompt = fx
            .store
            .create_prompt(new_prompt("lake", "inputs/a.mp4"))
            .await
            .unwrap();
        let run_id = fx.completed_run(&prompt.id, "outputs/run_rs_1/video.mp4").await;

        let report = fx.verifier().verify().await.unwrap();
        let expected = IntegrityIssue::MissingOutput {
            run_id: run_id.clone(),
            path: "outputs/run_rs_1/video.mp4".to_string(),
        };
        assert_eq!(report.issues.iter().filter(|i| **i == expected).count(), 1);
        assert_eq!(report.stats.checked_runs, 1);
        assert_eq!(report.stats.missing_files, 1);

        let value = serde_json::to_value(&expected).unwrap();
        assert_eq!(
            value,
            json!({"type": "missing_output", "run_id": run_id, "path": "outputs/run_rs_1/video.mp4"})
        );
    }

    #[tokio::test]
    async fn existing_output_and_owned_directory_are_clean() {
        let fx = Fixture::new();
        fx.touch("inputs/a.mp4");
        let prompt = fx
            .store
            .create_prompt(new_prompt("lake", "inputs/a.mp4"))
            .await
            .unwrap();
        let run = fx.store.create_run(new_run(&prompt.id)).await.unwrap().unwrap();
        let relative = format!("outputs/run_{}/output.mp4", run.id);
        fx.touch(&relative);
        let lifecycle = RunLifecycle::new(fx.store.clone());
        lifecycle.start(&run.id).await.unwrap();
        let mut outputs = Map::new();
        outputs.insert("output_path".to_string(), json!(relative));
        lifecycle.complete(&run.id, outputs).await.unwrap();

        let report = fx.verifier().verify().await.unwrap();
        assert!(report.is_clean(), "{:?}", report);
        assert_eq!(report.stats.total_runs, 1);
    }

    #[tokio::test]
    async fn missing_inputs_and_orphans_are_classified() {
        let fx = Fixture::new();
        let prompt = fx
            .store
            .create_prompt(new_prompt("lake", "inputs/gone.mp4"))
            .await
            .unwrap();
        std::fs::create_dir_all(fx.dir.path().join("outputs/run_rs_deadbeefdeadbeef")).unwrap();
        std::fs::write(fx.dir.path().join("outputs/notes.txt"), b"x").unwrap();

        let report = fx.verifier().verify().await.unwrap();
        assert_eq!(report.issues.len(), 2);
        assert_eq!(report.issues[0].kind(), "missing_input");
        assert_eq!(report.issues[0].subject_id(), Some(prompt.id.as_str()));
        assert_eq!(report.issues[1].kind(), "orphaned_directory");
        assert!(report.issues[1].path().ends_with("run_rs_deadbeefdeadbeef"));
        assert_eq!(report.stats.orphaned_dirs, 1);
    }

    #[tokio::test]
    async fn verification_is_repeatable_and_read_only() {
        let fx = Fixture::new();
        let prompt = fx
            .store
            .create_prompt(new_prompt("lake", "inputs/gone.mp4"))
            .await
            .unwrap();
        fx.completed_run(&prompt.id, "outputs/run_x/output.mp4").await;
        std::fs::create_dir_all(fx.dir.path().join("outputs/run_stale")).unwrap();

        let verifier = fx.verifier();
        let first = verifier.verify().await.unwrap();
        let second = verifier.verify().await.unwrap();
        assert_eq!(first, second);
        assert!(fx.dir.path().join("outputs/run_stale").is_dir());
    }

    #[tokio::test]
    async fn completed_run_without_output_path_is_a_warning() {
        let fx = Fixture::new();
        fx.touch("inputs/a.mp4");
        let prompt = fx
            .store
            .create_prompt(new_prompt("lake", "inputs/a.mp4"))
            .await
            .unwrap();
        let run = fx.store.create_run(new_run(&prompt.id)).await.unwrap().unwrap();
        fx.store
            .update_run_status(&run.id, RunStatus::Completed)
            .await
            .unwrap();

        let report = fx.verifier().verify().await.unwrap();
        assert!(report.issues.is_empty());
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains(&run.id));
    }

    #[tokio::test]
    async fn unstattable_input_is_a_warning_not_an_issue() {
        let fx = Fixture::new();
        fx.touch("inputs/afile");
        fx.store
            .create_prompt(new_prompt("lake", "inputs/afile/child.mp4"))
            .await
            .unwrap();

        let report = fx.verifier().verify().await.unwrap();
        assert!(report.issues.is_empty(), "{:?}", report.issues);
        assert_eq!(report.stats.missing_files, 0);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("inputs/afile/child.mp4"));
    }

    #[tokio::test]
    async fn absent_outputs_root_has_no_orphans() {
        let fx = Fixture::new();
        std::fs::remove_dir(fx.dir.path().join("outputs")).unwrap();
        let report = fx.verifier().verify().await.unwrap();
        assert_eq!(report.stats.orphaned_dirs, 0);
    }
}
