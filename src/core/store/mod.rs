mod prompts;
mod runs;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub use types::{
    ControlWeights, ExecutionConfig, ModelType, NewPrompt, NewRun, PromptFilter, PromptRecord,
    RunFilter, RunRecord, RunStatus, RunUpdate,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("invalid JSON column: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence boundary for prompts and runs.
///
/// Lookups of unknown IDs return `Ok(None)` (or `Ok(false)` for deletes); an `Err` always
/// means the store itself could not answer.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn create_prompt(&self, prompt: NewPrompt) -> Result<PromptRecord, StoreError>;
    /// Returns `None` when `run.prompt_id` does not reference an existing prompt.
    async fn create_run(&self, run: NewRun) -> Result<Option<RunRecord>, StoreError>;
    async fn get_prompt(&self, id: &str) -> Result<Option<PromptRecord>, StoreError>;
    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError>;
    async fn list_prompts(&self, filter: &PromptFilter) -> Result<Vec<PromptRecord>, StoreError>;
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StoreError>;
    async fn search_prompts(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PromptRecord>, StoreError>;
    async fn update_run(&self, id: &str, update: RunUpdate) -> Result<bool, StoreError>;
    async fn update_run_status(&self, id: &str, status: RunStatus) -> Result<bool, StoreError>;
    async fn annotate_prompt(
        &self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<bool, StoreError>;
    async fn delete_run(&self, id: &str) -> Result<bool, StoreError>;
    async fn delete_prompt(&self, id: &str) -> Result<bool, StoreError>;
}

pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let db = Connection::open(&path)?;
        init_schema(&db)?;
        info!("Opened run database at {}", path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: Some(path),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let db = Connection::open_in_memory()?;
        init_schema(&db)?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn init_schema(db: &Connection) -> Result<(), StoreError> {
    db.execute(
        "CREATE TABLE IF NOT EXISTS prompts (
            id TEXT PRIMARY KEY,
            prompt_text TEXT NOT NULL,
            negative_prompt TEXT,
            model_type TEXT NOT NULL,
            inputs_json TEXT NOT NULL,
            parameters_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            prompt_id TEXT NOT NULL,
            model_type TEXT NOT NULL,
            status TEXT NOT NULL,
            execution_config_json TEXT NOT NULL,
            outputs_json TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_prompt_id ON runs(prompt_id)",
        [],
    )?;
    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_runs_status_created ON runs(status, created_at)",
        [],
    )?;
    Ok(())
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(id: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("invalid timestamp '{}': {}", raw, e),
        })
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn create_prompt(&self, prompt: NewPrompt) -> Result<PromptRecord, StoreError> {
        let db = self.db.lock().await;
        prompts::insert_prompt(&db, prompt)
    }

    async fn create_run(&self, run: NewRun) -> Result<Option<RunRecord>, StoreError> {
        let db = self.db.lock().await;
        let Some(prompt) = prompts::select_prompt(&db, &run.prompt_id)? else {
            return Ok(None);
        };
        runs::insert_run(&db, run, prompt.model_type).map(Some)
    }

    async fn get_prompt(&self, id: &str) -> Result<Option<PromptRecord>, StoreError> {
        let db = self.db.lock().await;
        prompts::select_prompt(&db, id)
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>, StoreError> {
        let db = self.db.lock().await;
        runs::select_run(&db, id)
    }

    async fn list_prompts(&self, filter: &PromptFilter) -> Result<Vec<PromptRecord>, StoreError> {
        let db = self.db.lock().await;
        prompts::select_prompts(&db, filter)
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, StoreError> {
        let db = self.db.lock().await;
        runs::select_runs(&db, filter)
    }

    async fn search_prompts(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<PromptRecord>, StoreError> {
        let db = self.db.lock().await;
        prompts::search_prompts(&db, query, limit)
    }

    async fn update_run(&self, id: &str, update: RunUpdate) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        runs::update_run(&db, id, &update)
    }

    async fn update_run_status(&self, id: &str, status: RunStatus) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        runs::update_run_status(&db, id, status)
    }

    async fn annotate_prompt(
        &self,
        id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        prompts::annotate_prompt(&db, id, key, value)
    }

    async fn delete_run(&self, id: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        runs::delete_run(&db, id)
    }

    async fn delete_prompt(&self, id: &str) -> Result<bool, StoreError> {
        let db = self.db.lock().await;
        prompts::delete_prompt(&db, id)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{new_prompt, new_run};
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_run_for_unknown_prompt_returns_none() {
        let store = SqliteStore::open_in_memory().unwrap();
        let run = store.create_run(new_run("ps_missing")).await.unwrap();
        assert!(run.is_none());
    }

    #[tokio::test]
    async fn created_run_starts_pending_with_empty_outputs() {
        let store = SqliteStore::open_in_memory().unwrap();
        let prompt = store
            .create_prompt(new_prompt("snowy forest", "inputs/forest.mp4"))
            .await
            .unwrap();
        let run = store.create_run(new_run(&prompt.id)).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.outputs.is_empty());
        assert_eq!(run.model_type, ModelType::Transfer);

        let fetched = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched, run);
    }

    #[tokio::test]
    async fn update_run_writes_all_fields_at_once() {
        let store = SqliteStore::open_in_memory().unwrap();
        let prompt = store
            .create_prompt(new_prompt("desert road", "inputs/road.mp4"))
            .await
            .unwrap();
        let run = store.create_run(new_run(&prompt.id)).await.unwrap().unwrap();

        let mut outputs = serde_json::Map::new();
        outputs.insert("output_path".to_string(), json!("outputs/run_x/output.mp4"));
        let now = Utc::now();
        let updated = store
            .update_run(
                &run.id,
                RunUpdate {
                    status: RunStatus::Completed,
                    outputs: Some(outputs),
                    started_at: None,
                    completed_at: Some(now),
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let fetched = store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Completed);
        assert_eq!(fetched.output_path(), Some("outputs/run_x/output.mp4"));
        assert!(fetched.completed_at.is_some());
        assert!(!store.update_run_status("rs_nope", RunStatus::Failed).await.unwrap());
    }

    #[tokio::test]
    async fn list_runs_applies_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store
            .create_prompt(new_prompt("harbor", "inputs/harbor.mp4"))
            .await
            .unwrap();
        let b = store
            .create_prompt(new_prompt("alley", "inputs/alley.mp4"))
            .await
            .unwrap();
        let r1 = store.create_run(new_run(&a.id)).await.unwrap().unwrap();
        store.create_run(new_run(&a.id)).await.unwrap().unwrap();
        store.create_run(new_run(&b.id)).await.unwrap().unwrap();
        store
            .update_run_status(&r1.id, RunStatus::Running)
            .await
            .unwrap();

        let by_prompt = store
            .list_runs(&RunFilter {
                prompt_id: Some(a.id.clone()),
                ..RunFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(by_prompt.len(), 2);

        let running = store
            .list_runs(&RunFilter {
                status: Some(RunStatus::Running),
                ..RunFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, r1.id);

        let limited = store
            .list_runs(&RunFilter {
                limit: Some(1),
                ..RunFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn unknown_status_in_database_is_reported_as_corrupt() {
        let store = SqliteStore::open_in_memory().unwrap();
        let prompt = store
            .create_prompt(new_prompt("pier", "inputs/pier.mp4"))
            .await
            .unwrap();
        let run = store.create_run(new_run(&prompt.id)).await.unwrap().unwrap();
        {
            let db = store.db.lock().await;
            db.execute(
                "UPDATE runs SET status = 'uploading' WHERE id = ?1",
                rusqlite::params![run.id],
            )
            .unwrap();
        }
        let err = store.get_run(&run.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn search_matches_prompt_text_case_insensitively() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .create_prompt(new_prompt("Golden hour over the Harbor", "inputs/a.mp4"))
            .await
            .unwrap();
        store
            .create_prompt(new_prompt("night alley with neon", "inputs/b.mp4"))
            .await
            .unwrap();
        let hits = store.search_prompts("harbor", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].prompt_text.contains("Harbor"));
        assert!(store.search_prompts("100%", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn annotate_prompt_only_touches_parameters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let prompt = store
            .create_prompt(new_prompt("canyon", "inputs/canyon.mp4"))
            .await
            .unwrap();
        assert!(
            store
                .annotate_prompt(&prompt.id, "enhanced", json!(true))
                .await
                .unwrap()
        );
        let fetched = store.get_prompt(&prompt.id).await.unwrap().unwrap();
        assert_eq!(fetched.parameters.get("enhanced"), Some(&json!(true)));
        assert_eq!(fetched.prompt_text, prompt.prompt_text);
        assert!(
            !store
                .annotate_prompt("ps_missing", "enhanced", json!(true))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn deleting_prompt_does_not_cascade_to_runs() {
        let store = SqliteStore::open_in_memory().unwrap();
        let prompt = store
            .create_prompt(new_prompt("meadow", "inputs/meadow.mp4"))
            .await
            .unwrap();
        let run = store.create_run(new_run(&prompt.id)).await.unwrap().unwrap();
        assert!(store.delete_prompt(&prompt.id).await.unwrap());
        assert!(store.get_run(&run.id).await.unwrap().is_some());
        assert!(!store.delete_prompt(&prompt.id).await.unwrap());
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cosmos.db");
        let store = SqliteStore::open(&path).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
