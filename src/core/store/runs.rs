use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::types::{ModelType, NewRun, RunFilter, RunRecord, RunStatus, RunUpdate, new_run_id};
use super::{StoreError, format_timestamp, parse_timestamp};

const RUN_COLUMNS: &str = "id, prompt_id, model_type, status, execution_config_json, outputs_json, metadata_json, created_at, started_at, completed_at";

struct RunRow {
    id: String,
    prompt_id: String,
    model_type: String,
    status: String,
    execution_config_json: String,
    outputs_json: String,
    metadata_json: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prompt_id: row.get(1)?,
            model_type: row.get(2)?,
            status: row.get(3)?,
            execution_config_json: row.get(4)?,
            outputs_json: row.get(5)?,
            metadata_json: row.get(6)?,
            created_at: row.get(7)?,
            started_at: row.get(8)?,
            completed_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<RunRecord, StoreError> {
        let status = RunStatus::from_status(&self.status).ok_or_else(|| StoreError::Corrupt {
            id: self.id.clone(),
            reason: format!("unknown run status '{}'", self.status),
        })?;
        let model_type =
            ModelType::from_name(&self.model_type).ok_or_else(|| StoreError::Corrupt {
                id: self.id.clone(),
                reason: format!("unknown model type '{}'", self.model_type),
            })?;
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        let started_at = self
            .started_at
            .as_deref()
            .map(|raw| parse_timestamp(&self.id, raw))
            .transpose()?;
        let completed_at = self
            .completed_at
            .as_deref()
            .map(|raw| parse_timestamp(&self.id, raw))
            .transpose()?;
        Ok(RunRecord {
            status,
            model_type,
            execution_config: serde_json::from_str(&self.execution_config_json)?,
            outputs: serde_json::from_str(&self.outputs_json)?,
            metadata: serde_json::from_str(&self.metadata_json)?,
            created_at,
            started_at,
            completed_at,
            id: self.id,
            prompt_id: self.prompt_id,
        })
    }
}

pub(super) fn insert_run(
    db: &Connection,
    run: NewRun,
    model_type: ModelType,
) -> Result<RunRecord, StoreError> {
    let record = RunRecord {
        id: new_run_id(),
        prompt_id: run.prompt_id,
        model_type,
        status: RunStatus::Pending,
        execution_config: run.execution_config,
        outputs: serde_json::Map::new(),
        metadata: run.metadata,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    };
    db.execute(
        "INSERT INTO runs (id, prompt_id, model_type, status, execution_config_json, outputs_json, metadata_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            record.prompt_id,
            record.model_type.as_str(),
            record.status.as_str(),
            serde_json::to_string(&record.execution_config)?,
            serde_json::to_string(&record.outputs)?,
            serde_json::to_string(&record.metadata)?,
            format_timestamp(&record.created_at),
        ],
    )?;
    Ok(record)
}

pub(super) fn select_run(db: &Connection, id: &str) -> Result<Option<RunRecord>, StoreError> {
    let row = db
        .query_row(
            &format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS),
            params![id],
            RunRow::from_row,
        )
        .optional()?;
    row.map(RunRow::into_record).transpose()
}

pub(super) fn select_runs(db: &Connection, filter: &RunFilter) -> Result<Vec<RunRecord>, StoreError> {
    let mut clauses = Vec::new();
    let mut values = Vec::new();
    if let Some(status) = filter.status {
        values.push(SqlValue::Text(status.as_str().to_string()));
        clauses.push(format!("status = ?{}", values.len()));
    }
    if let Some(model_type) = filter.model_type {
        values.push(SqlValue::Text(model_type.as_str().to_string()));
        clauses.push(format!("model_type = ?{}", values.len()));
    }
    if let Some(prompt_id) = &filter.prompt_id {
        values.push(SqlValue::Text(prompt_id.clone()));
        clauses.push(format!("prompt_id = ?{}", values.len()));
    }

    let mut sql = format!("SELECT {} FROM runs", RUN_COLUMNS);
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC");
    if let Some(limit) = filter.limit {
        values.push(SqlValue::Integer(limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
    }

    let mut stmt = db.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), RunRow::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_record()?);
    }
    Ok(out)
}

pub(super) fn update_run(db: &Connection, id: &str, update: &RunUpdate) -> Result<bool, StoreError> {
    let outputs_json = update
        .outputs
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let rows = db.execute(
        "UPDATE runs
         SET status = ?1,
             outputs_json = COALESCE(?2, outputs_json),
             started_at = COALESCE(?3, started_at),
             completed_at = COALESCE(?4, completed_at)
         WHERE id = ?5",
        params![
            update.status.as_str(),
            outputs_json,
            update.started_at.as_ref().map(format_timestamp),
            update.completed_at.as_ref().map(format_timestamp),
            id,
        ],
    )?;
    Ok(rows > 0)
}

pub(super) fn update_run_status(
    db: &Connection,
    id: &str,
    status: RunStatus,
) -> Result<bool, StoreError> {
    let rows = db.execute(
        "UPDATE runs SET status = ?1 WHERE id = ?2",
        params![status.as_str(), id],
    )?;
    Ok(rows > 0)
}

pub(super) fn delete_run(db: &Connection, id: &str) -> Result<bool, StoreError> {
    let rows = db.execute("DELETE FROM runs WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}
