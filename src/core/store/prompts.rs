use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};

use super::types::{ModelType, NewPrompt, PromptFilter, PromptRecord, new_prompt_id};
use super::{StoreError, format_timestamp, parse_timestamp};

const PROMPT_COLUMNS: &str =
    "id, prompt_text, negative_prompt, model_type, inputs_json, parameters_json, created_at";

struct PromptRow {
    id: String,
    prompt_text: String,
    negative_prompt: Option<String>,
    model_type: String,
    inputs_json: String,
    parameters_json: String,
    created_at: String,
}

impl PromptRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            prompt_text: row.get(1)?,
            negative_prompt: row.get(2)?,
            model_type: row.get(3)?,
            inputs_json: row.get(4)?,
            parameters_json: row.get(5)?,
            created_at: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<PromptRecord, StoreError> {
        let model_type =
            ModelType::from_name(&self.model_type).ok_or_else(|| StoreError::Corrupt {
                id: self.id.clone(),
                reason: format!("unknown model type '{}'", self.model_type),
            })?;
        let created_at = parse_timestamp(&self.id, &self.created_at)?;
        Ok(PromptRecord {
            model_type,
            inputs: serde_json::from_str(&self.inputs_json)?,
            parameters: serde_json::from_str(&self.parameters_json)?,
            created_at,
            id: self.id,
            prompt_text: self.prompt_text,
            negative_prompt: self.negative_prompt,
        })
    }
}

pub(super) fn insert_prompt(db: &Connection, prompt: NewPrompt) -> Result<PromptRecord, StoreError> {
    let record = PromptRecord {
        id: new_prompt_id(),
        prompt_text: prompt.prompt_text,
        negative_prompt: prompt.negative_prompt,
        model_type: prompt.model_type,
        inputs: prompt.inputs,
        parameters: prompt.parameters,
        created_at: Utc::now(),
    };
    db.execute(
        "INSERT INTO prompts (id, prompt_text, negative_prompt, model_type, inputs_json, parameters_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.id,
            record.prompt_text,
            record.negative_prompt,
            record.model_type.as_str(),
            serde_json::to_string(&record.inputs)?,
            serde_json::to_string(&record.parameters)?,
            format_timestamp(&record.created_at),
        ],
    )?;
    Ok(record)
}

pub(super) fn select_prompt(db: &Connection, id: &str) -> Result<Option<PromptRecord>, StoreError> {
    let row = db
        .query_row(
            &format!("SELECT {} FROM prompts WHERE id = ?1", PROMPT_COLUMNS),
            params![id],
            PromptRow::from_row,
        )
        .optional()?;
    row.map(PromptRow::into_record).transpose()
}

pub(super) fn select_prompts(
    db: &Connection,
    filter: &PromptFilter,
) -> Result<Vec<PromptRecord>, StoreError> {
    let mut sql = format!("SELECT {} FROM prompts", PROMPT_COLUMNS);
    let mut values = Vec::new();
    if let Some(model_type) = filter.model_type {
        values.push(SqlValue::Text(model_type.as_str().to_string()));
        sql.push_str(&format!(" WHERE model_type = ?{}", values.len()));
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC");
    if let Some(limit) = filter.limit {
        values.push(SqlValue::Integer(limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));
    }
    collect_prompts(db, &sql, values)
}

pub(super) fn search_prompts(
    db: &Connection,
    query: &str,
    limit: usize,
) -> Result<Vec<PromptRecord>, StoreError> {
    let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
    let sql = format!(
        "SELECT {} FROM prompts
         WHERE lower(prompt_text) LIKE ?1 ESCAPE '\\'
            OR lower(COALESCE(negative_prompt, '')) LIKE ?1 ESCAPE '\\'
         ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        PROMPT_COLUMNS
    );
    collect_prompts(
        db,
        &sql,
        vec![SqlValue::Text(pattern), SqlValue::Integer(limit as i64)],
    )
}

fn collect_prompts(
    db: &Connection,
    sql: &str,
    values: Vec<SqlValue>,
) -> Result<Vec<PromptRecord>, StoreError> {
    let mut stmt = db.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), PromptRow::from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?.into_record()?);
    }
    Ok(out)
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub(super) fn annotate_prompt(
    db: &Connection,
    id: &str,
    key: &str,
    value: serde_json::Value,
) -> Result<bool, StoreError> {
    let Some(mut prompt) = select_prompt(db, id)? else {
        return Ok(false);
    };
    prompt.parameters.insert(key.to_string(), value);
    let rows = db.execute(
        "UPDATE prompts SET parameters_json = ?1 WHERE id = ?2",
        params![serde_json::to_string(&prompt.parameters)?, id],
    )?;
    Ok(rows > 0)
}

pub(super) fn delete_prompt(db: &Connection, id: &str) -> Result<bool, StoreError> {
    let rows = db.execute("DELETE FROM prompts WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}
