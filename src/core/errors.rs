use std::fmt;

use serde::Serialize;

use crate::core::store::{RunStatus, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Prompt,
    Run,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Prompt => f.write_str("Prompt"),
            EntityKind::Run => f.write_str("Run"),
        }
    }
}

/// A secondary failure that happened while recording another failure.
///
/// These never replace the primary error; they travel next to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountingWarning {
    pub run_id: String,
    pub message: String,
}

impl fmt::Display for AccountingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.run_id, self.message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("run {run_id} cannot transition from {from} to {to}")]
    InvalidState {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run {0} cannot be completed without at least one output")]
    EmptyOutputs(String),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("batch execution failed: {message}")]
    BatchExecution {
        message: String,
        accounting: Vec<AccountingWarning>,
    },

    #[error("run execution failed: {0}")]
    Execution(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunError {
    pub fn prompt_not_found(id: impl Into<String>) -> Self {
        RunError::NotFound {
            kind: EntityKind::Prompt,
            id: id.into(),
        }
    }

    pub fn run_not_found(id: impl Into<String>) -> Self {
        RunError::NotFound {
            kind: EntityKind::Run,
            id: id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_entity_and_states() {
        assert_eq!(
            RunError::run_not_found("rs_1").to_string(),
            "Run not found: rs_1"
        );
        let err = RunError::InvalidState {
            run_id: "rs_1".to_string(),
            from: RunStatus::Completed,
            to: RunStatus::Running,
        };
        assert_eq!(
            err.to_string(),
            "run rs_1 cannot transition from completed to running"
        );
    }
}
