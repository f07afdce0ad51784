use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::orchestrator::RunState;

#[derive(Error, Debug, Clone)]
pub enum FraudError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Record source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Record source query failed: {0}")]
    SourceQuery(String),

    #[error("Rule '{rule}' failed: {message}")]
    RuleExecution { rule: String, message: String },

    #[error("Report write failed at {}: {message}", path.display())]
    ReportWrite { path: PathBuf, message: String },

    #[error("Run '{run_id}' is already in progress (state: {state})")]
    RunInProgress { run_id: String, state: RunState },
}

pub type FraudResult<T> = Result<T, FraudError>;

impl FraudError {
    pub fn config(message: impl Into<String>) -> Self {
        FraudError::Configuration(message.into())
    }

    pub fn report_write(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        FraudError::ReportWrite { path: path.into(), message: err.to_string() }
    }

    /// Stable kind name surfaced in run summaries.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FraudError::Configuration(_)       => ErrorKind::Configuration,
            FraudError::SourceUnavailable(_)   => ErrorKind::SourceUnavailable,
            FraudError::SourceQuery(_)         => ErrorKind::SourceQuery,
            FraudError::RuleExecution { .. }   => ErrorKind::RuleExecution,
            FraudError::ReportWrite { .. }     => ErrorKind::ReportWrite,
            FraudError::RunInProgress { .. }   => ErrorKind::RunInProgress,
        }
    }

    /// The pipeline component an error is attributed to.
    pub fn component(&self) -> Component {
        match self {
            FraudError::Configuration(_)       => Component::WindowResolver,
            FraudError::SourceUnavailable(_)
            | FraudError::SourceQuery(_)       => Component::RecordSource,
            FraudError::RuleExecution { .. }   => Component::RuleEvaluator,
            FraudError::ReportWrite { .. }     => Component::ReportWriter,
            FraudError::RunInProgress { .. }   => Component::RunOrchestrator,
        }
    }

    /// Map a SQLite error onto the source taxonomy: connectivity and
    /// locking problems are "unavailable", everything else is a query error.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied
                | ErrorCode::SystemIoFailure => FraudError::SourceUnavailable(err.to_string()),
                _ => FraudError::SourceQuery(err.to_string()),
            },
            _ => FraudError::SourceQuery(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    SourceUnavailable,
    SourceQuery,
    RuleExecution,
    ReportWrite,
    RunInProgress,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration     => "configuration_error",
            ErrorKind::SourceUnavailable => "source_unavailable_error",
            ErrorKind::SourceQuery       => "source_query_error",
            ErrorKind::RuleExecution     => "rule_execution_error",
            ErrorKind::ReportWrite       => "report_write_error",
            ErrorKind::RunInProgress     => "run_in_progress_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    WindowResolver,
    RecordSource,
    RuleEvaluator,
    Aggregator,
    ReportWriter,
    RunOrchestrator,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::WindowResolver  => "window_resolver",
            Component::RecordSource    => "record_source",
            Component::RuleEvaluator   => "rule_evaluator",
            Component::Aggregator      => "aggregator",
            Component::ReportWriter    => "report_writer",
            Component::RunOrchestrator => "run_orchestrator",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
