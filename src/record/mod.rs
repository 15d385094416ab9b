//! Result record model -- the run summary, per-iteration records, and the
//! persisted aggregate document that every sink writes.

pub mod info;
pub mod model;

pub use info::{CiInformation, DutInformation, HostInformation};
pub use model::{
    ExecutionData, IterationData, IterationRecord, RunRecord, RunSummary,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Database reference id. Positive SQLite rowid of the referenced document.
pub type DocId = i64;

/// Key name every iteration's analytics map carries.
pub const ITERATION_DURATION: &str = "iteration_duration";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("invalid record field `{field}`: {constraint}")]
    Validation { field: String, constraint: String },

    #[error("malformed record document: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl RecordError {
    pub(crate) fn invalid(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            constraint: constraint.into(),
        }
    }
}

/// Lifecycle status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    Completed,
    Aborted,
}

/// Verdict of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResult {
    InProgress,
    Pass,
    Fail,
}

/// Verdict of a single iteration. Iterations start out as `Fail` and only
/// become `Pass` when the body says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IterationResult {
    Pass,
    #[default]
    Fail,
}

impl std::fmt::Display for IterationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterationResult::Pass => write!(f, "PASS"),
            IterationResult::Fail => write!(f, "FAIL"),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::InProgress => write!(f, "IN_PROGRESS"),
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl std::fmt::Display for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunResult::InProgress => write!(f, "IN_PROGRESS"),
            RunResult::Pass => write!(f, "PASS"),
            RunResult::Fail => write!(f, "FAIL"),
        }
    }
}

/// Serialized form of an error attached to an iteration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionReport {
    pub exception_msg: String,
    pub traceback: String,
}

impl ExceptionReport {
    /// Build a report from any error, walking its source chain for the
    /// traceback text.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }
        Self {
            exception_msg: err.to_string(),
            traceback: chain.join("\n"),
        }
    }

    /// JSON text stored in `iteration_tc_execution_data.exception`.
    pub fn to_json_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.exception_msg.clone())
    }
}
