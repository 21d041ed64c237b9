use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

use crate::orchestrator::PipelineState;

#[derive(Debug, Error)]
pub enum IngestionError {
    #[error("project path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("permission denied reading {}", .0.display())]
    PermissionDenied(PathBuf),

    #[error("project path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    #[error("no C or JavaScript source files found under {}", .0.display())]
    NoSourceFiles(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl IngestionError {
    pub fn from_io(path: PathBuf, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => IngestionError::NotFound(path),
            std::io::ErrorKind::PermissionDenied => IngestionError::PermissionDenied(path),
            _ => IngestionError::Io { path, source: err },
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("could not read {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no code chunks could be produced from {0} file(s)")]
    NoChunks(usize),
}

/// Failures of the language-model backend. All are recoverable: callers
/// fall back to heuristics.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LlmError {
    #[error("LLM backend unavailable: {0}")]
    Unavailable(String),

    #[error("LLM request timed out after {0}s")]
    Timeout(u64),

    #[error("LLM request failed: {0}")]
    Http(String),

    #[error("LLM returned an empty response")]
    EmptyResponse,
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(0)
        } else if err.is_connect() {
            LlmError::Unavailable(err.to_string())
        } else {
            LlmError::Http(err.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("storage I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored run could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run {0} already stored")]
    DuplicateRun(String),
}

/// Top-level error taxonomy for an analysis run.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{0}")]
    LlmUnavailable(String),

    #[error("malformed LLM response: {0}")]
    ResponseParse(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("{0}")]
    Stage(String),
}

impl From<LlmError> for AnalysisError {
    fn from(err: LlmError) -> Self {
        AnalysisError::LlmUnavailable(err.to_string())
    }
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::Ingestion(_) => ErrorKind::Ingestion,
            AnalysisError::Parse(_) => ErrorKind::Parse,
            AnalysisError::LlmUnavailable(_) => ErrorKind::LlmUnavailable,
            AnalysisError::ResponseParse(_) => ErrorKind::ResponseParse,
            AnalysisError::Validation(_) => ErrorKind::Validation,
            AnalysisError::Persistence(_) => ErrorKind::Persistence,
            AnalysisError::Cancelled => ErrorKind::Cancelled,
            AnalysisError::Stage(_) => ErrorKind::StageFailure,
        }
    }

    /// Critical errors abort the run.
    pub fn is_critical(&self) -> bool {
        self.kind().is_critical()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Ingestion,
    Parse,
    LlmUnavailable,
    ResponseParse,
    Validation,
    Persistence,
    Cancelled,
    StageFailure,
}

impl ErrorKind {
    pub fn is_critical(&self) -> bool {
        matches!(self, ErrorKind::Ingestion | ErrorKind::Parse | ErrorKind::Cancelled)
    }
}

/// A recoverable problem reported by a generation stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageIssue {
    pub kind: ErrorKind,
    pub message: String,
}

impl StageIssue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn llm_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::LlmUnavailable, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }
}

impl fmt::Display for StageIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// One entry in a run's `pipeline_errors`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineError {
    pub stage: PipelineState,
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
}

impl PipelineError {
    pub fn from_error(stage: PipelineState, error: &AnalysisError) -> Self {
        Self {
            stage,
            kind: error.kind(),
            message: error.to_string(),
            recoverable: !error.is_critical(),
        }
    }

    pub fn from_issue(stage: PipelineState, issue: &StageIssue) -> Self {
        Self {
            stage,
            kind: issue.kind,
            message: issue.message.clone(),
            recoverable: true,
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self {
            stage: PipelineState::CompilingResults,
            kind: ErrorKind::Persistence,
            message: message.into(),
            recoverable: true,
        }
    }
}

/// Accumulates recoverable errors and warnings over a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorLog {
    errors: Vec<PipelineError>,
    warnings: Vec<String>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, error: PipelineError) {
        warn!(
            stage = %error.stage,
            kind = ?error.kind,
            "{}",
            error.message
        );
        self.errors.push(error);
    }

    pub fn record_issues(&mut self, stage: PipelineState, issues: &[StageIssue]) {
        for issue in issues {
            self.record(PipelineError::from_issue(stage, issue));
        }
    }

    pub fn add_warning(&mut self, message: String) {
        self.warnings.push(message);
    }

    pub fn into_parts(self) -> (Vec<PipelineError>, Vec<String>) {
        (self.errors, self.warnings)
    }

    pub fn get_summary(&self) -> ErrorSummary {
        ErrorSummary::from_run(&self.errors, &self.warnings)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub total_warnings: usize,
    pub error_counts: BTreeMap<ErrorKind, usize>,
}

impl ErrorSummary {
    /// Summarize the errors and warnings a finished run recorded.
    pub fn from_run(errors: &[PipelineError], warnings: &[String]) -> Self {
        let mut error_counts = BTreeMap::new();
        for error in errors {
            *error_counts.entry(error.kind).or_insert(0) += 1;
        }

        Self {
            total_errors: errors.len(),
            total_warnings: warnings.len(),
            error_counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_classification() {
        let ingestion: AnalysisError = IngestionError::NotFound(PathBuf::from("/nope")).into();
        assert!(ingestion.is_critical());
        assert_eq!(ingestion.kind(), ErrorKind::Ingestion);

        let parse: AnalysisError = ParseError::NoChunks(3).into();
        assert!(parse.is_critical());

        assert!(!AnalysisError::LlmUnavailable("down".to_string()).is_critical());
        assert!(!AnalysisError::Validation("bad".to_string()).is_critical());
        assert!(AnalysisError::Cancelled.is_critical());
    }

    #[test]
    fn test_io_error_mapping() {
        let err = IngestionError::from_io(
            PathBuf::from("/locked"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, IngestionError::PermissionDenied(_)));

        let err = IngestionError::from_io(
            PathBuf::from("/missing"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(matches!(err, IngestionError::NotFound(_)));
    }

    #[test]
    fn test_error_log_summary_counts_by_kind() {
        let mut log = ErrorLog::new();
        log.record_issues(
            PipelineState::IdentifyingHazards,
            &[StageIssue::validation("bad severity"), StageIssue::validation("unknown SR")],
        );
        log.record_issues(PipelineState::ExtractingFeatures, &[StageIssue::llm_unavailable("offline")]);
        log.add_warning("truncated chunk".to_string());

        let summary = log.get_summary();
        assert_eq!(summary.total_errors, 3);
        assert_eq!(summary.total_warnings, 1);
        assert_eq!(summary.error_counts[&ErrorKind::Validation], 2);
        assert_eq!(summary.error_counts[&ErrorKind::LlmUnavailable], 1);

        let (errors, warnings) = log.into_parts();
        assert_eq!(ErrorSummary::from_run(&errors, &warnings), summary);
    }

    #[test]
    fn test_summary_of_stored_run_errors() {
        let errors = vec![
            PipelineError::from_issue(PipelineState::ExtractingFeatures, &StageIssue::llm_unavailable("offline")),
            PipelineError::from_error(PipelineState::Parsing, &AnalysisError::Cancelled),
            PipelineError::persistence("disk full"),
        ];
        let summary = ErrorSummary::from_run(&errors, &[]);

        assert_eq!(summary.total_errors, 3);
        assert_eq!(summary.total_warnings, 0);
        assert_eq!(
            summary.error_counts.keys().copied().collect::<Vec<_>>(),
            vec![ErrorKind::LlmUnavailable, ErrorKind::Persistence, ErrorKind::Cancelled]
        );
    }
}
