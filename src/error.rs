use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by the pipeline stages.
///
/// Every stage returns its own kind; the orchestrator converts them into a
/// terminal `Failed` state so none of these escape `Pipeline::run`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Schema load error: {0}")]
    SchemaLoad(String),

    #[error("Intent parse error: {0}")]
    IntentParse(String),

    #[error("Schema mismatch: unresolved reference '{reference}'")]
    SchemaMismatch {
        reference: String,
        candidates: Vec<String>,
    },

    #[error("Template selection error: {0}")]
    TemplateSelection(String),

    #[error("Query validation error ({check}): {detail}")]
    QueryValidation {
        check: ValidationCheck,
        detail: String,
        fragment: Option<String>,
    },

    #[error("Execution timed out after {}ms", .0.as_millis())]
    ExecutionTimeout(Duration),

    #[error("Execution connection error: {0}")]
    ExecutionConnection(String),

    #[error("Execution runtime error: {0}")]
    ExecutionRuntime(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn schema_mismatch(reference: impl Into<String>, candidates: Vec<String>) -> Self {
        PipelineError::SchemaMismatch {
            reference: reference.into(),
            candidates,
        }
    }

    pub fn validation(check: ValidationCheck, detail: impl Into<String>) -> Self {
        PipelineError::QueryValidation {
            check,
            detail: detail.into(),
            fragment: None,
        }
    }

    pub fn validation_at(
        check: ValidationCheck,
        detail: impl Into<String>,
        fragment: impl Into<String>,
    ) -> Self {
        PipelineError::QueryValidation {
            check,
            detail: detail.into(),
            fragment: Some(fragment.into()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SchemaLoad(_) => ErrorKind::SchemaLoad,
            PipelineError::IntentParse(_) => ErrorKind::IntentParse,
            PipelineError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            PipelineError::TemplateSelection(_) => ErrorKind::TemplateSelection,
            PipelineError::QueryValidation { .. } => ErrorKind::QueryValidation,
            PipelineError::ExecutionTimeout(_) => ErrorKind::ExecutionTimeout,
            PipelineError::ExecutionConnection(_) => ErrorKind::ExecutionConnection,
            PipelineError::ExecutionRuntime(_) => ErrorKind::ExecutionRuntime,
        }
    }

    /// The offending piece of input, when one can be named.
    pub fn fragment(&self) -> Option<&str> {
        match self {
            PipelineError::SchemaMismatch { reference, .. } => Some(reference),
            PipelineError::QueryValidation { fragment, .. } => fragment.as_deref(),
            _ => None,
        }
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            kind: self.kind(),
            message: self.to_string(),
            fragment: self.fragment().map(str::to_string),
        }
    }
}

/// Machine-readable error kind, used upstream for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaLoad,
    IntentParse,
    SchemaMismatch,
    TemplateSelection,
    QueryValidation,
    ExecutionTimeout,
    ExecutionConnection,
    ExecutionRuntime,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaLoad => "schema_load",
            ErrorKind::IntentParse => "intent_parse",
            ErrorKind::SchemaMismatch => "schema_mismatch",
            ErrorKind::TemplateSelection => "template_selection",
            ErrorKind::QueryValidation => "query_validation",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::ExecutionConnection => "execution_connection",
            ErrorKind::ExecutionRuntime => "execution_runtime",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure record. `message` may contain SQL or schema names and
/// is kept for the run log only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: ErrorKind,
    pub message: String,
    pub fragment: Option<String>,
}

impl From<PipelineError> for ErrorDescriptor {
    fn from(err: PipelineError) -> Self {
        err.descriptor()
    }
}

/// The Query Validator check that rejected a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCheck {
    Syntax,
    ParameterMismatch,
    MultipleStatements,
    ReadOnly,
    MutatingKeyword,
    UnknownTable,
    UnknownColumn,
    CartesianJoin,
    UnboundedJoin,
}

impl ValidationCheck {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationCheck::Syntax => "syntax",
            ValidationCheck::ParameterMismatch => "parameter_mismatch",
            ValidationCheck::MultipleStatements => "multiple_statements",
            ValidationCheck::ReadOnly => "read_only",
            ValidationCheck::MutatingKeyword => "mutating_keyword",
            ValidationCheck::UnknownTable => "unknown_table",
            ValidationCheck::UnknownColumn => "unknown_column",
            ValidationCheck::CartesianJoin => "cartesian_join",
            ValidationCheck::UnboundedJoin => "unbounded_join",
        }
    }
}

impl fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
