//! Per-run pipeline context and state machine.

use crate::config::MAX_PARSE_ATTEMPTS;
use crate::error::{ErrorDescriptor, PipelineError};
use crate::executor::ExecutionResult;
use crate::intent::{Intent, ValidatedIntent};
use crate::query_generator::GeneratedQuery;
use crate::query_validator::ValidatedQuery;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Parsing,
    SchemaValidating,
    Generating,
    QueryValidating,
    Executing,
    Formatting,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parsing => "parsing",
            Stage::SchemaValidating => "schema_validating",
            Stage::Generating => "generating",
            Stage::QueryValidating => "query_validating",
            Stage::Executing => "executing",
            Stage::Formatting => "formatting",
        }
    }

    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Parsing => Some(Stage::SchemaValidating),
            Stage::SchemaValidating => Some(Stage::Generating),
            Stage::Generating => Some(Stage::QueryValidating),
            Stage::QueryValidating => Some(Stage::Executing),
            Stage::Executing => Some(Stage::Formatting),
            Stage::Formatting => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineState {
    Running { stage: Stage },
    Done,
    Failed { stage: Stage, error: ErrorDescriptor },
}

/// Stage-indexed decision record. May hold SQL and raw error detail; never
/// shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub stage: Stage,
    pub message: String,
}

/// Intermediate outputs, filled in as stages complete.
#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    pub intent: Option<Intent>,
    pub validated_intent: Option<ValidatedIntent>,
    pub generated_query: Option<GeneratedQuery>,
    pub validated_query: Option<ValidatedQuery>,
    pub execution: Option<ExecutionResult>,
}

/// Mutable carrier owned by exactly one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    run_id: Uuid,
    query: String,
    started_at: DateTime<Utc>,
    state: PipelineState,
    artifacts: Artifacts,
    log: Vec<LogEntry>,
    parse_attempts: u8,
    max_parse_attempts: u8,
}

impl PipelineContext {
    pub fn new(query: impl Into<String>) -> Self {
        Self::with_parse_attempts(query, MAX_PARSE_ATTEMPTS)
    }

    /// `max_parse_attempts` is clamped to 1..=MAX_PARSE_ATTEMPTS.
    pub fn with_parse_attempts(query: impl Into<String>, max_parse_attempts: u8) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            query: query.into(),
            started_at: Utc::now(),
            state: PipelineState::Running {
                stage: Stage::Parsing,
            },
            artifacts: Artifacts::default(),
            log: Vec::new(),
            parse_attempts: 0,
            max_parse_attempts: max_parse_attempts.clamp(1, MAX_PARSE_ATTEMPTS),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Stage currently running, or the stage a failure happened in.
    pub fn stage(&self) -> Option<Stage> {
        match &self.state {
            PipelineState::Running { stage } | PipelineState::Failed { stage, .. } => Some(*stage),
            PipelineState::Done => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.state, PipelineState::Running { .. })
    }

    pub fn failure(&self) -> Option<(Stage, &ErrorDescriptor)> {
        match &self.state {
            PipelineState::Failed { stage, error } => Some((*stage, error)),
            _ => None,
        }
    }

    pub fn artifacts(&self) -> &Artifacts {
        &self.artifacts
    }

    pub fn artifacts_mut(&mut self) -> &mut Artifacts {
        &mut self.artifacts
    }

    pub fn log_entries(&self) -> &[LogEntry] {
        &self.log
    }

    /// Append to the decision log under the current stage.
    pub fn log(&mut self, message: impl Into<String>) {
        let stage = self.stage().unwrap_or(Stage::Formatting);
        self.log.push(LogEntry {
            timestamp: Utc::now(),
            stage,
            message: message.into(),
        });
    }

    /// Move from the running stage to `next`. Only the forward transition of
    /// the linear stage order is accepted.
    pub fn advance(&mut self, next: Stage) -> bool {
        match self.state {
            PipelineState::Running { stage } if stage.next() == Some(next) => {
                self.state = PipelineState::Running { stage: next };
                true
            }
            _ => {
                warn!(run_id = %self.run_id, "Rejected transition to {} from {:?}", next, self.state);
                false
            }
        }
    }

    /// `Running(Formatting) -> Done`.
    pub fn finish(&mut self) -> bool {
        match self.state {
            PipelineState::Running {
                stage: Stage::Formatting,
            } => {
                self.state = PipelineState::Done;
                true
            }
            _ => false,
        }
    }

    /// Enter the terminal `Failed` state at the running stage, logging the
    /// full error.
    pub fn fail(&mut self, error: &PipelineError) {
        self.fail_with(error.descriptor());
    }

    /// As `fail`, for errors already carried as descriptors (execution results).
    pub fn fail_with(&mut self, error: ErrorDescriptor) {
        if let PipelineState::Running { stage } = self.state {
            self.log(format!("failed: {}", error.message));
            self.state = PipelineState::Failed { stage, error };
        }
    }

    /// Claim the next intent-parsing attempt; `None` once the bound is spent.
    pub fn begin_parse_attempt(&mut self) -> Option<u8> {
        if self.parse_attempts >= self.max_parse_attempts {
            return None;
        }
        self.parse_attempts += 1;
        Some(self.parse_attempts)
    }

    pub fn parse_attempts(&self) -> u8 {
        self.parse_attempts
    }

    pub fn max_parse_attempts(&self) -> u8 {
        self.max_parse_attempts
    }
}
