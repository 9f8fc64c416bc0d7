pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod fuzzy_matcher;
pub mod intent;
pub mod llm;
pub mod pipeline;
pub mod prompts;
pub mod query_generator;
pub mod query_validator;
pub mod result_formatter;
pub mod schema;
pub mod schema_validator;

pub use config::PipelineConfig;
pub use db::{Database, RowSet, SqlValue, SqliteDatabase};
pub use error::{ErrorDescriptor, ErrorKind, PipelineError, Result, ValidationCheck};
pub use executor::{ExecutionResult, Executor};
pub use intent::{Intent, ValidatedIntent};
pub use llm::{LanguageModel, LlmClient, LlmError, ScriptedModel};
pub use pipeline::context::{PipelineContext, PipelineState, Stage};
pub use pipeline::{NodeInput, NodeOutput, Pipeline};
pub use query_generator::{GeneratedQuery, QueryGenerator};
pub use query_validator::{QueryValidator, ValidatedQuery};
pub use result_formatter::{AnswerKind, FormattedAnswer, ResultFormatter, ResultShape};
pub use schema::cache::SchemaCache;
pub use schema::SchemaSnapshot;
pub use schema_validator::SchemaValidator;
