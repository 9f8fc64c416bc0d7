//! Pipeline Orchestrator
//!
//! Drives one question through
//! `Parsing → SchemaValidating → Generating → QueryValidating → Executing → Formatting → Done`.
//! Any stage error moves the run to `Failed(stage, error)` and the failure
//! is handed to the formatter, so callers always get a `FormattedAnswer`.
//!
//! A `Pipeline` is shared by concurrent runs; each run owns its own
//! `PipelineContext`. The schema cache is the only shared state and runs
//! hold an immutable snapshot handle for their whole lifetime.

pub mod context;

use crate::config::PipelineConfig;
use crate::db::{Database, RowSet};
use crate::error::{ErrorDescriptor, Result};
use crate::executor::{ExecutionResult, Executor};
use crate::intent::parser::IntentParser;
use crate::llm::LanguageModel;
use crate::query_generator::QueryGenerator;
use crate::query_validator::QueryValidator;
use crate::result_formatter::{AnswerError, FormattedAnswer, ResultFormatter, ResultShape};
use crate::schema::cache::SchemaCache;
use crate::schema::SchemaSnapshot;
use crate::schema_validator::SchemaValidator;
use context::{PipelineContext, Stage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// Input of the upstream orchestration-graph node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInput {
    pub query: String,
}

/// Output of the upstream orchestration-graph node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutput {
    pub answer: String,
    pub rows: Option<RowSet>,
    pub error: Option<AnswerError>,
}

impl From<FormattedAnswer> for NodeOutput {
    fn from(answer: FormattedAnswer) -> Self {
        Self {
            answer: answer.answer,
            rows: answer.rows,
            error: answer.error,
        }
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    schema: Arc<SchemaCache>,
    database: Arc<dyn Database>,
    parser: IntentParser,
    schema_validator: SchemaValidator,
    generator: QueryGenerator,
    query_validator: QueryValidator,
    executor: Executor,
    formatter: ResultFormatter,
}

impl Pipeline {
    /// Load the schema from `database` and wire up all stages.
    ///
    /// Fails with `SchemaLoad` when the database cannot be read; this is the
    /// only error a caller ever sees from the pipeline.
    pub async fn initialize(
        config: PipelineConfig,
        database: Arc<dyn Database>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        let cache = SchemaCache::load(Arc::clone(&database)).await?;
        Ok(Self::with_schema_cache(config, database, model, Arc::new(cache)))
    }

    /// Build a pipeline around an existing (possibly shared) schema cache.
    pub fn with_schema_cache(
        config: PipelineConfig,
        database: Arc<dyn Database>,
        model: Arc<dyn LanguageModel>,
        schema: Arc<SchemaCache>,
    ) -> Self {
        let parser = IntentParser::new(Arc::clone(&model), config.llm_timeout);
        let generator = QueryGenerator::new(config.default_limit, config.row_ceiling)
            .with_fallback(Arc::clone(&model), config.llm_timeout);
        let mut formatter = ResultFormatter::new(config.max_display_rows);
        if config.narrative_summary {
            formatter = formatter.with_narrative(model, config.llm_timeout);
        }

        Self {
            parser,
            schema_validator: SchemaValidator::new(config.fuzzy_threshold),
            generator,
            query_validator: QueryValidator::new(config.row_ceiling),
            executor: Executor::new(config.query_timeout, config.max_result_rows),
            formatter,
            database,
            schema,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Current schema snapshot.
    pub fn schema(&self) -> Arc<SchemaSnapshot> {
        self.schema.snapshot()
    }

    /// Re-read schema metadata. Runs already in flight keep the snapshot they
    /// started with; a failed refresh leaves the current snapshot in place.
    pub async fn refresh_schema(&self) -> Result<Arc<SchemaSnapshot>> {
        self.schema.refresh().await
    }

    pub async fn run(&self, query: &str) -> FormattedAnswer {
        self.run_with_context(query).await.0
    }

    /// Graph-node entry point: `{query}` in, `{answer, rows, error}` out.
    pub async fn invoke(&self, input: NodeInput) -> NodeOutput {
        self.run(&input.query).await.into()
    }

    /// Run one question and also return its context (final state, artifacts
    /// and decision log).
    pub async fn run_with_context(&self, query: &str) -> (FormattedAnswer, PipelineContext) {
        let mut ctx = PipelineContext::with_parse_attempts(query, self.config.max_parse_attempts);
        let span = info_span!("pipeline", run_id = %ctx.run_id());
        let schema = self.schema.snapshot();
        info!(parent: &span, "Pipeline run started: {}", query);

        let outcome = self.drive(&mut ctx, &schema).instrument(span.clone()).await;
        let answer = match outcome {
            Ok(execution) => {
                ctx.advance(Stage::Formatting);
                let shape = ctx
                    .artifacts()
                    .validated_intent
                    .as_ref()
                    .map(|v| ResultShape::from_aggregation(v.aggregation().is_some()))
                    .unwrap_or_default();
                let answer = self
                    .formatter
                    .format_for(&execution, query, shape)
                    .instrument(span.clone())
                    .await;
                ctx.finish();
                answer
            }
            Err(error) => {
                let stage = ctx.stage().unwrap_or(Stage::Parsing);
                let answer = self.formatter.format_failure(stage, &error);
                ctx.fail_with(error);
                answer
            }
        };

        let elapsed = chrono::Utc::now() - ctx.started_at();
        info!(
            parent: &span,
            "Pipeline run finished in {}ms: {:?}",
            elapsed.num_milliseconds(),
            ctx.state()
        );
        (answer, ctx)
    }

    /// Stages up to and including execution. Stage errors are returned as
    /// descriptors with the context still at the failing stage.
    async fn drive(
        &self,
        ctx: &mut PipelineContext,
        schema: &SchemaSnapshot,
    ) -> std::result::Result<ExecutionResult, ErrorDescriptor> {
        let intent = self.parser.parse(ctx, schema).await?;
        ctx.artifacts_mut().intent = Some(intent.clone());

        ctx.advance(Stage::SchemaValidating);
        let validated = self.schema_validator.validate(&intent, schema)?;
        for substitution in validated.substitutions() {
            ctx.log(format!("substituted {}", substitution));
        }
        ctx.artifacts_mut().validated_intent = Some(validated.clone());

        ctx.advance(Stage::Generating);
        let question = ctx.query().to_string();
        let generated = self.generator.generate(&question, validated, schema).await?;
        ctx.log(format!("generated via {:?}: {}", generated.path, generated.sql));
        ctx.artifacts_mut().generated_query = Some(generated.clone());

        ctx.advance(Stage::QueryValidating);
        let validated_query = self.query_validator.validate(generated, schema)?;
        ctx.artifacts_mut().validated_query = Some(validated_query.clone());

        ctx.advance(Stage::Executing);
        let execution = self
            .executor
            .execute(&validated_query, self.database.as_ref())
            .await;
        ctx.artifacts_mut().execution = Some(execution.clone());
        match &execution.error {
            Some(error) => Err(error.clone()),
            None => {
                let rows = execution.rows.as_ref().map(RowSet::len).unwrap_or(0);
                ctx.log(format!("execution returned {} rows", rows));
                Ok(execution)
            }
        }
    }
}
