mod common;

use common::{housing_db, KeyedModel};
use housing_query::config::PipelineConfig;
use housing_query::db::{Database, SqlValue, SqliteDatabase};
use housing_query::error::ErrorKind;
use housing_query::llm::{LanguageModel, ScriptedModel};
use housing_query::pipeline::context::{PipelineState, Stage};
use housing_query::pipeline::{NodeInput, Pipeline};
use housing_query::query_generator::{GeneratedQuery, GenerationPath};
use housing_query::query_validator::QueryValidator;
use housing_query::result_formatter::{AnswerKind, NO_RECORDS_ANSWER};
use housing_query::schema::cache::SchemaCache;
use housing_query::{PipelineError, ValidationCheck};
use rusqlite::Connection;
use std::sync::Arc;

const TAIKOO_SHING_INTENT: &str = r#"{
    "tables": ["estates"],
    "columns": ["avg_price"],
    "filters": [{"column": "name", "operator": "=", "value": "Taikoo Shing"}],
    "aggregation": null,
    "order_by": null,
    "limit": null
}"#;

async fn pipeline(model: Arc<dyn LanguageModel>) -> Pipeline {
    let database = Arc::new(SqliteDatabase::new(housing_db()));
    Pipeline::initialize(PipelineConfig::default(), database, model)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_average_price_question_end_to_end() {
    let model = Arc::new(ScriptedModel::new([TAIKOO_SHING_INTENT]));
    let pipeline = pipeline(model.clone()).await;

    let (answer, ctx) = pipeline
        .run_with_context("What is the average price in Taikoo Shing?")
        .await;

    assert_eq!(answer.answer, "The average price is HK$15,800.");
    assert_eq!(answer.kind, AnswerKind::SingleValue);
    assert!(answer.error.is_none());
    assert_eq!(ctx.state(), &PipelineState::Done);
    assert_eq!(model.call_count(), 1);

    let validated = ctx.artifacts().validated_intent.as_ref().unwrap();
    assert!(validated.substitutions().is_empty());
    let generated = ctx.artifacts().generated_query.as_ref().unwrap();
    assert_eq!(generated.sql, "SELECT avg_price FROM estates WHERE name = ? LIMIT 50");
    assert_eq!(generated.params, vec![SqlValue::Text("Taikoo Shing".to_string())]);
    assert!(matches!(generated.path, GenerationPath::Template(_)));
    assert_eq!(answer.rows.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_table_halts_at_schema_validation() {
    let model = Arc::new(ScriptedModel::new([
        r#"{"tables": ["flatss"], "columns": ["price"]}"#,
    ]));
    let pipeline = pipeline(model).await;

    let (answer, ctx) = pipeline.run_with_context("How much are the flatss?").await;

    assert!(answer.answer.contains("I couldn't find information about that"));
    let error = answer.error.unwrap();
    assert_eq!(error.kind, ErrorKind::SchemaMismatch);
    assert_eq!(error.stage, Stage::SchemaValidating);

    let (stage, descriptor) = ctx.failure().unwrap();
    assert_eq!(stage, Stage::SchemaValidating);
    assert_eq!(descriptor.fragment.as_deref(), Some("flatss"));
    assert!(ctx.artifacts().generated_query.is_none());
    assert!(ctx.artifacts().execution.is_none());
}

#[tokio::test]
async fn test_unbounded_fallback_join_is_never_executed() {
    // No foreign-key path joins estates to facilities, so generation falls
    // back to the model, which forgets the LIMIT.
    let model = Arc::new(ScriptedModel::new([
        r#"{"tables": ["estates", "facilities"], "columns": ["estates.name", "facilities.facility_name"]}"#,
        "```sql\nSELECT e.name, f.facility_name FROM estates e JOIN facilities f ON f.facility_name = e.name\n```",
    ]));
    let pipeline = pipeline(model.clone()).await;

    let (answer, ctx) = pipeline
        .run_with_context("Which estates have which facilities?")
        .await;

    assert_eq!(model.call_count(), 2);
    let error = answer.error.unwrap();
    assert_eq!(error.kind, ErrorKind::QueryValidation);
    assert_eq!(error.stage, Stage::QueryValidating);
    assert!(!answer.answer.contains("SELECT"));

    let (_, descriptor) = ctx.failure().unwrap();
    assert!(descriptor.message.contains("unbounded_join"));
    assert_eq!(
        ctx.artifacts().generated_query.as_ref().unwrap().path,
        GenerationPath::ModelFallback
    );
    assert!(ctx.artifacts().execution.is_none());
}

#[tokio::test]
async fn test_unreachable_database_yields_safe_answer() {
    let snapshot = SqliteDatabase::new(housing_db()).load_schema().await.unwrap();
    let broken: Arc<dyn Database> = Arc::new(SqliteDatabase::new("/nonexistent/agency/agency_data.db"));
    let cache = Arc::new(SchemaCache::with_snapshot(Arc::clone(&broken), snapshot));
    let model = Arc::new(ScriptedModel::new([TAIKOO_SHING_INTENT]));
    let pipeline = Pipeline::with_schema_cache(PipelineConfig::default(), broken, model, cache);

    let (answer, ctx) = pipeline
        .run_with_context("What is the average price in Taikoo Shing?")
        .await;

    assert!(answer.answer.contains("temporarily unable to retrieve data"));
    assert!(!answer.answer.contains("nonexistent"));
    let error = answer.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExecutionConnection);
    assert_eq!(error.stage, Stage::Executing);
    assert!(ctx
        .log_entries()
        .iter()
        .any(|e| e.stage == Stage::Executing && e.message.contains("Execution connection error")));
}

#[tokio::test]
async fn test_unusable_model_output_is_reprompted_once() {
    let model = Arc::new(ScriptedModel::new([
        "Sure! The user wants the average price.",
        TAIKOO_SHING_INTENT,
    ]));
    let pipeline = pipeline(model.clone()).await;

    let (answer, ctx) = pipeline
        .run_with_context("What is the average price in Taikoo Shing?")
        .await;

    assert!(answer.is_success());
    assert_eq!(ctx.parse_attempts(), 2);
    assert_eq!(model.call_count(), 2);
    assert!(model.prompts()[1].contains("could not be used"));
}

#[tokio::test]
async fn test_parsing_gives_up_after_one_reprompt() {
    let model = Arc::new(ScriptedModel::new(["nope", "{\"tables\": []}", TAIKOO_SHING_INTENT]));
    let pipeline = pipeline(model.clone()).await;

    let answer = pipeline.run("What is the average price in Taikoo Shing?").await;

    assert_eq!(model.call_count(), 2);
    let error = answer.error.unwrap();
    assert_eq!(error.kind, ErrorKind::IntentParse);
    assert_eq!(error.stage, Stage::Parsing);
}

#[tokio::test]
async fn test_no_matching_records() {
    let model = Arc::new(ScriptedModel::new([
        r#"{"tables": ["estates"], "columns": ["name", "district"], "filters": ["name = 'Atlantis Gardens'"]}"#,
    ]));
    let pipeline = pipeline(model).await;

    let (answer, ctx) = pipeline.run_with_context("Tell me about Atlantis Gardens").await;

    assert_eq!(answer.answer, NO_RECORDS_ANSWER);
    assert_eq!(answer.kind, AnswerKind::Empty);
    assert!(answer.error.is_none());
    assert_eq!(ctx.state(), &PipelineState::Done);
}

#[tokio::test]
async fn test_join_template_reaches_transactions() {
    let model = Arc::new(ScriptedModel::new([
        r#"{
            "tables": ["estates", "transactions"],
            "columns": [{"table": "transactions", "column": "price"}, {"table": "transactions", "column": "tx_date"}],
            "filters": [{"table": "estates", "column": "name", "value": "Taikoo Shing"}]
        }"#,
    ]));
    let pipeline = pipeline(model).await;

    let (answer, ctx) = pipeline
        .run_with_context("Show recent transactions in Taikoo Shing")
        .await;

    assert!(answer.is_success(), "{:?}", ctx.log_entries());
    let rows = answer.rows.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(answer.answer.contains("HK$8,250,000"));
    let validated = ctx.artifacts().validated_query.as_ref().unwrap();
    assert!(validated.tables().contains(&"units".to_string()));
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let model = Arc::new(KeyedModel::new(&[
        ("Taikoo Shing", TAIKOO_SHING_INTENT),
        (
            "Which districts",
            r#"{"tables": ["estates"], "columns": ["avg_price"],
                "aggregation": {"function": "avg", "group_by": ["district"]},
                "order_by": {"column": "avg_price", "direction": "desc"}, "limit": 2}"#,
        ),
    ]));
    let pipeline = Arc::new(pipeline(model.clone()).await);

    let spawned = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            pipeline
                .run_with_context("What is the average price in Taikoo Shing?")
                .await
        })
    };
    let ((by_district, district_ctx), spawned) = tokio::join!(
        pipeline.run_with_context("Which districts are most expensive on average?"),
        spawned
    );
    let (taikoo, taikoo_ctx) = spawned.unwrap();

    assert_eq!(taikoo.answer, "The average price is HK$15,800.");
    assert_eq!(by_district.kind, AnswerKind::Table);
    let rows = by_district.rows.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.rows[0]["district"], serde_json::json!("Eastern"));

    assert_ne!(taikoo_ctx.run_id(), district_ctx.run_id());
    assert_eq!(taikoo_ctx.query(), "What is the average price in Taikoo Shing?");
    assert_eq!(model.call_count(), 2);
}

#[tokio::test]
async fn test_graph_node_interface() {
    let model = Arc::new(ScriptedModel::new([TAIKOO_SHING_INTENT]));
    let pipeline = pipeline(model).await;

    let output = pipeline
        .invoke(NodeInput {
            query: "What is the average price in Taikoo Shing?".to_string(),
        })
        .await;

    let json = serde_json::to_value(&output).unwrap();
    assert_eq!(json["answer"], "The average price is HK$15,800.");
    assert_eq!(json["rows"]["rows"][0]["avg_price"], 15800.0);
    assert!(json["error"].is_null());
}

#[tokio::test]
async fn test_failed_run_reports_kind_and_stage_only() {
    let model = Arc::new(ScriptedModel::default());
    let pipeline = pipeline(model).await;

    let output = pipeline
        .invoke(NodeInput {
            query: "anything".to_string(),
        })
        .await;

    let json = serde_json::to_value(&output).unwrap();
    assert_eq!(json["error"]["kind"], "intent_parse");
    assert_eq!(json["error"]["stage"], "parsing");
    assert!(json["rows"].is_null());
}

#[tokio::test]
async fn test_schema_refresh_swaps_snapshot() {
    let path = housing_db();
    let database = Arc::new(SqliteDatabase::new(&path));
    let pipeline = Pipeline::initialize(
        PipelineConfig::default(),
        database,
        Arc::new(ScriptedModel::default()),
    )
    .await
    .unwrap();

    let before = pipeline.schema();
    Connection::open(&path)
        .unwrap()
        .execute_batch("CREATE TABLE agents (agent_id INTEGER PRIMARY KEY, agent_name TEXT);")
        .unwrap();

    let after = pipeline.refresh_schema().await.unwrap();
    assert!(after.exists("agents", Some("agent_name")));
    assert!(pipeline.schema().exists("agents", None));
    // Holders of the old handle keep a consistent view.
    assert!(!before.exists("agents", None));
    assert!(before.exists("estates", Some("avg_price")));
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_snapshot() {
    let snapshot = SqliteDatabase::new(housing_db()).load_schema().await.unwrap();
    let cache = SchemaCache::with_snapshot(
        Arc::new(SqliteDatabase::new("/nonexistent/agency/agency_data.db")),
        snapshot,
    );

    let err = cache.refresh().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaLoad);
    assert!(cache.exists("estates", Some("avg_price")));
    assert!(cache.columns_of("buildings").contains("building_name"));
}

#[tokio::test]
async fn test_initialize_fails_without_database() {
    let result = Pipeline::initialize(
        PipelineConfig::default(),
        Arc::new(SqliteDatabase::new("/nonexistent/agency/agency_data.db")),
        Arc::new(ScriptedModel::default()),
    )
    .await;
    assert!(matches!(result, Err(PipelineError::SchemaLoad(_))));
}

#[tokio::test]
async fn test_mutating_keywords_rejected_under_obfuscation() {
    let schema = SqliteDatabase::new(housing_db()).load_schema().await.unwrap();
    let validator = QueryValidator::new(500);

    let statements = [
        "INSERT INTO estates (name) VALUES ('x')",
        "UPDATE estates SET avg_price = 0",
        "DELETE FROM estates",
        "DROP TABLE estates",
        "ALTER TABLE estates ADD COLUMN x TEXT",
    ];
    let casings: [fn(&str) -> String; 3] = [
        |s| s.to_lowercase(),
        |s| s.to_uppercase(),
        |s| {
            s.chars()
                .enumerate()
                .map(|(i, c)| if i % 2 == 0 { c.to_ascii_lowercase() } else { c.to_ascii_uppercase() })
                .collect()
        },
    ];
    let separators = [" ", "\n", "\t", "  \r\n  ", " /* x */ "];

    for statement in statements {
        for casing in casings {
            for separator in separators {
                let sql = casing(statement).split(' ').collect::<Vec<_>>().join(separator);
                for candidate in [sql.clone(), format!("SELECT name FROM estates LIMIT 1;{}{}", separator, sql)] {
                    let err = validator
                        .validate(GeneratedQuery::manual(candidate.clone(), vec![]), &schema)
                        .unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::QueryValidation, "accepted: {:?}", candidate);
                }
            }
        }
    }

    let err = validator
        .validate(GeneratedQuery::manual("dElEtE\tFROM estates", vec![]), &schema)
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::QueryValidation {
            check: ValidationCheck::MutatingKeyword,
            ..
        }
    ));
}
