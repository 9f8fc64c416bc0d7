use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use housing_query::config::PipelineConfig;
use housing_query::db::{Database, SqliteDatabase};
use housing_query::llm::LlmClient;
use housing_query::pipeline::Pipeline;
use housing_query::query_generator::GeneratedQuery;
use housing_query::query_validator::QueryValidator;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "housing-query")]
#[command(about = "Answer natural-language questions over the housing estate database")]
struct Args {
    /// SQLite database (default: DATABASE_PATH or data/agency/agency_data.db)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ask a question in natural language
    Ask {
        question: String,

        /// Print the full answer (rows and error kind) as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the schema summary the language model sees
    Schema,
    /// Run the read-only safety checks on a SQL statement without executing it
    CheckSql { sql: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = PipelineConfig::from_env().context("invalid configuration")?;
    if let Some(database) = args.database {
        config.database_path = database;
    }
    info!("Using database {}", config.database_path.display());
    let database: Arc<dyn Database> = Arc::new(SqliteDatabase::new(&config.database_path));

    match args.command {
        Command::Ask { question, json } => {
            let model = Arc::new(LlmClient::from_settings(&config.llm));
            let pipeline = Pipeline::initialize(config, database, model)
                .await
                .context("failed to load the database schema")?;
            let answer = pipeline.run(&question).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                println!("{}", answer.answer);
            }
        }
        Command::Schema => {
            let schema = database.load_schema().await.context("failed to load the database schema")?;
            println!("{}", schema.summary());
        }
        Command::CheckSql { sql } => {
            let schema = database.load_schema().await.context("failed to load the database schema")?;
            let validator = QueryValidator::new(config.row_ceiling);
            match validator.validate(GeneratedQuery::manual(sql, Vec::new()), &schema) {
                Ok(query) => println!("OK: reads {}", query.tables().join(", ")),
                Err(e) => {
                    println!("REJECTED: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
