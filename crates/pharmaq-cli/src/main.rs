//! pharmaq command-line front end
//!
//! Loads config.yaml and .env, opens the DrugCentral database read-only and
//! runs one question through the query pipeline.

use anyhow::Context;
use clap::Parser;
use pharmaq_core::{
    AnthropicModel, ConnectionPool, DuckExecutor, LanguageModel, OpenAiModel, PipelineMetrics,
    QueryPipeline, SchemaContext, SqlGuard,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::info;

mod cli;
mod config;
mod logging;

use cli::{AskArgs, Cli, Command};
use config::{Config, Provider};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Load environment variables (API keys)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.apply_logging_env();
    logging::init()?;

    let schema = SchemaContext::load(&config.schema.path)
        .with_context(|| format!("loading schema context from {}", config.schema.path))?;

    match cli.command {
        Command::Schema => {
            print!("{}", schema.render_prompt());
            Ok(ExitCode::SUCCESS)
        }
        Command::Check { sql } => {
            let guard = SqlGuard::new(config.pipeline.row_limit_ceiling);
            let verdict = guard.check_sql(&sql, 1, &schema);
            print!("{}", cli::render_verdict(&verdict));
            Ok(if verdict.is_accepted() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }
        Command::Ask(args) => ask(&config, schema, args).await,
    }
}

async fn ask(config: &Config, schema: SchemaContext, args: AskArgs) -> anyhow::Result<ExitCode> {
    let pool = ConnectionPool::open(
        &config.database.path,
        config.database.pool_size,
        config.database.read_only,
        config.database.memory_limit_mb,
        config.database.acquire_timeout(),
    )
    .with_context(|| format!("opening {}", config.database.path))?;

    let executor = Arc::new(DuckExecutor::new(
        pool,
        config.pipeline.statement_timeout(),
        config.pipeline.max_rows,
    ));

    if config.schema.verify_on_startup {
        let conn = executor.pool().acquire().await?;
        schema
            .verify_against(&conn)
            .context("schema context does not match the database")?;
        info!(views = schema.describe().len(), "Schema context verified");
    }

    let api_key = config.api_key()?;
    let sql_model = build_model(config, &api_key, config.llm.sql_model());
    let answer_model = build_model(config, &api_key, config.llm.answer_model());
    info!(
        provider = ?config.llm.provider,
        sql_model = config.llm.sql_model(),
        answer_model = config.llm.answer_model(),
        "Language models configured"
    );

    let registry = prometheus::Registry::new();
    let mut pipeline = QueryPipeline::new(
        Arc::new(schema),
        sql_model,
        answer_model,
        executor.clone(),
        config.pipeline.clone(),
    )?;
    if args.metrics {
        pipeline = pipeline.with_metrics(PipelineMetrics::new(&registry)?);
    }

    let outcome = pipeline.answer(&args.question, args.context.as_deref()).await;
    executor.pool().close();

    let code = match outcome {
        Ok(answer) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&cli::render_json(&answer))?);
            } else {
                print!("{}", cli::render_answer(&answer, args.show_rows));
            }
            ExitCode::SUCCESS
        }
        Err(failed) => {
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "error": failed.kind.code(),
                        "reason": failed.reason,
                        "attempts": failed.attempts,
                        "last_sql": failed.last_sql,
                    }))?
                );
            } else {
                eprint!("{}", cli::render_failure(&failed));
            }
            ExitCode::FAILURE
        }
    };

    if args.metrics {
        print!("{}", pharmaq_core::metrics::render(&registry)?);
    }

    Ok(code)
}

fn build_model(config: &Config, api_key: &str, model: &str) -> Arc<dyn LanguageModel> {
    match (config.llm.provider, config.llm.api_base.as_deref()) {
        (Provider::OpenAi, Some(base)) => {
            Arc::new(OpenAiModel::with_api_base(api_key, base, model))
        }
        (Provider::OpenAi, None) => Arc::new(OpenAiModel::new(api_key, model)),
        (Provider::Anthropic, Some(base)) => {
            Arc::new(AnthropicModel::new(api_key, model).with_api_base(base))
        }
        (Provider::Anthropic, None) => Arc::new(AnthropicModel::new(api_key, model)),
    }
}
