pub mod ai;
pub mod analysis;
pub mod config;
pub mod db;
pub mod http;
pub mod pipeline;
pub mod storage;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Backend, Cli, Command, Settings};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CHART_FILE: &str = "transaction_analysis.svg";

pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wire the model, store and schema into a ready pipeline.
pub async fn build_pipeline(settings: &Settings) -> Result<pipeline::Pipeline> {
    let executor = settings.build_executor().await?;
    let schema = Arc::new(settings.load_schema()?);
    let model = Arc::new(ai::ChatCompletionsClient::new(settings.ai_config())?);
    info!(
        tables = schema.tables.len(),
        model = %settings.llm_model,
        endpoint = %settings.llm_url,
        "pipeline ready"
    );
    Ok(pipeline::Pipeline::new(model, executor, schema)
        .with_generation_attempts(settings.generation_attempts))
}

fn prepare_store(settings: &Settings) -> Result<()> {
    if settings.backend == Backend::Sqlite {
        if let Some(report) = storage::ensure_store(&settings.db_path, &settings.data_dir)? {
            info!(rows = report.total_rows(), "bank store initialized");
        }
    }
    Ok(())
}

#[tokio::main]
pub async fn run() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let settings = cli.settings;
    match cli.command {
        Command::Load => {
            let report = storage::load_store(&settings.db_path, &settings.data_dir)?;
            println!(
                "loaded {} rows into {}",
                report.total_rows(),
                settings.db_path.display()
            );
        }
        Command::Serve { listen } => {
            prepare_store(&settings)?;
            let pipeline = build_pipeline(&settings).await?;
            let listener = tokio::net::TcpListener::bind(listen)
                .await
                .with_context(|| format!("failed to bind {listen}"))?;
            http::serve(listener, http::AppState::new(Arc::new(pipeline))).await?;
        }
        Command::Ask { question } => {
            prepare_store(&settings)?;
            let pipeline = build_pipeline(&settings).await?;
            let bundle = pipeline.answer(&question).await?;
            if let Some(chart) = &bundle.chart {
                std::fs::write(Path::new(CHART_FILE), &chart.svg)
                    .with_context(|| format!("failed to write {CHART_FILE}"))?;
                info!(path = CHART_FILE, "chart written");
            }
            let mut response = http::QueryResponse::from(bundle);
            response.image = None;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
