use crate::ai::{AIConfig, SchemaContext};
use crate::db::{connect, describe_store, ConnectionConfig, PostgresExecutor, QueryExecutor, SqliteExecutor, SslMode};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Ask questions about the bank dataset in plain language
#[derive(Debug, Parser)]
#[command(name = "bankql")]
#[command(about = "Natural-language questions over a banking dataset", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    /// Emit logs as JSON lines
    #[arg(long, global = true, env = "BANKQL_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "BANKQL_LISTEN", default_value = "0.0.0.0:5000")]
        listen: SocketAddr,
    },
    /// Answer one question and print the result as JSON
    Ask {
        question: String,
    },
    /// (Re)build the SQLite store from the CSV files
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// SQLite store
    #[arg(long, global = true, env = "BANKQL_DB_PATH", default_value = "bank_data.db")]
    pub db_path: PathBuf,

    /// Directory holding the <table>.csv files
    #[arg(long, global = true, env = "BANKQL_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    #[arg(long, global = true, env = "BANKQL_SCHEMA_FILE", default_value = "data/schema.json")]
    pub schema_file: PathBuf,

    #[arg(long, global = true, env = "BANKQL_SEMANTIC_FILE", default_value = "data/semantic_layer.json")]
    pub semantic_file: PathBuf,

    #[arg(long, global = true, env = "BANKQL_BACKEND", value_enum, default_value = "sqlite")]
    pub backend: Backend,

    #[arg(long, global = true, env = "PGHOST", default_value = "localhost")]
    pub pg_host: String,

    #[arg(long, global = true, env = "PGPORT", default_value_t = 5432)]
    pub pg_port: u16,

    #[arg(long, global = true, env = "PGDATABASE", default_value = "bank")]
    pub pg_database: String,

    #[arg(long, global = true, env = "PGUSER", default_value = "postgres")]
    pub pg_user: String,

    #[arg(long, global = true, env = "PGPASSWORD", default_value = "", hide_env_values = true)]
    pub pg_password: String,

    #[arg(long, global = true, env = "BANKQL_PG_SSL_MODE", value_enum, default_value = "disable")]
    pub pg_ssl_mode: SslMode,

    /// OpenAI-compatible chat completions URL
    #[arg(
        long,
        global = true,
        env = "LLM_URL",
        default_value = "http://localhost:8085/v1/chat/completions"
    )]
    pub llm_url: String,

    #[arg(long, global = true, env = "LLM_MODEL", default_value = "gpt-oss-20b")]
    pub llm_model: String,

    #[arg(long, global = true, env = "LLM_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    #[arg(long, global = true, env = "LLM_TIMEOUT_SECS", default_value_t = 60)]
    pub llm_timeout_secs: u64,

    #[arg(long, global = true, env = "BANKQL_QUERY_TIMEOUT_SECS", default_value_t = 30)]
    pub query_timeout_secs: u64,

    /// Hard cap on rows returned per query
    #[arg(long, global = true, env = "BANKQL_ROW_CAP", default_value_t = 1000)]
    pub row_cap: usize,

    /// Model calls allowed per question when generated SQL is rejected
    #[arg(long, global = true, env = "BANKQL_GENERATION_ATTEMPTS", default_value_t = 1)]
    pub generation_attempts: usize,
}

impl Settings {
    pub fn ai_config(&self) -> AIConfig {
        AIConfig {
            endpoint: self.llm_url.clone(),
            model: self.llm_model.clone(),
            api_key: self.llm_api_key.clone().filter(|k| !k.is_empty()),
            timeout: Duration::from_secs(self.llm_timeout_secs),
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            host: self.pg_host.clone(),
            port: self.pg_port,
            database: self.pg_database.clone(),
            user: self.pg_user.clone(),
            password: self.pg_password.clone(),
            ssl_mode: self.pg_ssl_mode,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub async fn build_executor(&self) -> Result<Arc<dyn QueryExecutor>> {
        match self.backend {
            Backend::Sqlite => Ok(Arc::new(SqliteExecutor::new(
                &self.db_path,
                self.row_cap,
                self.query_timeout(),
            ))),
            Backend::Postgres => {
                let config = self.connection_config();
                let client = connect(&config).await?;
                let executor = PostgresExecutor::new(client, self.row_cap, self.query_timeout())
                    .await
                    .context("failed to configure Postgres session")?;
                info!(host = %config.host, database = %config.database, "connected to Postgres");
                Ok(Arc::new(executor))
            }
        }
    }

    /// Schema from `schema_file`, or introspected from the SQLite store when that file is absent.
    pub fn load_schema(&self) -> Result<SchemaContext> {
        if self.schema_file.exists() {
            return SchemaContext::load(&self.schema_file, &self.semantic_file);
        }
        warn!(path = %self.schema_file.display(), "schema file missing; introspecting store");
        let tables = describe_store(&self.db_path)?;
        let semantics = SchemaContext::load_semantics(&self.semantic_file)?;
        Ok(SchemaContext::new(tables, semantics))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::try_parse_from(["bankql", "load"]).unwrap();
        let s = &cli.settings;
        assert_eq!(s.db_path, PathBuf::from("bank_data.db"));
        assert_eq!(s.backend, Backend::Sqlite);
        assert_eq!(s.row_cap, 1000);
        assert_eq!(s.generation_attempts, 1);
        assert_eq!(s.ai_config().timeout, Duration::from_secs(60));
        assert_eq!(s.query_timeout(), Duration::from_secs(30));
        assert!(matches!(cli.command, Command::Load));
    }

    #[test]
    fn parses_subcommands_and_overrides() {
        let cli = Cli::try_parse_from([
            "bankql",
            "ask",
            "How many accounts?",
            "--backend",
            "postgres",
            "--pg-ssl-mode",
            "require",
            "--row-cap",
            "50",
            "--llm-api-key",
            "",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Ask { ref question } if question == "How many accounts?"));
        assert_eq!(cli.settings.backend, Backend::Postgres);
        assert_eq!(cli.settings.connection_config().ssl_mode, SslMode::Require);
        assert_eq!(cli.settings.row_cap, 50);
        assert!(cli.settings.ai_config().api_key.is_none());

        let cli = Cli::try_parse_from(["bankql", "serve", "--listen", "127.0.0.1:8080"]).unwrap();
        assert!(matches!(cli.command, Command::Serve { listen } if listen.port() == 8080));
    }

    #[test]
    fn falls_back_to_introspection() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("bank.db");
        rusqlite::Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE account (account_id TEXT PRIMARY KEY)")
            .unwrap();

        let mut cli = Cli::try_parse_from(["bankql", "load"]).unwrap();
        cli.settings.db_path = db;
        cli.settings.schema_file = dir.path().join("missing.json");
        cli.settings.semantic_file = dir.path().join("missing_semantics.json");

        let schema = cli.settings.load_schema().unwrap();
        assert_eq!(schema.tables.len(), 1);
        assert_eq!(schema.tables[0].name, "account");
        assert!(schema.semantics.business_rules.is_empty());
    }
}
