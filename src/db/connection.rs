use anyhow::{Context, Result};
use postgres_native_tls::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use tokio_postgres::{Client, NoTls};
use tracing::error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    #[serde(skip)]
    pub password: String,
    pub ssl_mode: SslMode,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Disable,
    Require,
}

impl ConnectionConfig {
    fn conn_string(&self) -> String {
        let mut s = format!(
            "host={} port={} dbname={} user={}",
            self.host, self.port, self.database, self.user
        );
        if !self.password.is_empty() {
            s.push_str(&format!(" password={}", self.password));
        }
        if self.ssl_mode == SslMode::Require {
            s.push_str(" sslmode=require");
        }
        s
    }
}

/// Open a client and drive its connection on a background task.
pub async fn connect(config: &ConnectionConfig) -> Result<Client> {
    let conn_string = config.conn_string();
    let client = match config.ssl_mode {
        SslMode::Disable => {
            let (client, connection) = tokio_postgres::connect(&conn_string, NoTls)
                .await
                .with_context(|| format!("failed to connect to {}:{}", config.host, config.port))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("postgres connection error: {}", e);
                }
            });
            client
        }
        SslMode::Require => {
            let tls = native_tls::TlsConnector::builder()
                .build()
                .context("failed to build TLS connector")?;
            let (client, connection) =
                tokio_postgres::connect(&conn_string, MakeTlsConnector::new(tls))
                    .await
                    .with_context(|| format!("failed to connect to {}:{}", config.host, config.port))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("postgres connection error: {}", e);
                }
            });
            client
        }
    };
    Ok(client)
}
