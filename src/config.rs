use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    pub trino: TrinoConfig,
    pub database: DatabaseConfig,
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TrinoConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_trino_scheme")]
    pub scheme: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    /// Database service name registered in the catalog; first FQN segment.
    pub target_db_service: String,
    /// Database used to qualify `schema.table` names from parsed SQL.
    pub target_db: String,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Skip TLS certificate verification when talking to the catalog.
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_size() -> usize {
    16
}

fn default_batch_size() -> u64 {
    1000
}

fn default_trino_scheme() -> String {
    "http".to_string()
}

fn default_max_in_flight() -> usize {
    20
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: AppConfig =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    pub fn database_url(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={}",
            self.database.host,
            self.database.port,
            self.database.dbname,
            self.database.user,
            self.database.password
        )
    }
}

impl TrinoConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
            [trino]
            host = "trino.internal"
            port = 8080
            user = "etl"

            [database]
            host = "pg.internal"
            port = 5432
            dbname = "metadata"
            user = "omd"
            password = "secret"

            [catalog]
            base_url = "https://omd.internal"
            email = "bot@example.com"
            password = "hunter2"
            target_db_service = "trino_prod"
            target_db = "hive"
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.trino.base_url(), "http://trino.internal:8080");
        assert_eq!(config.catalog.max_in_flight, 20);
        assert!(!config.catalog.danger_accept_invalid_certs);
        assert_eq!(config.logging.log_level, "info");
        assert_eq!(
            config.database_url(),
            "host=pg.internal port=5432 dbname=metadata user=omd password=secret"
        );
    }

    #[test]
    fn test_overrides() {
        let toml_str = r#"
            batch_size = 250

            [trino]
            host = "localhost"
            port = 443
            user = "etl"
            scheme = "https"

            [database]
            host = "localhost"
            port = 5432
            dbname = "md"
            user = "u"
            password = "p"

            [catalog]
            base_url = "https://omd"
            email = "e@x"
            password = "p"
            target_db_service = "svc"
            target_db = "db"
            max_in_flight = 4
            danger_accept_invalid_certs = true

            [logging]
            log_level = "debug"
        "#;

        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.batch_size, 250);
        assert_eq!(config.trino.base_url(), "https://localhost:443");
        assert_eq!(config.catalog.max_in_flight, 4);
        assert!(config.catalog.danger_accept_invalid_certs);
        assert_eq!(config.logging.log_level, "debug");
    }
}
