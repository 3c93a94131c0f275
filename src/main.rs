use anyhow::Result;
use std::env;

use trino_lineage_sync::catalog::CatalogClient;
use trino_lineage_sync::config::{AppConfig, LogConfig};
use trino_lineage_sync::db::{self, PgLineageStore};
use trino_lineage_sync::pipeline::SyncPipeline;
use trino_lineage_sync::trino::TrinoClient;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args(env::args().skip(1).collect());
    let config = AppConfig::from_file(&config_path)?;

    // Keep the guard alive so buffered file output is flushed on exit.
    let _guard = init_logging(&config.logging)?;
    tracing::info!("Loaded configuration from {config_path}");

    let pool = db::create_pool(&config.database_url(), config.database.pool_size as u32)?;
    tracing::info!(
        "Database connection pool created with max_size={}",
        config.database.pool_size
    );

    let source = TrinoClient::new(&config.trino)?;
    let catalog = CatalogClient::new(&config.catalog)?;
    let store = PgLineageStore::new(pool);

    let pipeline = SyncPipeline::new(source, store, catalog, config.batch_size);
    match pipeline.run().await {
        Ok(summary) => {
            tracing::info!(
                "Sync finished: {} of {} source rows in {} batches, {} links, {} queries pushed ({} conflicts, {} failed)",
                summary.records,
                summary.source_rows,
                summary.batches,
                summary.links_written,
                summary.pushed,
                summary.push_conflicts,
                summary.push_failures
            );
            Ok(())
        }
        Err(e) => {
            tracing::error!("Sync run aborted, remaining batches skipped: {e:#}");
            Err(e)
        }
    }
}

fn config_path_from_args(mut args: Vec<String>) -> String {
    if let Some(pos) = args.iter().position(|a| a == "--config" || a == "-c") {
        if pos + 1 < args.len() {
            return args.remove(pos + 1);
        }
    }
    env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string())
}

fn init_logging(config: &LogConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    std::fs::create_dir_all(&config.log_dir)?;
    let file_appender =
        tracing_appender::rolling::daily(&config.log_dir, "trino_lineage_sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();

    Ok(guard)
}
