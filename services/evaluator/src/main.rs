use std::sync::Arc;

use anyhow::{Context, Result};
use replay::{FileStore, StageStore};
use sqlx::PgPool;
use tracing::{info, warn};

use evaluator::config::AppConfig;
use evaluator::connector_http::HttpConnectors;
use evaluator::pipeline::PipelineSettings;
use evaluator::state::AppState;
use evaluator::store_pg::PgStageStore;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AppConfig::from_env()?;

    let store = open_store(&cfg).await?;
    let settings = PipelineSettings::from_config(&cfg);
    let connectors = Arc::new(HttpConnectors::new(cfg.clone()));
    let app_state = Arc::new(AppState::new(store, connectors, settings));

    // RECOVERY: resume runs a previous process left unfinished
    match evaluator::runner::recover_runs(&app_state).await {
        Ok(n) => info!(resumed = n, "recovery: done"),
        Err(e) => warn!(error=%e, "recovery: failed"),
    }

    let app = evaluator::app(app_state);

    let addr = &cfg.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("evaluator listening on http://{addr}");
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

async fn open_store(cfg: &AppConfig) -> Result<Arc<dyn StageStore>> {
    match &cfg.database_url {
        Some(url) => {
            // --- Postgres ---
            let pool = PgPool::connect(url)
                .await
                .context("Failed to connect to Postgres")?;
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            info!("store: postgres");
            Ok(Arc::new(PgStageStore::new(pool)))
        }
        None => {
            let store = FileStore::new(&cfg.state_dir)
                .with_context(|| format!("Failed to open state dir {}", cfg.state_dir.display()))?;
            info!(dir=%cfg.state_dir.display(), "store: files");
            Ok(Arc::new(store))
        }
    }
}
