use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;

use haulage_fleet::MessageChannel;
use haulage_infra::collaborators::{LoggingSender, UnavailableDistance};
use haulage_infra::feed_cursor::{FeedCursorStore, PostgresFeedCursorStore};
use haulage_infra::store::postgres::ensure_schema;
use haulage_infra::{Collaborators, Engine, EngineConfig, EngineHandle, Feeds, InMemoryBackend, Stores};

#[tokio::main]
async fn main() -> Result<()> {
    haulage_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;

    // No distance provider or message transport is bundled: distances stay
    // unknown and messages are logged instead of delivered.
    let collaborators = Collaborators {
        distances: Arc::new(UnavailableDistance),
        email: Arc::new(LoggingSender::new(MessageChannel::Email)),
        push: Arc::new(LoggingSender::new(MessageChannel::Push)),
    };

    let engine = match std::env::var("DATABASE_URL") {
        Ok(url) => start_postgres(&url, &config, collaborators).await?,
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; running against in-memory stores");
            let backend = InMemoryBackend::new();
            Engine::start(&config, backend.stores(), backend.feeds(), collaborators)
        }
    };

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    for (queue, stats) in engine.stop().await {
        tracing::info!(
            queue = %queue,
            dispatched = stats.dispatched,
            succeeded = stats.succeeded,
            failed = stats.failed,
            timed_out = stats.timed_out,
            "queue totals"
        );
    }
    Ok(())
}

async fn start_postgres(
    url: &str,
    config: &EngineConfig,
    collaborators: Collaborators,
) -> Result<EngineHandle> {
    let pool = PgPool::connect(url)
        .await
        .context("failed to connect to Postgres")?;
    ensure_schema(&pool).await.context("failed to prepare schema")?;

    let cursors: Arc<dyn FeedCursorStore> = Arc::new(PostgresFeedCursorStore::new(pool.clone()));
    let feeds = Feeds::postgres(&pool, Some(cursors))
        .await
        .context("failed to open change feeds")?;

    tracing::info!("running against Postgres");
    Ok(Engine::start(config, Stores::postgres(pool), feeds, collaborators))
}
