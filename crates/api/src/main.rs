use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use snipstash_api::app::{AppState, build_app};
use snipstash_auth::{Argon2Hasher, AuthService, PasetoMaker, PrincipalStore, SessionStore};
use snipstash_infra::jobs::{
    Broker, InMemoryBroker, ProcessorConfig, TaskDistributor, TaskProcessor,
    register_send_verify_email,
};
use snipstash_infra::{AppConfig, InMemoryStore, PostgresStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    snipstash_observability::init(config.log_format);
    info!(config = ?config, "starting snipstash-api");

    let (principals, sessions) = build_storage(&config).await?;
    let broker = build_broker(&config).await?;

    let mut processor = TaskProcessor::new(broker.clone());
    register_send_verify_email(&mut processor, principals.clone(), config.store_timeout);
    let workers = processor.spawn(
        ProcessorConfig::default()
            .with_name("snipstash-worker")
            .with_concurrency(config.worker_concurrency),
    );

    let distributor = TaskDistributor::new(broker, config.enqueue_timeout);
    let maker = PasetoMaker::new(&config.token_symmetric_key).context("invalid token key")?;
    let hasher = Argon2Hasher::new(
        config.argon2_memory_kib,
        config.argon2_iterations,
        config.argon2_parallelism,
    )
    .context("invalid argon2 parameters")?;

    let auth = AuthService::new(
        config.auth_config()?,
        Arc::new(maker),
        Arc::new(hasher),
        principals,
        sessions,
    )
    .with_notifier(Arc::new(distributor));

    let app = build_app(AppState::new(auth));

    let listener = tokio::net::TcpListener::bind(&config.http_server_address)
        .await
        .with_context(|| format!("failed to bind {}", config.http_server_address))?;

    info!(address = %listener.local_addr()?, "listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("draining workers");
    workers.shutdown().await;
    Ok(())
}

async fn build_storage(
    config: &AppConfig,
) -> anyhow::Result<(Arc<dyn PrincipalStore>, Arc<dyn SessionStore>)> {
    match &config.database_url {
        Some(url) => {
            let store = Arc::new(
                PostgresStore::connect(url)
                    .await
                    .context("failed to connect to postgres")?,
            );
            store.ensure_schema().await.context("failed to prepare schema")?;
            info!("using postgres storage");
            let principals: Arc<dyn PrincipalStore> = store.clone();
            let sessions: Arc<dyn SessionStore> = store;
            Ok((principals, sessions))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory storage");
            let store = InMemoryStore::arc();
            let principals: Arc<dyn PrincipalStore> = store.clone();
            let sessions: Arc<dyn SessionStore> = store;
            Ok((principals, sessions))
        }
    }
}

#[cfg(feature = "redis")]
async fn build_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    if let Some(url) = &config.redis_url {
        let broker = snipstash_infra::jobs::RedisBroker::connect(url)
            .await
            .context("failed to connect to redis")?;
        info!("using redis job broker");
        let broker: Arc<dyn Broker> = Arc::new(broker);
        return Ok(broker);
    }
    warn!("REDIS_URL not set; using in-memory job broker");
    let broker: Arc<dyn Broker> = InMemoryBroker::arc();
    Ok(broker)
}

#[cfg(not(feature = "redis"))]
async fn build_broker(config: &AppConfig) -> anyhow::Result<Arc<dyn Broker>> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but the redis feature is disabled; using in-memory job broker");
    }
    let broker: Arc<dyn Broker> = InMemoryBroker::arc();
    Ok(broker)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
