//! innominatus orchestration engine: boots the persistence gateway, loads
//! the provider registry, and runs the reconciliation loop until a
//! shutdown signal arrives.

use std::sync::Arc;

use innominatus_common::init_tracing;
use innominatus_db::pool::{create_pool, DatabaseConfig};
use innominatus_db::repo::PgGateway;
use innominatus_orchestrator::executor::builtin::{DelayHandler, NoopHandler};
use innominatus_orchestrator::{
    Engine, EngineConfig, EventBroadcaster, GraphManager, HandlerRegistry, ManifestSource,
    ProviderRegistry, WorkflowExecutor,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("starting innominatus orchestration engine");

    let config = EngineConfig::load()?;

    let db_config = DatabaseConfig {
        url: config.database_url.clone(),
        ..DatabaseConfig::default()
    };
    let pool = create_pool(&db_config).await?;
    let gateway: Arc<dyn innominatus_db::repo::PersistenceGateway> =
        Arc::new(PgGateway::new(pool));

    let sources: Vec<ManifestSource> = config
        .provider_sources
        .iter()
        .map(ManifestSource::directory)
        .collect();
    let registry = Arc::new(ProviderRegistry::load(&sources).await?);
    tracing::info!(
        providers = sources.len(),
        "provider registry loaded"
    );

    let broadcaster = Arc::new(EventBroadcaster::new(innominatus_orchestrator::events::DEFAULT_BUFFER));
    let graph = Arc::new(GraphManager::new(Arc::clone(&gateway), Arc::clone(&broadcaster)));

    let mut handlers = HandlerRegistry::new(config.default_step_timeout());
    handlers.register(Arc::new(NoopHandler));
    handlers.register(Arc::new(DelayHandler));
    let handlers = Arc::new(handlers);

    let executor = Arc::new(WorkflowExecutor::new(
        Arc::clone(&gateway),
        handlers,
        config.step_parallel_fanout,
        config.default_step_timeout(),
    ));

    let engine = Engine::new(gateway, registry, graph, executor, config);

    let cancellation = CancellationToken::new();
    let liveness_cancellation = cancellation.clone();
    let liveness_task = tokio::spawn(async move {
        broadcaster.run_liveness(liveness_cancellation).await;
    });

    let shutdown_cancellation = cancellation.clone();
    tokio::spawn(async move {
        innominatus_common::shutdown::listen().await;
        tracing::info!("shutdown signal received, draining reconciler");
        shutdown_cancellation.cancel();
    });

    engine.run(cancellation).await;
    liveness_task.await.ok();

    tracing::info!("engine stopped");
    Ok(())
}
