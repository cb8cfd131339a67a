use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Context;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vitrine_api::{
    app,
    metrics::{MeteredRelay, ReservationMetrics},
    middleware::JwtIdentityResolver,
    state::AppState,
    worker,
};
use vitrine_core::{
    ChangeNotifier, EventRelay, ExpirySweeper, MemoryReservationStore, ReservationManager,
    ReservationStore,
};
use vitrine_store::app_config::{Config, StoreBackend};
use vitrine_store::{EventProducer, PgReservationStore, RedisReservationStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vitrine_api=debug,vitrine_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!("Starting Vitrine API on port {}", config.server.port);

    let store = connect_store(&config).await?;
    let notifier = Arc::new(ChangeNotifier::new(config.reservations.channel_capacity));
    let metrics = Arc::new(ReservationMetrics::new().context("Failed to register metrics")?);

    // Kafka mirrors events to the other instances when enabled
    let producer: Option<Arc<dyn EventRelay>> = if config.kafka.enabled {
        let producer = EventProducer::new(&config.kafka.brokers, &config.kafka.topic)
            .context("Failed to create Kafka producer")?;
        tracing::info!("Relaying reservation events to {}", producer.topic());
        Some(Arc::new(producer))
    } else {
        None
    };

    let manager = Arc::new(
        ReservationManager::new(store, notifier.clone(), config.reservations.policy()?)
            .with_relay(Arc::new(MeteredRelay::new(metrics.clone(), producer))),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = ExpirySweeper::new(manager.clone(), config.reservations.sweep_interval());
    let sweeper_task = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let relay_task = if config.kafka.enabled {
        let consumer = worker::relay_consumer(
            &config.kafka.brokers,
            &config.kafka.group_id,
            &config.kafka.topic,
        )
        .context("Failed to create Kafka consumer")?;
        Some(tokio::spawn(worker::start_relay_worker(
            consumer,
            notifier,
            shutdown_rx.clone(),
        )))
    } else {
        None
    };

    let app_state = AppState {
        manager,
        identity: Arc::new(JwtIdentityResolver::new(&config.auth.jwt_secret)),
        metrics,
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background tasks once the server has drained
    let _ = shutdown_tx.send(true);
    let _ = sweeper_task.await;
    if let Some(relay_task) = relay_task {
        let _ = relay_task.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn ReservationStore>> {
    let store: Arc<dyn ReservationStore> = match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory reservation store; claims are local to this process");
            Arc::new(MemoryReservationStore::new())
        }
        StoreBackend::Redis => Arc::new(
            RedisReservationStore::new(&config.redis.url)
                .await
                .context("Failed to connect to Redis")?,
        ),
        StoreBackend::Postgres => {
            let store = PgReservationStore::connect(&config.database.url)
                .await
                .context("Failed to connect to Postgres")?;
            store.migrate().await.context("Failed to run migrations")?;
            Arc::new(store)
        }
    };
    Ok(store)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received Ctrl+C, shutting down gracefully...");
}
