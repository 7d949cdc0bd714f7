use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use feature_gate_metering::{
    AccessControlEngine, BroadcastPublisher, DomainEvent, EventPublisher, MeteringConfig,
    MeteringStore, PeriodRolloverJob, PlanCatalog, ReservationRegistry, SqliteStore,
    StaticPlanCatalog, TokenMeteringEngine,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = MeteringConfig::from_env()?;
    init_tracing(&config.log_level)?;

    info!(
        data_dir = %config.data_dir.display(),
        plan_catalog = %config.plan_catalog_path.display(),
        reservation_ttl_secs = config.reservation_ttl_secs,
        rollover_interval_secs = config.rollover_interval_secs,
        "starting feature-gate metering service"
    );

    let store: Arc<dyn MeteringStore> = Arc::new(SqliteStore::new(config.data_dir.clone())?);
    let catalog: Arc<dyn PlanCatalog> = Arc::new(
        StaticPlanCatalog::from_file(&config.plan_catalog_path).with_context(|| {
            format!(
                "failed to load plan catalog from {}",
                config.plan_catalog_path.display()
            )
        })?,
    );

    let bus = Arc::new(BroadcastPublisher::new(config.event_channel_capacity));
    let events = bus.subscribe();
    let publisher: Arc<dyn EventPublisher> = bus;

    let reservations =
        ReservationRegistry::new(config.reservation_ttl(), config.reservation_sweep_interval());
    let access = AccessControlEngine::new(
        Arc::clone(&store),
        Arc::clone(&catalog),
        reservations.clone(),
        publisher,
        &config,
    );
    let tokens = TokenMeteringEngine::new(Arc::clone(&store), Arc::clone(&catalog));
    let rollover = PeriodRolloverJob::new(Arc::clone(&store), tokens.clone());

    let tasks: Vec<JoinHandle<()>> = vec![
        access.reservations().start_sweeper(),
        rollover.start(config.rollover_interval()),
        spawn_event_log(events),
    ];

    info!(tasks = tasks.len(), "metering engines ready");

    shutdown_signal().await;

    info!(
        pending_reservations = reservations.len(),
        "feature-gate metering service shutting down"
    );
    for task in tasks {
        task.abort();
    }
    Ok(())
}

fn init_tracing(default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))?;
    Ok(())
}

/// Writes every domain event to the log until the bus closes.
fn spawn_event_log(mut events: broadcast::Receiver<DomainEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(payload) => info!(
                        topic = event.topic(),
                        customer_id = %event.customer_id(),
                        payload = %payload,
                        "domain event"
                    ),
                    Err(err) => warn!(topic = event.topic(), error = %err, "unserializable event"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log lagging behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
