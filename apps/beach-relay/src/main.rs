use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use beach_relay::{
    admission::{AdmissionPolicy, AlwaysAdmit, RoomAdmission},
    config::{Cli, ServerConfig},
    hub::Hub,
    rooms::{MemoryRoomStore, RedisRoomStore, RoomGate, RoomRepository, RoomStore},
    server::{self, AppState},
    telemetry::Telemetry,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info};

const STORE_PING_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(Cli::parse())?;

    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        require_rooms = config.require_rooms,
        room_ttl_secs = config.room_ttl.as_secs(),
        "starting beach-relay"
    );

    if let Err(err) = run(config, telemetry.metrics_handle()).await {
        error!(error = %err, "beach-relay exited with error");
        return Err(err);
    }
    Ok(())
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let rooms = connect_rooms(&config).await?;
    let admission: Arc<dyn AdmissionPolicy> = if config.require_rooms {
        Arc::new(RoomAdmission::new(rooms.clone()))
    } else {
        Arc::new(AlwaysAdmit)
    };

    let (hub, hub_task) = Hub::spawn(admission);
    let app = server::router(Arc::new(AppState {
        hub,
        rooms,
        room_ttl: config.room_ttl,
        connection: config.connection.clone(),
        metrics: Some(metrics),
    }));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("beach-relay listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Give in-flight close frames a moment before the hub goes away.
    tokio::time::sleep(config.shutdown_grace).await;
    hub_task.abort();
    info!("beach-relay stopped");
    Ok(())
}

/// A configured redis must answer a ping before we accept traffic.
async fn connect_rooms(config: &ServerConfig) -> Result<Arc<dyn RoomRepository>> {
    match &config.redis_url {
        Some(url) => {
            let store = RedisRoomStore::connect(url)
                .await
                .context("failed to connect to redis")?;
            match tokio::time::timeout(STORE_PING_TIMEOUT, store.ping()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => bail!("redis ping failed: {err}"),
                Err(_) => bail!("redis ping timed out after {:?}", STORE_PING_TIMEOUT),
            }
            info!("room store: redis");
            Ok(Arc::new(RoomGate::new(store, config.room_ttl)))
        }
        None => Ok(Arc::new(RoomGate::new(MemoryRoomStore::new(), config.room_ttl))),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
