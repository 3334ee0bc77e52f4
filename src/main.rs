use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use tutorbook::chat::{ChatHub, HistoryReader, HistoryStore, RingHistory};
use tutorbook::config::Config;
use tutorbook::engine::Engine;
use tutorbook::store::WalStore;
use tutorbook::timerange::SystemClock;
use tutorbook::wire::{self, Services};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    tutorbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let store = Arc::new(WalStore::open(&config.wal_path())?);
    tokio::spawn(tutorbook::compactor::run_compactor(
        store.clone(),
        config.compact_threshold,
    ));

    let history = history_backend(&config).await?;
    let services = Services {
        engine: Arc::new(Engine::new(
            store,
            Arc::new(SystemClock),
            config.link_base_url.clone(),
        )),
        chat: Arc::new(ChatHub::new(history.clone())),
        history: HistoryReader::new(history),
    };

    let max_connections = config.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = config.addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("tutorbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  max_connections: {max_connections}");
    info!("  link_base_url: {}", config.link_base_url);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        tracing::warn!("connection limit reached, rejecting {peer}");
                        metrics::counter!(tutorbook::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(tutorbook::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(tutorbook::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let services = services.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, services).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(tutorbook::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(std::time::Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
        }
    }

    info!("tutorbook stopped");
    Ok(())
}

fn ring_history(config: &Config) -> RingHistory {
    RingHistory::with_limits(
        config.history_capacity,
        config.history_max_rooms,
        std::time::Duration::from_secs(tutorbook::limits::HISTORY_IDLE_SECS),
    )
}

#[cfg(feature = "redis-history")]
async fn history_backend(
    config: &Config,
) -> Result<Arc<dyn HistoryStore>, Box<dyn std::error::Error>> {
    if let Some(url) = &config.redis_url {
        let redis =
            tutorbook::chat::redis::RedisHistory::connect(url, config.history_capacity).await?;
        info!("  chat history: redis");
        return Ok(Arc::new(redis));
    }
    Ok(Arc::new(ring_history(config)))
}

#[cfg(not(feature = "redis-history"))]
async fn history_backend(
    config: &Config,
) -> Result<Arc<dyn HistoryStore>, Box<dyn std::error::Error>> {
    if config.redis_url.is_some() {
        tracing::warn!("TUTORBOOK_REDIS_URL set but built without redis-history; using in-memory history");
    }
    Ok(Arc::new(ring_history(config)))
}
