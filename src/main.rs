use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use bayline::engine::{Engine, EngineConfig};
use bayline::notify::NotifyHub;
use bayline::{reaper, wire};

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = env_parse("BAYLINE_METRICS_PORT");
    bayline::observability::init(metrics_port);

    let port = std::env::var("BAYLINE_PORT").unwrap_or_else(|_| "7611".into());
    let bind = std::env::var("BAYLINE_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("BAYLINE_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let max_connections: usize = env_parse("BAYLINE_MAX_CONNECTIONS").unwrap_or(256);
    let compact_threshold: u64 = env_parse("BAYLINE_COMPACT_THRESHOLD").unwrap_or(1000);

    let mut config = EngineConfig::default();
    if let Some(bays) = env_parse("BAYLINE_BAYS") {
        config.bays = bays;
    }
    if let Some(ttl_secs) = env_parse::<u64>("BAYLINE_HOLD_TTL_SECS") {
        config.hold_ttl_ms = (ttl_secs * 1000) as i64;
    }

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("bayline.wal");

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::open(&wal_path, config.clone(), notify)?);

    tokio::spawn(reaper::run_reaper(engine.clone()));
    tokio::spawn(reaper::run_compactor(engine.clone(), compact_threshold));

    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("bayline listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  bays: {}", config.bays);
    info!("  hold_ttl: {}s", config.hold_ttl_ms / 1000);
    info!("  max_connections: {max_connections}");
    info!("  metrics: {}", metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
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
                        metrics::counter!(bayline::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(bayline::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(bayline::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(bayline::observability::CONNECTIONS_ACTIVE).decrement(1.0);
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

    info!("bayline stopped");
    Ok(())
}
