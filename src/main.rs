use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use paddock::venue::{VenueManager, VenueOptions};
use paddock::wire;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = std::env::var("PADDOCK_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    paddock::observability::init(metrics_port)?;

    let port = std::env::var("PADDOCK_PORT").unwrap_or_else(|_| "5433".into());
    let bind = std::env::var("PADDOCK_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("PADDOCK_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let password = std::env::var("PADDOCK_PASSWORD").unwrap_or_else(|_| "paddock".into());
    let max_connections: usize = env_or("PADDOCK_MAX_CONNECTIONS", 256);
    let options = VenueOptions {
        compact_threshold: env_or("PADDOCK_COMPACT_THRESHOLD", 1000),
        reconcile_interval: Duration::from_secs(env_or("PADDOCK_RECONCILE_INTERVAL_SECS", 300)),
    };
    let utc_offset_minutes: i64 = env_or("PADDOCK_UTC_OFFSET_MINUTES", 0);

    let tls_cert = std::env::var("PADDOCK_TLS_CERT").ok();
    let tls_key = std::env::var("PADDOCK_TLS_KEY").ok();
    let tls_acceptor = paddock::tls::load_tls_acceptor(tls_cert.as_deref(), tls_key.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;

    let venues = Arc::new(VenueManager::new(
        PathBuf::from(&data_dir),
        options,
        utc_offset_minutes,
    ));
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("paddock listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  max_connections: {max_connections}");
    info!(
        "  reconcile every {}s, compact after {} appends",
        options.reconcile_interval.as_secs(),
        options.compact_threshold
    );
    info!("  venue clock: UTC{utc_offset_minutes:+} min");
    info!("  tls: {}", if tls_acceptor.is_some() { "enabled" } else { "disabled" });

    // Stop accepting on SIGTERM/ctrl-c, then drain in-flight connections.
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!("no SIGTERM handler ({e}), waiting for ctrl-c only");
                    ctrl_c.await.ok();
                }
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
                        metrics::counter!(paddock::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(paddock::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(paddock::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let venues = venues.clone();
                let pw = password.clone();
                let tls = tls_acceptor.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, venues, pw, tls).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(paddock::observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
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
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("paddock stopped");
    Ok(())
}
