use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use kairos::calendar::NullCalendarSync;
use kairos::clock::SystemClock;
use kairos::engine::{Engine, EngineConfig, WorkingHours};
use kairos::notify::NotifyHub;
use kairos::{compactor, wire};

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let metrics_port: Option<u16> = env_parse("KAIROS_METRICS_PORT");
    kairos::observability::init(metrics_port);

    let port = std::env::var("KAIROS_PORT").unwrap_or_else(|_| "7470".into());
    let bind = std::env::var("KAIROS_BIND").unwrap_or_else(|_| "0.0.0.0".into());
    let data_dir = std::env::var("KAIROS_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let token = std::env::var("KAIROS_TOKEN").unwrap_or_else(|_| "kairos".into());
    let max_connections: usize = env_parse("KAIROS_MAX_CONNECTIONS").unwrap_or(256);
    let compact_threshold: u64 = env_parse("KAIROS_COMPACT_THRESHOLD").unwrap_or(1000);

    let default_tz = match std::env::var("KAIROS_TZ") {
        Ok(name) => kairos::clock::resolve_zone(&name)
            .ok_or_else(|| format!("unknown KAIROS_TZ: {name}"))?,
        Err(_) => chrono_tz::UTC,
    };
    let grace_hours: i64 = env_parse("KAIROS_GRACE_HOURS").unwrap_or(24);
    let work_start: u32 = env_parse("KAIROS_WORK_START").unwrap_or(9);
    let work_end: u32 = env_parse("KAIROS_WORK_END").unwrap_or(17);
    let lookahead_days: u32 = env_parse::<u32>("KAIROS_LOOKAHEAD_DAYS")
        .unwrap_or(7)
        .min(kairos::limits::MAX_LOOKAHEAD_DAYS);
    let min_lead_minutes: i64 = env_parse("KAIROS_MIN_LEAD_MINUTES").unwrap_or(0);
    if work_start >= work_end || work_end > 24 {
        return Err(format!("invalid working hours: {work_start}..{work_end}").into());
    }

    let config = EngineConfig {
        working_hours: WorkingHours { start_hour: work_start, end_hour: work_end },
        lookahead_days,
        grace_window_ms: grace_hours * 3_600_000,
        min_lead_ms: min_lead_minutes * 60_000,
        default_tz,
    };

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("kairos.wal");

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(
        wal_path,
        notify,
        Arc::new(SystemClock),
        Arc::new(NullCalendarSync),
        config,
    )?);
    tokio::spawn(compactor::run_compactor(engine.clone(), compact_threshold));

    let semaphore = Arc::new(Semaphore::new(max_connections));
    let token: Arc<str> = token.into();

    let addr = format!("{bind}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    info!("kairos listening on {addr}");
    info!("  data_dir: {data_dir}");
    info!("  default_tz: {default_tz}");
    info!("  working_hours: {work_start}..{work_end}, lookahead {lookahead_days}d, grace {grace_hours}h");
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
                        metrics::counter!(kairos::observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                        drop(socket);
                        continue;
                    }
                };

                info!("connection from {peer}");
                metrics::counter!(kairos::observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(kairos::observability::CONNECTIONS_ACTIVE).increment(1.0);
                let eng = engine.clone();
                let tok = token.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, eng, tok).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(kairos::observability::CONNECTIONS_ACTIVE).decrement(1.0);
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

    info!("kairos stopped");
    Ok(())
}
