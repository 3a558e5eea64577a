//! Process entry point: loads configuration, starts the metrics server and
//! optional hashrate oracle, and accepts miner connections until shutdown.

use dualstratum::config;
use dualstratum::logging;
use dualstratum::metrics::{self, Metrics};
use dualstratum::oracle;
use dualstratum::session::supervisor;
use dualstratum::weight;
use std::env;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = env::args().nth(1).unwrap_or_else(|| "config.json".to_string());
    let config = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config {config_path}: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.logging);
    let config = Arc::new(config);

    weight::reset_oracle_mode_on_startup(&config.control_plane_dir);

    let metrics = match Metrics::new() {
        Ok(m) => Arc::new(m),
        Err(e) => {
            log::error!("event=metrics_registry_init_failed err={e}");
            return ExitCode::FAILURE;
        }
    };

    if config.metrics_enabled {
        let metrics_addr: SocketAddr = match format!("{}:{}", config.metrics_host, config.metrics_port).parse() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("event=metrics_addr_invalid err={e}");
                return run_without_metrics(config, metrics).await;
            }
        };
        tokio::spawn(metrics::serve(metrics.clone(), metrics_addr));
    }

    if config.scheduler.auto_balance {
        tokio::spawn(oracle::run(config.clone(), metrics.clone()));
    }

    run_listener(config, metrics).await
}

async fn run_without_metrics(config: Arc<config::AppConfig>, metrics: Arc<Metrics>) -> ExitCode {
    if config.scheduler.auto_balance {
        tokio::spawn(oracle::run(config.clone(), metrics.clone()));
    }
    run_listener(config, metrics).await
}

async fn run_listener(config: Arc<config::AppConfig>, metrics: Arc<Metrics>) -> ExitCode {
    let listen_addr = format!("{}:{}", config.listen_host, config.listen_port);
    let listener = match TcpListener::bind(&listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            log::error!("event=listener_bind_failed addr={listen_addr} err={e}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("event=listener_started addr={listen_addr}");

    let mut sessions = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, _addr)) => {
                        let config = config.clone();
                        let metrics = metrics.clone();
                        sessions.spawn(async move {
                            supervisor::run_session(socket, config, metrics).await;
                        });
                    }
                    Err(e) => log::warn!("event=listener_accept_error err={e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("event=shutdown_signal_received");
                break;
            }
        }
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), sessions.shutdown()).await;

    log::info!("event=shutdown_complete");
    ExitCode::SUCCESS
}
