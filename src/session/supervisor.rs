//! Session supervisor: wires the four concurrent per-session tasks (two
//! pool readers, the miner-to-pools router, the scheduler loop) and tears
//! the session down when any of them exits.
//!
//! Grounded on `dpmpv2.py::ProxySession.run`/`handle_miner` and
//! `src/stratum/v1/connection.rs` for the split-stream-plus-`BufReader`
//! idiom.

use super::handshake;
use super::router;
use super::{emitter::DownstreamWriter, Session};
use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::failover;
use crate::metrics::Metrics;
use crate::pool::{PoolId, PoolLink, PoolLinks};
use crate::protocol::{MINING_AUTHORIZE, MINING_CONFIGURE, MINING_SUBMIT, MINING_SUBSCRIBE};
use crate::scheduler;
use crate::weight::WeightArbiter;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};

/// Accept-loop entry point: runs one miner connection end to end. Returns
/// once the session is over (miner disconnected, forced re-handshake, or a
/// fatal task error); the caller just needs to drop the handle.
pub async fn run_session(socket: TcpStream, config: Arc<AppConfig>, metrics: Arc<Metrics>) {
    if let Err(e) = socket.set_nodelay(true) {
        log::warn!("event=miner_set_nodelay_failed err={e}");
    }
    let peer = socket.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
    log::info!("event=miner_connected peer={peer}");
    metrics.downstream_connections.inc();

    let (miner_read, miner_write) = socket.into_split();
    let writer: DownstreamWriter = Arc::new(Mutex::new(miner_write));

    let handshake_pool = handshake::elect_handshake_pool(config.scheduler.pool_a_weight, config.scheduler.pool_b_weight);
    let session = Arc::new(Mutex::new(Session::new(handshake_pool)));

    let pool_a = Arc::new(PoolLink::new(PoolId::A, config.pool_a.host.clone(), config.pool_a.port));
    let pool_b = Arc::new(PoolLink::new(PoolId::B, config.pool_b.host.clone(), config.pool_b.port));
    let pools = Arc::new(PoolLinks { a: pool_a.clone(), b: pool_b.clone() });

    let close_miner = Arc::new(Notify::new());
    let arbiter = WeightArbiter::new(
        config.control_plane_dir.clone(),
        config.scheduler.pool_a_weight,
        config.scheduler.pool_b_weight,
    );

    let mut tasks = tokio::task::JoinSet::new();

    if config.scheduler.pool_a_weight > 0 {
        tasks.spawn(failover::run(
            session.clone(), config.clone(), pool_a.clone(), PoolId::A, writer.clone(), metrics.clone(), close_miner.clone(),
        ));
    }
    if config.scheduler.pool_b_weight > 0 {
        tasks.spawn(failover::run(
            session.clone(), config.clone(), pool_b.clone(), PoolId::B, writer.clone(), metrics.clone(), close_miner.clone(),
        ));
    }
    tasks.spawn(scheduler::run(
        session.clone(), config.clone(), pools.clone(), writer.clone(), metrics.clone(), arbiter,
    ));

    let router_task = run_miner_router(miner_read, session.clone(), config.clone(), pools.clone(), writer.clone(), metrics.clone());

    tokio::select! {
        _ = router_task => {
            log::info!("event=miner_disconnected peer={peer}");
        }
        _ = close_miner.notified() => {
            log::info!("event=miner_forced_close peer={peer} reason=pool_reconnected");
        }
        _ = tasks.join_next() => {
            log::warn!("event=session_task_exited_unexpectedly peer={peer}");
        }
    }

    tasks.shutdown().await;
    {
        let mut w = writer.lock().await;
        let _ = w.shutdown().await;
    }
    metrics.downstream_connections.dec();
}

async fn run_miner_router(
    miner_read: tokio::net::tcp::OwnedReadHalf,
    session: Arc<Mutex<Session>>,
    config: Arc<AppConfig>,
    pools: Arc<PoolLinks>,
    writer: DownstreamWriter,
    metrics: Arc<Metrics>,
) {
    let mut reader = BufReader::new(miner_read);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                metrics.messages_rx_total.with_label_values(&["downstream"]).inc();
                match serde_json::from_str::<Value>(trimmed) {
                    Ok(value) => {
                        dispatch_miner_message(&session, &config, &pools, &writer, &metrics, value).await;
                    }
                    Err(e) => {
                        log::warn!("event=miner_decode_error err={e}");
                    }
                }
            }
            Err(e) => {
                log::warn!("event=miner_read_error err={e}");
                break;
            }
        }
    }
}

async fn dispatch_miner_message(
    session: &Arc<Mutex<Session>>,
    config: &Arc<AppConfig>,
    pools: &Arc<PoolLinks>,
    writer: &DownstreamWriter,
    metrics: &Arc<Metrics>,
    raw: Value,
) {
    let Some(obj) = raw.as_object() else { return };
    let Some(method) = obj.get("method").and_then(Value::as_str) else {
        log::debug!("event=miner_message_unclassified");
        return;
    };
    let id = obj.get("id").cloned().unwrap_or(Value::Null);
    let params: Vec<Value> = obj.get("params").and_then(Value::as_array).cloned().unwrap_or_default();

    match method {
        MINING_CONFIGURE => {
            let mut guard = session.lock().await;
            handshake::handle_configure(&mut guard, config, pools, id, params).await;
        }
        MINING_SUBSCRIBE => {
            let mut guard = session.lock().await;
            handshake::handle_subscribe(&mut guard, pools, id, params).await;
        }
        MINING_AUTHORIZE => {
            let mut guard = session.lock().await;
            handshake::handle_authorize(&mut guard, config, pools, id, params).await;
        }
        MINING_SUBMIT => {
            metrics.shares_submitted_total.inc();
            let mut guard = session.lock().await;
            match router::handle_submit(&mut guard, config, pools, id.clone(), params).await {
                Ok(()) => {}
                Err(err) => {
                    if let ProxyError::ProtocolPolicy { .. } = &err {
                        let response = err.to_downstream_response(id);
                        let _ = crate::session::emitter::write_line(writer, &response).await;
                    } else {
                        log::warn!("event=submit_forward_failed err={err}");
                    }
                }
            }
        }
        other => {
            log::debug!("event=miner_method_unhandled method={other}");
        }
    }
}
