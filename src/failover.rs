//! Failover controller (C8): wraps one pool's reader loop in perpetual
//! reconnect-with-backoff, clearing pool-scoped state on disconnect and
//! forcing the miner to re-handshake after a successful reconnect.
//!
//! Grounded on `dpmpv2.py::pool_reader_with_reconnect`/`clear_pool_state`
//! and `src/stratum/v1/connection.rs` for the read-loop-over-`BufReader`
//! shape.

use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::pool::{PoolId, PoolLink};
use crate::protocol::{self, MINING_SUBSCRIBE};
use crate::session::emitter::DownstreamWriter;
use crate::session::reader::handle_upstream_message;
use crate::session::Session;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::{Mutex, Notify};

const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(60);

fn backoff_delay(fail_count: u32) -> Duration {
    let shift = fail_count.min(6); // 5 * 2^6 = 320s already clamps past the cap
    let scaled = BACKOFF_BASE.saturating_mul(1 << shift);
    scaled.min(BACKOFF_CAP)
}

/// Send a proxy-originated `mining.subscribe` so a non-handshake pool starts
/// emitting `notify` we can cache. SPEC_FULL.md §4.9: the handshake pool
/// skips this at initial connect (the miner's own subscribe drives it), but
/// always bootstraps on reconnect.
async fn bootstrap(session: &Arc<Mutex<Session>>, link: &PoolLink, pool: PoolId) {
    let mut guard = session.lock().await;
    let sub_id = guard.next_internal_id();
    drop(guard);
    let req = protocol::build_request(sub_id, MINING_SUBSCRIBE, vec![]);
    let _ = link.send(req.to_string()).await;
    log::info!("event=pool_bootstrap pool={}", pool.as_str());
}

/// Drive one pool's connect → bootstrap → read loop forever, reconnecting
/// with exponential backoff on any termination.
pub async fn run(
    session: Arc<Mutex<Session>>,
    config: Arc<AppConfig>,
    link: Arc<PoolLink>,
    pool: PoolId,
    writer: DownstreamWriter,
    metrics: Arc<Metrics>,
    close_miner: Arc<Notify>,
) {
    let mut fail_count: u32 = 0;
    let mut ever_connected = false;

    loop {
        match link.connect().await {
            Ok(mut reader) => {
                {
                    let mut guard = session.lock().await;
                    guard.pool_mut(pool).alive = true;
                }
                metrics.upstream_connections.with_label_values(&[pool.as_str()]).set(1.0);
                fail_count = 0;

                let is_handshake_pool = {
                    let guard = session.lock().await;
                    guard.handshake_pool == pool
                };
                if !is_handshake_pool || ever_connected {
                    bootstrap(&session, &link, pool).await;
                }

                if ever_connected {
                    log::info!("event=failover_forcing_miner_rehandshake pool={}", pool.as_str());
                    close_miner.notify_one();
                }
                ever_connected = true;

                let mut line = String::new();
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) => {
                            log::warn!("event=pool_eof pool={}", pool.as_str());
                            break;
                        }
                        Ok(_) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<Value>(trimmed) {
                                Ok(value) => {
                                    let mut guard = session.lock().await;
                                    handle_upstream_message(&mut guard, &config, &writer, &metrics, pool, value).await;
                                }
                                Err(e) => {
                                    log::warn!("event=pool_decode_error pool={} err={e}", pool.as_str());
                                }
                            }
                        }
                        Err(e) => {
                            log::warn!("event=pool_read_error pool={} err={e}", pool.as_str());
                            break;
                        }
                    }
                }

                link.disconnect().await;
                {
                    let mut guard = session.lock().await;
                    guard.pool_mut(pool).clear_on_disconnect();
                    if guard.raw_subscribe_forwarded_pool == Some(pool) {
                        guard.raw_subscribe_forwarded_pool = None;
                    }
                    if let Some(last) = &guard.last_sent_extranonce {
                        if last.pool == pool {
                            guard.last_sent_extranonce = None;
                        }
                    }
                }
                metrics.upstream_connections.with_label_values(&[pool.as_str()]).set(0.0);
                fail_count += 1;
            }
            Err(e) => {
                log::warn!("event=pool_connect_failed pool={} err={e}", pool.as_str());
                fail_count += 1;
            }
        }

        let delay = backoff_delay(fail_count.saturating_sub(1));
        log::info!("event=failover_reconnect_backoff pool={} delay_s={} fail_count={fail_count}", pool.as_str(), delay.as_secs());
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_sixty() {
        assert_eq!(backoff_delay(0), Duration::from_secs(5));
        assert_eq!(backoff_delay(1), Duration::from_secs(10));
        assert_eq!(backoff_delay(2), Duration::from_secs(20));
        assert_eq!(backoff_delay(3), Duration::from_secs(40));
        assert_eq!(backoff_delay(4), Duration::from_secs(60));
        assert_eq!(backoff_delay(10), Duration::from_secs(60));
    }
}
