//! Pool reader (C3): classifies and acts on one inbound upstream message.
//!
//! Grounded on `dpmpv2.py`'s per-message dispatch and
//! `src/stratum/v1/connection.rs::StratumConnection::read_message` for the
//! read-classify-act loop shape.

use super::emitter::{self, DownstreamWriter};
use super::router::credit_accepted_share;
use super::{msg_id_key, Session};
use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::pool::PoolId;
use crate::protocol::{self, inject_null_error, Classified, MINING_NOTIFY, MINING_SET_DIFFICULTY};
use serde_json::Value;
use std::sync::Arc;

/// Act on one classified message received from `pool`. Notifications and
/// `set_difficulty` are cached only (the scheduler owns forwarding);
/// responses are dispatched per SPEC_FULL.md §4.3. C3 never originates
/// upstream writes, so this takes no pool-link handle.
pub async fn handle_upstream_message(
    session: &mut Session,
    config: &AppConfig,
    writer: &DownstreamWriter,
    metrics: &Arc<Metrics>,
    pool: PoolId,
    raw: Value,
) {
    metrics.messages_rx_total.with_label_values(&["upstream"]).inc();
    match protocol::classify(&raw) {
        Some(Classified::Notification { method, params }) if method == MINING_SET_DIFFICULTY => {
            if let Some(d) = params.first().and_then(Value::as_f64) {
                session.pool_mut(pool).latest_diff = Some(d);
            }
        }
        Some(Classified::Notification { method, params }) if method == MINING_NOTIFY => {
            let jobid = protocol::jobid_from_notify_params(&params);
            let state = session.pool_mut(pool);
            state.latest_notify_raw = Some(raw);
            state.latest_jobid = jobid;
            state.notify_seq += 1;
            state.last_notify_instant = Some(std::time::Instant::now());
        }
        Some(Classified::Notification { method, .. }) => {
            if pool == session.handshake_pool {
                let sent = emitter::write_line(writer, &raw).await.is_ok();
                if sent {
                    metrics.messages_tx_total.with_label_values(&["downstream"]).inc();
                }
            } else {
                log::debug!("event=upstream_notification_dropped pool={} method={method}", pool.as_str());
            }
        }
        Some(Classified::Response { id, raw }) => {
            handle_response(session, config, writer, metrics, pool, id, raw).await;
        }
        None => {
            log::debug!("event=upstream_message_unclassified pool={}", pool.as_str());
        }
    }
}

async fn handle_response(
    session: &mut Session,
    config: &AppConfig,
    writer: &DownstreamWriter,
    metrics: &Arc<Metrics>,
    pool: PoolId,
    id: Value,
    raw: Value,
) {
    let key = (pool, msg_id_key(&id));
    if session.seen_upstream_ids.contains(&key) {
        log::debug!("event=upstream_response_duplicate pool={} id={id}", pool.as_str());
        return;
    }
    session.seen_upstream_ids.insert(key);

    let id_num = id.as_u64();
    if let Some(n) = id_num {
        if session.internal_ids.contains(&n) {
            apply_extranonce_from_result(session, pool, &raw);
            return;
        }
    }

    if session.subscribe_id.as_ref() == Some(&id) && pool == session.handshake_pool {
        apply_extranonce_from_result(session, pool, &raw);
        if session.raw_subscribe_forwarded_pool.is_none() {
            let outbound = inject_null_error(&raw);
            let _ = emitter::write_line(writer, &outbound).await;
            session.raw_subscribe_forwarded_pool = Some(pool);
        }
        return;
    }

    if session.authorize_id.as_ref() == Some(&id) && pool == session.handshake_pool {
        let outbound = inject_null_error(&raw);
        let _ = emitter::write_line(writer, &outbound).await;
        let positive = raw.get("result").and_then(Value::as_bool).unwrap_or(false);
        if positive {
            session.pool_mut(pool).alive = true;
            if session.active_pool == pool {
                emitter::resend_clean(session, config, writer, pool).await;
                if let Some(jobid) = session.pool(pool).latest_jobid.clone() {
                    session.job_owner.insert((pool, jobid.clone()), pool);
                    session.last_forwarded_pool = Some(pool);
                    session.last_forwarded_jobid = Some(jobid);
                    session.pool_mut(pool).last_sent_seq = session.pool(pool).notify_seq;
                    metrics.jobs_forwarded_total.with_label_values(&[pool.as_str()]).inc();
                }
            } else {
                log::debug!("event=handshake_initial_push_skipped pool={} reason=scheduler_already_switched", pool.as_str());
            }
        } else {
            log::warn!("event=handshake_authorize_rejected pool={}", pool.as_str());
        }
        return;
    }

    let mid = msg_id_key(&id);
    if let Some(owner_pool) = session.submit_owner.remove(&mid) {
        if owner_pool != pool {
            return;
        }
        let diff = session.submit_diff.remove(&mid).unwrap_or(0.0);
        let accepted = raw.get("result").and_then(Value::as_bool).unwrap_or(false);
        if accepted {
            metrics.shares_accepted_total.with_label_values(&[pool.as_str()]).inc();
            metrics.accepted_difficulty_sum.with_label_values(&[pool.as_str()]).inc_by(diff);
            credit_accepted_share(session, pool, diff);
        } else {
            metrics.shares_rejected_total.with_label_values(&[pool.as_str()]).inc();
        }
        let outbound = inject_null_error(&raw);
        let _ = emitter::write_line(writer, &outbound).await;
        metrics.messages_tx_total.with_label_values(&["downstream"]).inc();
        return;
    }

    log::debug!("event=upstream_response_dropped pool={} id={id} reason=not_handshake_pool_or_unowned", pool.as_str());
}

fn apply_extranonce_from_result(session: &mut Session, pool: PoolId, raw: &Value) {
    let Some(result) = raw.get("result").and_then(Value::as_array) else {
        return;
    };
    if result.len() < 2 {
        return;
    }
    let en1 = result[result.len() - 2].as_str().map(str::to_string);
    let en2size = result[result.len() - 1].as_u64().map(|v| v as usize);
    if let (Some(en1), Some(en2size)) = (en1, en2size) {
        let state = session.pool_mut(pool);
        state.extranonce1 = Some(en1);
        state.extranonce2_size = Some(en2size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_extranonce_reads_last_two_result_elements() {
        let mut session = Session::new(PoolId::A);
        let raw = json!({"id": 1, "result": [["mining.notify"], "abcd", 4]});
        apply_extranonce_from_result(&mut session, PoolId::A, &raw);
        assert_eq!(session.pool(PoolId::A).extranonce1.as_deref(), Some("abcd"));
        assert_eq!(session.pool(PoolId::A).extranonce2_size, Some(4));
    }

    #[test]
    fn apply_extranonce_ignores_short_result() {
        let mut session = Session::new(PoolId::A);
        let raw = json!({"id": 1, "result": ["onlyone"]});
        apply_extranonce_from_result(&mut session, PoolId::A, &raw);
        assert!(session.pool(PoolId::A).extranonce1.is_none());
    }
}
