//! Downstream setup emitter (C5): ordered, idempotent `set_extranonce` →
//! `set_difficulty` → `mining.notify` pushes to the miner.
//!
//! Grounded on `dpmpv2.py::maybe_send_downstream_extranonce`/
//! `maybe_send_downstream_diff`/`resend_active_notify_clean`, wired through a
//! single writer lock the way `src/stratum/v1/connection.rs` serializes
//! writes on one `OwnedWriteHalf`.

use super::{LastSentExtranonce, Session};
use crate::config::AppConfig;
use crate::pool::PoolId;
use crate::protocol::{self, force_clean_notify, sanitize_notification, MINING_NOTIFY, MINING_SET_DIFFICULTY, MINING_SET_EXTRANONCE};
use serde_json::json;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Serializes all writes to the miner so a switch's extranonce/difficulty/
/// notify sequence is atomic with respect to any other emitter.
pub type DownstreamWriter = Arc<Mutex<OwnedWriteHalf>>;

pub(crate) async fn write_line(writer: &DownstreamWriter, msg: &serde_json::Value) -> std::io::Result<()> {
    let mut w = writer.lock().await;
    let sanitized = sanitize_notification(msg);
    let line = format!("{sanitized}\n");
    w.write_all(line.as_bytes()).await?;
    w.flush().await
}

fn clamp_difficulty(raw: f64, min_diff: f64, max_diff: f64) -> u64 {
    let clamped = raw.clamp(min_diff, max_diff);
    clamped.ceil().max(1.0) as u64
}

fn min_max_for(config: &AppConfig, pool: PoolId) -> (f64, f64) {
    match pool {
        PoolId::A => (config.pool_a.min_diff, config.pool_a.max_diff),
        PoolId::B => (config.pool_b.min_diff, config.pool_b.max_diff),
    }
}

fn weight_for(config: &AppConfig, pool: PoolId) -> u32 {
    match pool {
        PoolId::A => config.scheduler.pool_a_weight,
        PoolId::B => config.scheduler.pool_b_weight,
    }
}

/// Push `set_extranonce` for pool `P`, honoring all three suppression
/// guards of SPEC_FULL.md §4.5 (mandatory: unsupported miners disconnect on
/// spurious `set_extranonce`).
pub async fn maybe_send_extranonce(session: &mut Session, writer: &DownstreamWriter, pool: PoolId) {
    let (en1, en2size) = {
        let state = session.pool(pool);
        match (state.extranonce1.clone(), state.extranonce2_size) {
            (Some(en1), Some(size)) => (en1, size),
            _ => return,
        }
    };

    let force_switch = match &session.last_sent_extranonce {
        Some(last) => last.pool != pool,
        None => false,
    };

    if !force_switch {
        if session.raw_subscribe_forwarded_pool == Some(pool) {
            let already_current = session
                .last_sent_extranonce
                .as_ref()
                .map(|l| l.pool == pool)
                .unwrap_or(true);
            if already_current {
                session.last_sent_extranonce = Some(LastSentExtranonce {
                    extranonce1: en1,
                    extranonce2_size: en2size,
                    pool,
                });
                return;
            }
        }
        if let Some(last) = &session.last_sent_extranonce {
            if last.extranonce1 == en1 && last.extranonce2_size == en2size && last.pool == pool {
                return;
            }
        }
    }

    let msg = json!({ "method": MINING_SET_EXTRANONCE, "params": [en1, en2size] });
    if write_line(writer, &msg).await.is_ok() {
        session.last_sent_extranonce = Some(LastSentExtranonce {
            extranonce1: en1,
            extranonce2_size: en2size,
            pool,
        });
    }
}

/// Push `set_difficulty` for pool `P` if the clamped integer changed (or
/// `force`). Suppressed entirely if `P`'s effective weight is 0. Returns
/// `true` if a message was actually sent (so callers can apply the
/// post-difficulty pause only when needed).
pub async fn maybe_send_difficulty(
    session: &mut Session,
    config: &AppConfig,
    writer: &DownstreamWriter,
    pool: PoolId,
    force: bool,
) -> bool {
    if weight_for(config, pool) == 0 {
        return false;
    }
    let Some(raw) = session.pool(pool).latest_diff else {
        return false;
    };
    let (min_diff, max_diff) = min_max_for(config, pool);
    let dd = clamp_difficulty(raw, min_diff, max_diff);

    let unchanged = session
        .last_sent_difficulty_by_pool
        .get(&pool)
        .map(|last| *last == dd)
        .unwrap_or(false);
    if unchanged && !force {
        return false;
    }

    let msg = json!({ "method": MINING_SET_DIFFICULTY, "params": [dd] });
    if write_line(writer, &msg).await.is_ok() {
        session.last_sent_difficulty_by_pool.insert(pool, dd);
        true
    } else {
        false
    }
}

/// Push the cached `mining.notify` for pool `P` with `clean_jobs` forced
/// true.
pub async fn send_notify(session: &Session, writer: &DownstreamWriter, pool: PoolId) {
    let Some(raw) = session.pool(pool).latest_notify_raw.clone() else {
        return;
    };
    let params = raw
        .get("params")
        .and_then(serde_json::Value::as_array)
        .cloned()
        .unwrap_or_default();
    let cleaned = force_clean_notify(params);
    let msg = protocol::build_notification(MINING_NOTIFY, cleaned);
    let _ = write_line(writer, &msg).await;
}

/// Full `extranonce → difficulty(force) → notify(clean=true)` sequence run
/// on a pool switch or right after a successful authorize. Pauses ~250ms
/// after a difficulty change before the notify, reducing "low difficulty
/// share" bursts while miners apply the new target.
pub async fn resend_clean(
    session: &mut Session,
    config: &AppConfig,
    writer: &DownstreamWriter,
    pool: PoolId,
) {
    maybe_send_extranonce(session, writer, pool).await;
    let diff_changed = maybe_send_difficulty(session, config, writer, pool, true).await;
    if diff_changed {
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    send_notify(session, writer, pool).await;
}
