//! Handshake translator (C4): reconciles one miner handshake with two
//! upstream handshakes.
//!
//! Grounded on `dpmpv2.py::bootstrap_pool`/`rewrite_authorize` and the
//! request-building style of `src/stratum/v1/protocol.rs`.

use super::Session;
use crate::config::AppConfig;
use crate::pool::{PoolId, PoolLinks};
use crate::protocol::{self, MINING_AUTHORIZE, MINING_CONFIGURE, MINING_SUBSCRIBE};
use serde_json::Value;

/// Deterministic, side-effect-free handshake pool election (SPEC_FULL.md
/// §4.4): a weight-0 pool is never the handshake pool; ties go to A.
pub fn elect_handshake_pool(weight_a: u32, weight_b: u32) -> PoolId {
    if weight_a == 0 {
        PoolId::B
    } else if weight_b == 0 {
        PoolId::A
    } else if weight_b > weight_a {
        PoolId::B
    } else {
        PoolId::A
    }
}

/// Forward `mining.configure` to the handshake pool; mirror it to the other
/// pool (if connected) under an internal id whose response is consumed
/// silently.
pub async fn handle_configure(
    session: &mut Session,
    config: &AppConfig,
    pools: &PoolLinks,
    id: Value,
    params: Vec<Value>,
) {
    let primary = session.handshake_pool;
    let req = protocol::build_request_with_id(id, MINING_CONFIGURE, params.clone());
    let _ = pools.get(primary).send(req.to_string()).await;

    let other = primary.other();
    let other_weight = if other == PoolId::A {
        config.scheduler.pool_a_weight
    } else {
        config.scheduler.pool_b_weight
    };
    if other_weight > 0 {
        let internal_id = session.next_internal_id();
        let req = protocol::build_request(internal_id, MINING_CONFIGURE, params);
        let _ = pools.get(other).send(req.to_string()).await;
    }
}

/// Forward `mining.subscribe` to the handshake pool only; the response is
/// relayed raw to the miner by the pool reader (C3) since it is the handshake
/// pool's subscribe id.
pub async fn handle_subscribe(
    session: &mut Session,
    pools: &PoolLinks,
    id: Value,
    params: Vec<Value>,
) {
    session.subscribe_id = Some(id.clone());
    let req = protocol::build_request_with_id(id, MINING_SUBSCRIBE, params);
    let _ = pools.get(session.handshake_pool).send(req.to_string()).await;
}

/// Rewrite the miner's authorize username per pool (`<wallet>.<worker>`) and
/// forward to both pools: primary (handshake pool, response relayed) and
/// secondary (response consumed silently by C3's handshake filter).
pub async fn handle_authorize(
    session: &mut Session,
    config: &AppConfig,
    pools: &PoolLinks,
    id: Value,
    params: Vec<Value>,
) {
    session.authorize_id = Some(id.clone());
    let user = params.first().and_then(Value::as_str).unwrap_or("");
    let worker = protocol::extract_worker_name(user);
    session.set_worker_name(worker.clone());
    session.miner_ready = true;
    let pass = params.get(1).cloned().unwrap_or(Value::String(String::new()));

    let primary = session.handshake_pool;
    let secondary = primary.other();

    for pool_id in [primary, secondary] {
        let wallet = wallet_for(config, pool_id);
        let rewritten_user = format!("{wallet}.{worker}");
        let rewritten_params = vec![Value::String(rewritten_user), pass.clone()];
        let weight = weight_for(config, pool_id);
        if pool_id == secondary && weight == 0 {
            continue;
        }
        if pool_id == primary {
            let req = protocol::build_request_with_id(id.clone(), MINING_AUTHORIZE, rewritten_params);
            let _ = pools.get(pool_id).send(req.to_string()).await;
        } else {
            let internal_id = session.next_internal_id();
            let req = protocol::build_request(internal_id, MINING_AUTHORIZE, rewritten_params);
            let _ = pools.get(pool_id).send(req.to_string()).await;
        }
    }
}

fn wallet_for(config: &AppConfig, pool_id: PoolId) -> &str {
    match pool_id {
        PoolId::A => &config.pool_a.wallet,
        PoolId::B => &config.pool_b.wallet,
    }
}

fn weight_for(config: &AppConfig, pool_id: PoolId) -> u32 {
    match pool_id {
        PoolId::A => config.scheduler.pool_a_weight,
        PoolId::B => config.scheduler.pool_b_weight,
    }
}
