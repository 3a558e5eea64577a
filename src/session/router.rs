//! Share router (C7): resolves each miner `mining.submit` to its owning
//! pool, dedupes retries, and enforces the post-switch extranonce grace
//! window.
//!
//! Grounded on `dpmpv2.py`'s submit-routing fallback chain and
//! `src/stratum/v1/jobs.rs::JobManager` for the bounded-cache idiom.

use super::{msg_id_key, Session, SubmitFingerprint};
use crate::config::AppConfig;
use crate::error::ProxyError;
use crate::pool::{PoolId, PoolLinks};
use crate::protocol::{self, MINING_SUBMIT};
use serde_json::Value;
use std::time::{Duration, Instant};

const EXTRANONCE_GRACE_SECONDS: u64 = 4;

fn wallet_for(config: &AppConfig, pool: PoolId) -> &str {
    match pool {
        PoolId::A => &config.pool_a.wallet,
        PoolId::B => &config.pool_b.wallet,
    }
}

/// Resolve which pool owns a submitted job id, per the fallback chain in
/// SPEC_FULL.md §4.7 step 2. Returns `None` for the "reject locally, job not
/// found" cases (c) and no-prior-job.
fn resolve_pool(session: &Session, jobid: Option<&str>) -> Result<PoolId, ProxyError> {
    if session.last_forwarded_jobid.is_none() {
        return Err(ProxyError::job_not_found("job not found"));
    }
    let Some(jid) = jobid else {
        // (d) jobid absent from the submit: fall back to last_forwarded_pool.
        return session
            .last_forwarded_pool
            .ok_or_else(|| ProxyError::job_not_found("job not found"));
    };

    if let Some(owner) = session.job_owner.get(&(PoolId::A, jid.to_string())) {
        return Ok(*owner);
    }
    if let Some(owner) = session.job_owner.get(&(PoolId::B, jid.to_string())) {
        return Ok(*owner);
    }
    if session.last_forwarded_jobid.as_deref() == Some(jid) {
        if let Some(pool) = session.last_forwarded_pool {
            return Ok(pool);
        }
    }
    if session.last_forwarded_pool.is_some() {
        return Err(ProxyError::job_not_found("job not found"));
    }
    Err(ProxyError::job_not_found("job not found"))
}

/// Handle one miner `mining.submit`. On success, forwards the rewritten
/// request upstream and returns `Ok(())`; on a local reject, returns the
/// `ProxyError` whose `to_downstream_response` the caller should send to the
/// miner directly (no upstream forward).
pub async fn handle_submit(
    session: &mut Session,
    config: &AppConfig,
    pools: &PoolLinks,
    id: Value,
    mut params: Vec<Value>,
) -> Result<(), ProxyError> {
    let jobid = params.get(1).and_then(Value::as_str).map(str::to_string);
    let pool = resolve_pool(session, jobid.as_deref())?;

    let fp = SubmitFingerprint {
        jobid: jobid.clone().unwrap_or_default(),
        extranonce2: params.get(2).and_then(Value::as_str).unwrap_or("").to_string(),
        ntime: params.get(3).and_then(Value::as_str).unwrap_or("").to_string(),
        nonce: params.get(4).and_then(Value::as_str).unwrap_or("").to_string(),
        versionbits: params.get(5).and_then(Value::as_str).map(str::to_string),
    };
    let now = Instant::now();
    if session.pool_mut(pool).check_and_record_fingerprint(&fp, now) {
        return Err(ProxyError::duplicate_share());
    }

    if let Some(last) = &session.last_sent_extranonce {
        if last.pool != pool {
            let age = now.duration_since(session.last_switch_instant);
            if age >= Duration::from_secs(EXTRANONCE_GRACE_SECONDS) {
                return Err(ProxyError::stale_extranonce_context());
            }
        }
    }

    if !session.pool(pool).alive {
        return Err(ProxyError::job_not_found("pool unavailable"));
    }

    let worker = session.worker_name.clone();
    let wallet = wallet_for(config, pool);
    if !params.is_empty() {
        params[0] = Value::String(format!("{wallet}.{worker}"));
    }

    let mid = msg_id_key(&id);
    session.submit_owner.insert(mid.clone(), pool);
    let snapshot_diff = session
        .last_sent_difficulty_by_pool
        .get(&pool)
        .map(|d| *d as f64)
        .or(session.pool(pool).latest_diff)
        .unwrap_or(0.0);
    session.submit_diff.insert(mid, snapshot_diff);

    let req = protocol::build_request_with_id(id, MINING_SUBMIT, params);
    pools.get(pool).send(req.to_string()).await?;
    Ok(())
}

/// Credit a resolved share (from C3's response handling) into the pool's
/// accepted-difficulty accumulator, capped at 10% of the running total
/// (SPEC_FULL.md §4.7 / §9: prevents a single high-diff share from swinging
/// the ratio on lopsided targets).
pub fn credit_accepted_share(session: &mut Session, pool: PoolId, difficulty: f64) {
    let total = session.pool_a.accepted_diff_accum + session.pool_b.accepted_diff_accum;
    let credited = if total > 0.0 {
        difficulty.min(0.10 * total)
    } else {
        difficulty
    };
    session.pool_mut(pool).accepted_diff_accum += credited;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_via_job_owner_table() {
        let mut session = Session::new(PoolId::A);
        session.last_forwarded_jobid = Some("other".to_string());
        session.job_owner.insert((PoolId::B, "jid1".to_string()), PoolId::B);
        let resolved = resolve_pool(&session, Some("jid1")).unwrap();
        assert_eq!(resolved, PoolId::B);
    }

    #[test]
    fn falls_back_to_last_forwarded_when_jobid_matches() {
        let mut session = Session::new(PoolId::A);
        session.last_forwarded_jobid = Some("jidA".to_string());
        session.last_forwarded_pool = Some(PoolId::A);
        let resolved = resolve_pool(&session, Some("jidA")).unwrap();
        assert_eq!(resolved, PoolId::A);
    }

    #[test]
    fn rejects_unknown_jobid_when_history_exists() {
        let mut session = Session::new(PoolId::A);
        session.last_forwarded_jobid = Some("jidA".to_string());
        session.last_forwarded_pool = Some(PoolId::A);
        let result = resolve_pool(&session, Some("totally-unknown"));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_before_any_job_forwarded() {
        let session = Session::new(PoolId::A);
        let result = resolve_pool(&session, Some("jid"));
        assert!(result.is_err());
    }

    #[test]
    fn absent_jobid_falls_back_to_last_forwarded_pool() {
        let mut session = Session::new(PoolId::A);
        session.last_forwarded_jobid = Some("jidA".to_string());
        session.last_forwarded_pool = Some(PoolId::B);
        let resolved = resolve_pool(&session, None).unwrap();
        assert_eq!(resolved, PoolId::B);
    }

    #[test]
    fn credit_is_capped_at_ten_percent_of_total() {
        let mut session = Session::new(PoolId::A);
        session.pool_a.accepted_diff_accum = 1000.0;
        session.pool_b.accepted_diff_accum = 0.0;
        credit_accepted_share(&mut session, PoolId::A, 5000.0);
        assert!(session.pool_a.accepted_diff_accum <= 1100.0);
    }
}
