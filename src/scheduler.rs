//! Scheduler (C6): the per-session cooperative loop that decides which
//! pool's job/difficulty/extranonce is live at the miner.
//!
//! Grounded on `dpmpv2.py::forward_jobs`, translated from its single
//! monolithic function into the tick-step layout SPEC_FULL.md §4.6
//! documents.

use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::pool::{PoolId, PoolLinks};
use crate::session::emitter::{self, DownstreamWriter};
use crate::session::{Session, RECENT_WINDOW_SECONDS};
use crate::weight::WeightArbiter;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

const TICK_PERIOD: Duration = Duration::from_millis(100);
const PRUNE_PERIOD: Duration = Duration::from_secs(60);
const ACCUMULATOR_DECAY: f64 = 0.9995;

struct TickState {
    last_effective_weights: Option<(u32, u32)>,
    last_prune: Instant,
}

/// Run the scheduler loop until the session's owning supervisor cancels it.
/// Waits for `miner_ready` before driving any pool switches.
pub async fn run(
    session: Arc<Mutex<Session>>,
    config: Arc<AppConfig>,
    pools: Arc<PoolLinks>,
    writer: DownstreamWriter,
    metrics: Arc<Metrics>,
    arbiter: WeightArbiter,
) {
    let mut state = TickState {
        last_effective_weights: None,
        last_prune: Instant::now(),
    };
    loop {
        sleep(TICK_PERIOD).await;
        let mut guard = session.lock().await;
        if !guard.miner_ready {
            continue;
        }
        tick(&mut guard, &config, &pools, &writer, &metrics, &arbiter, &mut state).await;
    }
}

async fn tick(
    session: &mut Session,
    config: &AppConfig,
    pools: &PoolLinks,
    writer: &DownstreamWriter,
    metrics: &Arc<Metrics>,
    arbiter: &WeightArbiter,
    state: &mut TickState,
) {
    let now = Instant::now();

    // Step 1: periodic pruning.
    if now.duration_since(state.last_prune) >= PRUNE_PERIOD {
        session.prune_all();
        state.last_prune = now;
    }

    // Step 2: emergency failover.
    if !session.pool(session.active_pool).alive {
        let other = session.active_pool.other();
        if session.pool(other).alive && session.pool(other).latest_notify_raw.is_some() {
            switch_to(session, config, writer, metrics, other).await;
            return;
        }
    }

    // Step 3: weight resolution + rebalance.
    let resolved = arbiter.resolve();
    let wa = if session.pool_a.alive { resolved.pool_a } else { 0 };
    let wb = if session.pool_b.alive { resolved.pool_b } else { 0 };
    if state.last_effective_weights != Some((wa, wb)) {
        rebalance_accumulators(session, wa, wb);
        state.last_effective_weights = Some((wa, wb));
    }

    if wa == 0 && wb == 0 {
        return;
    }

    let target_a = wa as f64 / (wa + wb) as f64;
    let target_b = 1.0 - target_a;

    // Step 4: effective minimum switch time.
    let active_target = if session.active_pool == PoolId::A { target_a } else { target_b };
    let eff_switch = (config.scheduler.slice_seconds as f64)
        .max((config.scheduler.min_switch_seconds as f64 * active_target * 2.0).min(config.scheduler.min_switch_seconds as f64));
    let eff_switch = Duration::from_secs_f64(eff_switch);

    let time_since_switch = now.duration_since(session.last_switch_instant);
    if time_since_switch < eff_switch {
        forward_if_new_job(session, config, writer, metrics, session.active_pool).await;
        return;
    }

    let total_acc = session.pool_a.accepted_diff_accum + session.pool_b.accepted_diff_accum;
    let (share_a, share_b) = if total_acc > 0.0 {
        (session.pool_a.accepted_diff_accum / total_acc, session.pool_b.accepted_diff_accum / total_acc)
    } else {
        (target_a, target_b)
    };

    decay_accumulators(session);

    let active_share = if session.active_pool == PoolId::A { share_a } else { share_b };
    let current_deviation = active_share - active_target;
    let minority_target = target_a.min(target_b);
    let urgent = current_deviation > minority_target.max(0.05);

    let elapsed_ok = time_since_switch >= Duration::from_secs(config.scheduler.slice_seconds);
    if !elapsed_ok && !urgent {
        forward_if_new_job(session, config, writer, metrics, session.active_pool).await;
        return;
    }

    let mut prefer = if share_b < target_b { PoolId::B } else { PoolId::A };
    if wa == 0 {
        prefer = PoolId::B;
    } else if wb == 0 {
        prefer = PoolId::A;
    }

    if prefer != session.active_pool && !urgent && current_deviation.abs() < minority_target / 4.0 {
        forward_if_new_job(session, config, writer, metrics, session.active_pool).await;
        return;
    }

    // Step 6: switch guard.
    if prefer != session.active_pool {
        if session.pool(prefer).latest_notify_raw.is_none() {
            forward_if_new_job(session, config, writer, metrics, session.active_pool).await;
            return;
        }
        switch_to(session, config, writer, metrics, prefer).await;
        return;
    }

    forward_if_new_job(session, config, writer, metrics, session.active_pool).await;
}

async fn switch_to(
    session: &mut Session,
    config: &AppConfig,
    writer: &DownstreamWriter,
    metrics: &Arc<Metrics>,
    pool: PoolId,
) {
    session.active_pool = pool;
    session.last_switch_instant = Instant::now();
    emitter::resend_clean(session, config, writer, pool).await;
    metrics.active_pool.with_label_values(&[pool.other().as_str()]).set(0.0);
    metrics.active_pool.with_label_values(&[pool.as_str()]).set(1.0);
    commit_forwarded_job(session, pool, metrics);
    log::info!("event=scheduler_switch pool={}", pool.as_str());
}

async fn forward_if_new_job(
    session: &mut Session,
    config: &AppConfig,
    writer: &DownstreamWriter,
    metrics: &Arc<Metrics>,
    pool: PoolId,
) {
    if session.pool(pool).notify_seq <= session.pool(pool).last_sent_seq && session.last_forwarded_pool == Some(pool) {
        return;
    }
    emitter::maybe_send_extranonce(session, writer, pool).await;
    emitter::maybe_send_difficulty(session, config, writer, pool, false).await;
    emitter::send_notify(session, writer, pool).await;
    commit_forwarded_job(session, pool, metrics);
}

fn commit_forwarded_job(session: &mut Session, pool: PoolId, metrics: &Arc<Metrics>) {
    let Some(jobid) = session.pool(pool).latest_jobid.clone() else {
        return;
    };
    session.job_owner.insert((pool, jobid.clone()), pool);
    session.last_forwarded_pool = Some(pool);
    session.last_forwarded_jobid = Some(jobid);
    session.pool_mut(pool).last_sent_seq = session.pool(pool).notify_seq;
    metrics.jobs_forwarded_total.with_label_values(&[pool.as_str()]).inc();
}

/// Rebalance accumulators to preserve total while matching the new target
/// split: `new_acc[P] = total_acc * wP / (wA+wB)` (SPEC_FULL.md §4.6 step 3).
fn rebalance_accumulators(session: &mut Session, wa: u32, wb: u32) {
    let total = session.pool_a.accepted_diff_accum + session.pool_b.accepted_diff_accum;
    if total <= 0.0 || wa + wb == 0 {
        return;
    }
    let denom = (wa + wb) as f64;
    session.pool_a.accepted_diff_accum = total * wa as f64 / denom;
    session.pool_b.accepted_diff_accum = total * wb as f64 / denom;
}

fn decay_accumulators(session: &mut Session) {
    session.pool_a.accepted_diff_accum *= ACCUMULATOR_DECAY;
    session.pool_b.accepted_diff_accum *= ACCUMULATOR_DECAY;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebalance_preserves_total_and_matches_ratio() {
        let mut session = Session::new(PoolId::A);
        session.pool_a.accepted_diff_accum = 100.0;
        session.pool_b.accepted_diff_accum = 100.0;
        rebalance_accumulators(&mut session, 80, 20);
        let total = session.pool_a.accepted_diff_accum + session.pool_b.accepted_diff_accum;
        assert!((total - 200.0).abs() < 1e-6);
        assert!((session.pool_a.accepted_diff_accum / total - 0.8).abs() < 1e-6);
    }

    #[test]
    fn decay_shrinks_both_accumulators() {
        let mut session = Session::new(PoolId::A);
        session.pool_a.accepted_diff_accum = 100.0;
        session.pool_b.accepted_diff_accum = 50.0;
        decay_accumulators(&mut session);
        assert!((session.pool_a.accepted_diff_accum - 99.95).abs() < 1e-6);
        assert!((session.pool_b.accepted_diff_accum - 49.975).abs() < 1e-6);
    }

    #[test]
    fn recent_window_constant_is_five_minutes() {
        assert_eq!(RECENT_WINDOW_SECONDS, 300);
    }
}
