//! Hashrate oracle worker (C10, optional): polls an external endpoint,
//! computes inverse-ratio weights, and writes `weights_override.json`.
//!
//! Grounded on `dpmpv2.py::oracle_poll_loop`/`_calc_hashrate_pair`/`_oracle_fetch`.

use crate::config::AppConfig;
use crate::metrics::Metrics;
use crate::weight::WeightArbiter;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const STARTUP_DELAY: Duration = Duration::from_secs(60);
const STALE_DATA_SECONDS: i64 = 1200; // 20 minutes
const FAILURE_FALLBACK_THRESHOLD: u32 = 3;

#[derive(Debug, Deserialize)]
struct OracleResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: String,
    #[serde(default = "default_short_window")]
    short_window: u32,
    #[serde(default = "default_long_window")]
    long_window: u32,
    btc_difficulty: f64,
    btc_ts_latest: i64,
    btc_ts_short: i64,
    btc_ts_long: i64,
    bch_difficulty: f64,
    bch_ts_latest: i64,
    bch_ts_short: i64,
    bch_ts_long: i64,
}

fn default_short_window() -> u32 {
    6
}
fn default_long_window() -> u32 {
    72
}

/// Hashrate for the short and long windows of one chain, in H/s.
/// `hashrate = difficulty * 2^32 / avg_block_time`; a non-positive elapsed
/// window is reported as `(0.0, 0.0)` (bad timestamps, logged by the caller).
fn calc_hashrate_pair(
    difficulty: f64,
    ts_latest: i64,
    ts_short: i64,
    ts_long: i64,
    short_n: u32,
    long_n: u32,
) -> (f64, f64) {
    let elapsed_short = ts_latest - ts_short;
    let elapsed_long = ts_latest - ts_long;
    if elapsed_short <= 0 || elapsed_long <= 0 {
        return (0.0, 0.0);
    }
    let avg_short = elapsed_short as f64 / short_n as f64;
    let avg_long = elapsed_long as f64 / long_n as f64;
    let two_pow_32 = 2f64.powi(32);
    (
        difficulty * two_pow_32 / avg_short,
        difficulty * two_pow_32 / avg_long,
    )
}

/// Inverse-ratio weight for one chain: chains whose short-window hashrate
/// dropped relative to their long-window baseline get more weight.
fn inverse_weight(hr_short: f64, hr_long: f64) -> f64 {
    if hr_long <= 0.0 {
        return 1.0;
    }
    let ratio = hr_short / hr_long;
    if ratio > 0.0 {
        1.0 / ratio
    } else {
        1.0
    }
}

fn parse_mysql_utc_seconds_ago(ts: &str) -> Option<i64> {
    // "%Y-%m-%d %H:%M:%S" in UTC, compared against wall-clock now.
    let (date, time) = ts.split_once(' ')?;
    let mut d = date.split('-');
    let year: i32 = d.next()?.parse().ok()?;
    let month: u32 = d.next()?.parse().ok()?;
    let day: u32 = d.next()?.parse().ok()?;
    let mut t = time.split(':');
    let hour: u32 = t.next()?.parse().ok()?;
    let min: u32 = t.next()?.parse().ok()?;
    let sec: u32 = t.next()?.parse().ok()?;
    let naive = chrono::NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, min, sec)?;
    let then = chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(naive, chrono::Utc);
    let now = chrono::Utc::now();
    Some((now - then).num_seconds())
}

async fn fetch(url: &str) -> Result<OracleResponse, String> {
    let client = reqwest::Client::builder()
        .user_agent("dpmpv2-oracle/1.0")
        .timeout(Duration::from_secs(15))
        .build()
        .map_err(|e| e.to_string())?;
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("connection error: {e}"))?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {}", resp.status()));
    }
    resp.json::<OracleResponse>()
        .await
        .map_err(|e| format!("parse error: {e}"))
}

fn write_override(path: &Path, wa: u32, wb: u32, source: &str, ts: &str) {
    let tmp = path.with_extension("json.tmp");
    let obj = if ts.is_empty() {
        serde_json::json!({ "poolA_weight": wa, "poolB_weight": wb, "source": source })
    } else {
        serde_json::json!({ "poolA_weight": wa, "poolB_weight": wb, "source": source, "ts": ts })
    };
    let Ok(body) = serde_json::to_vec(&obj) else { return };
    if std::fs::write(&tmp, body).is_ok() {
        let _ = std::fs::rename(&tmp, path);
        log::info!("event=oracle_override_written path={} wa={wa} wb={wb}", path.display());
    } else {
        log::warn!("event=oracle_override_write_error path={}", path.display());
    }
}

/// Run the oracle poll loop forever. Returns immediately (without looping) if
/// the chain configuration is invalid (must be exactly one BTC + one BCH
/// pool), a `ConfigError` condition per SPEC_FULL.md §7, logged and the
/// subsystem disabled without aborting the proxy.
pub async fn run(config: Arc<AppConfig>, metrics: Arc<Metrics>) {
    let (btc_pool, bch_pool) = match classify_chains(&config) {
        Some(pair) => pair,
        None => {
            log::warn!(
                "event=oracle_disabled_bad_chain_config poolA_chain={} poolB_chain={} reason=auto_balance_requires_one_btc_one_bch_pool",
                config.pool_a.chain, config.pool_b.chain
            );
            return;
        }
    };

    let poll_interval = Duration::from_secs(config.scheduler.oracle_poll_seconds.max(60));
    let arbiter = WeightArbiter::new(
        config.control_plane_dir.clone(),
        config.scheduler.pool_a_weight,
        config.scheduler.pool_b_weight,
    );
    let override_path = config.control_plane_dir.join("weights_override.json");
    let max_dev = config.scheduler.auto_balance_max_deviation;
    let min_pct = (50 - max_dev) as f64;
    let max_pct = (50 + max_dev) as f64;

    log::info!(
        "event=oracle_starting url={} poll_s={} max_deviation={max_dev} btc_pool={btc_pool} bch_pool={bch_pool}",
        config.scheduler.oracle_url,
        poll_interval.as_secs()
    );
    log::info!("event=oracle_startup_delay delay_s={}", STARTUP_DELAY.as_secs());
    tokio::time::sleep(STARTUP_DELAY).await;

    let mut consecutive_failures: u32 = 0;

    loop {
        match run_one_cycle(&config, &metrics, btc_pool, bch_pool, min_pct, max_pct).await {
            Ok(()) => {
                consecutive_failures = 0;
            }
            Err(e) => {
                metrics.oracle_status.set(0.0);
                consecutive_failures += 1;
                log::warn!("event=oracle_poll_error err={e} consecutive_failures={consecutive_failures}");
                if consecutive_failures >= FAILURE_FALLBACK_THRESHOLD {
                    log::warn!("event=oracle_fallback_50_50 reason={consecutive_failures}_consecutive_failures");
                    if arbiter.oracle_active(config.scheduler.auto_balance) {
                        write_override(&override_path, 50, 50, "oracle_fallback", "");
                    }
                }
            }
        }
        log::info!("event=oracle_next_poll sleep_s={}", poll_interval.as_secs());
        tokio::time::sleep(poll_interval).await;
    }
}

fn classify_chains(config: &AppConfig) -> Option<(&'static str, &'static str)> {
    let mut chains = [config.pool_a.chain.as_str(), config.pool_b.chain.as_str()];
    chains.sort_unstable();
    if chains != ["BCH", "BTC"] {
        return None;
    }
    let btc_pool = if config.pool_a.chain == "BTC" { "A" } else { "B" };
    let bch_pool = if config.pool_a.chain == "BCH" { "A" } else { "B" };
    Some((btc_pool, bch_pool))
}

async fn run_one_cycle(
    config: &AppConfig,
    metrics: &Metrics,
    btc_pool: &str,
    bch_pool: &str,
    min_pct: f64,
    max_pct: f64,
) -> Result<(), String> {
    let data = fetch(&config.scheduler.oracle_url).await?;
    if !data.ok {
        return Err(format!("oracle response not ok: {}", data.error.as_deref().unwrap_or("unknown")));
    }

    let age_s = if !data.ts.is_empty() {
        match parse_mysql_utc_seconds_ago(&data.ts) {
            Some(age) => {
                if age > STALE_DATA_SECONDS {
                    return Err(format!("oracle data is stale ({age}s old)"));
                }
                Some(age)
            }
            None => None,
        }
    } else {
        None
    };

    let (btc_hr_short, btc_hr_long) = calc_hashrate_pair(
        data.btc_difficulty,
        data.btc_ts_latest,
        data.btc_ts_short,
        data.btc_ts_long,
        data.short_window,
        data.long_window,
    );
    let (bch_hr_short, bch_hr_long) = calc_hashrate_pair(
        data.bch_difficulty,
        data.bch_ts_latest,
        data.bch_ts_short,
        data.bch_ts_long,
        data.short_window,
        data.long_window,
    );

    let btc_ratio = if btc_hr_long > 0.0 { btc_hr_short / btc_hr_long } else { 1.0 };
    let bch_ratio = if bch_hr_long > 0.0 { bch_hr_short / bch_hr_long } else { 1.0 };

    let w_btc = inverse_weight(btc_hr_short, btc_hr_long);
    let w_bch = inverse_weight(bch_hr_short, bch_hr_long);
    let total_w = w_btc + w_bch;
    let mut pct_btc = if total_w > 0.0 { (w_btc / total_w) * 100.0 } else { 50.0 };
    pct_btc = pct_btc.clamp(min_pct, max_pct);
    let pct_bch = 100.0 - pct_btc;

    let wt_btc = pct_btc.round() as i64;
    let wt_bch = 100 - wt_btc;

    metrics.oracle_hashrate.with_label_values(&["BTC", "short"]).set(btc_hr_short);
    metrics.oracle_hashrate.with_label_values(&["BTC", "long"]).set(btc_hr_long);
    metrics.oracle_hashrate.with_label_values(&["BCH", "short"]).set(bch_hr_short);
    metrics.oracle_hashrate.with_label_values(&["BCH", "long"]).set(bch_hr_long);
    metrics.oracle_ratio.with_label_values(&["BTC"]).set(btc_ratio);
    metrics.oracle_ratio.with_label_values(&["BCH"]).set(bch_ratio);

    let wa = if btc_pool == "A" { wt_btc } else { wt_bch };
    let wb = if btc_pool == "B" { wt_btc } else { wt_bch };

    metrics.oracle_weight.with_label_values(&["A"]).set(wa as f64);
    metrics.oracle_weight.with_label_values(&["B"]).set(wb as f64);
    metrics.oracle_status.set(1.0);
    if let Some(age) = age_s {
        metrics.oracle_data_age_seconds.set(age as f64);
    }

    log::info!(
        "event=oracle_weights_applied poolA_weight={wa} poolA_chain={} poolB_weight={wb} poolB_chain={}",
        config.pool_a.chain, config.pool_b.chain
    );

    let arbiter = WeightArbiter::new(
        config.control_plane_dir.clone(),
        config.scheduler.pool_a_weight,
        config.scheduler.pool_b_weight,
    );
    let override_path = config.control_plane_dir.join("weights_override.json");
    if arbiter.oracle_active(config.scheduler.auto_balance) {
        write_override(&override_path, wa as u32, wb as u32, "oracle", &data.ts);
    } else {
        log::info!("event=oracle_mode_slider reason=slider_is_active_skipping_weight_write");
    }

    let _ = bch_pool; // used above via chain classification only
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashrate_pair_zero_on_bad_timestamps() {
        let (s, l) = calc_hashrate_pair(1000.0, 100, 100, 50, 6, 72);
        assert_eq!((s, l), (0.0, 0.0));
    }

    #[test]
    fn hashrate_pair_formula() {
        let (s, _l) = calc_hashrate_pair(1.0, 1000, 400, 0, 6, 72);
        // elapsed_short = 600, avg_short = 100, hr = 2^32/100
        let expected = 2f64.powi(32) / 100.0;
        assert!((s - expected).abs() < 1e-6);
    }

    #[test]
    fn inverse_weight_favors_dropped_hashrate() {
        // short << long => ratio < 1 => weight > 1 (more weight)
        let w_dropped = inverse_weight(1.0, 10.0);
        let w_steady = inverse_weight(10.0, 10.0);
        assert!(w_dropped > w_steady);
    }

    #[test]
    fn inverse_weight_falls_back_to_one_when_baseline_zero() {
        assert_eq!(inverse_weight(5.0, 0.0), 1.0);
    }

    #[test]
    fn mysql_timestamp_parses() {
        let age = parse_mysql_utc_seconds_ago("2020-01-01 00:00:00");
        assert!(age.is_some());
        assert!(age.unwrap() > 0);
    }

    #[test]
    fn chain_classification_requires_one_btc_one_bch() {
        let mut cfg_path = std::env::temp_dir();
        cfg_path.push("dualstratum-oracle-test.json");
        let mut cfg = mk_config();
        cfg.pool_a.chain = "BTC".into();
        cfg.pool_b.chain = "BCH".into();
        assert!(classify_chains(&cfg).is_some());
        cfg.pool_b.chain = "BTC".into();
        assert!(classify_chains(&cfg).is_none());
    }

    fn mk_config() -> AppConfig {
        AppConfig {
            listen_host: "0.0.0.0".into(),
            listen_port: 3350,
            metrics_enabled: false,
            metrics_host: "0.0.0.0".into(),
            metrics_port: 9109,
            pool_a: crate::config::PoolConfig {
                name: "A".into(), host: "127.0.0.1".into(), port: 3333, wallet: "".into(),
                chain: "".into(), weight: 50, min_diff: 1.0, max_diff: f64::MAX,
            },
            pool_b: crate::config::PoolConfig {
                name: "B".into(), host: "127.0.0.1".into(), port: 3334, wallet: "".into(),
                chain: "".into(), weight: 50, min_diff: 1.0, max_diff: f64::MAX,
            },
            scheduler: crate::config::SchedulerConfig {
                pool_a_weight: 50, pool_b_weight: 50, min_switch_seconds: 30, slice_seconds: 25,
                auto_balance: false, auto_balance_max_deviation: 20,
                oracle_url: "http://localhost".into(), oracle_poll_seconds: 600,
            },
            default_min_diff: 1.0,
            logging: crate::config::LoggingConfig { level: "info".into(), allow: vec![], deny: vec![] },
            control_plane_dir: std::env::temp_dir(),
        }
    }
}
