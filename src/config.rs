//! Typed configuration loading with the safety clamps described in
//! SPEC_FULL.md §6, grounded on `dpmpv2.py::load_config`.

use crate::error::ProxyError;
use serde::Deserialize;
use std::path::Path;

const MIN_SWITCH_FLOOR_SECONDS: u64 = 25;
const MIN_ORACLE_POLL_SECONDS: u64 = 600;
const MIN_AUTO_BALANCE_DEVIATION: i32 = 5;
const MAX_AUTO_BALANCE_DEVIATION: i32 = 45;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawConfig {
    listen: RawListen,
    metrics: RawMetrics,
    pools: RawPools,
    scheduler: RawScheduler,
    downstream_diff: RawDownstreamDiff,
    logging: RawLogging,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            listen: RawListen::default(),
            metrics: RawMetrics::default(),
            pools: RawPools::default(),
            scheduler: RawScheduler::default(),
            downstream_diff: RawDownstreamDiff::default(),
            logging: RawLogging::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawListen {
    host: String,
    port: u16,
}

impl Default for RawListen {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3350,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawMetrics {
    enabled: bool,
    host: String,
    port: u16,
}

impl Default for RawMetrics {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9109,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPools {
    #[serde(rename = "A")]
    a: RawPool,
    #[serde(rename = "B")]
    b: RawPool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawPool {
    name: String,
    host: String,
    port: u16,
    wallet: String,
    chain: String,
}

impl Default for RawPool {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "127.0.0.1".to_string(),
            port: 3333,
            wallet: String::new(),
            chain: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawScheduler {
    #[serde(rename = "poolA_weight")]
    pool_a_weight: i64,
    #[serde(rename = "poolB_weight")]
    pool_b_weight: i64,
    min_switch_seconds: u64,
    slice_seconds: u64,
    auto_balance: bool,
    auto_balance_max_deviation: i32,
    oracle_url: String,
    oracle_poll_seconds: u64,
}

impl Default for RawScheduler {
    fn default() -> Self {
        Self {
            pool_a_weight: 50,
            pool_b_weight: 50,
            min_switch_seconds: 30,
            slice_seconds: 30,
            auto_balance: false,
            auto_balance_max_deviation: 20,
            oracle_url: "https://oracle.invalid/dpmp/oracle".to_string(),
            oracle_poll_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawDownstreamDiff {
    default_min: f64,
    #[serde(rename = "poolA_min")]
    pool_a_min: f64,
    #[serde(rename = "poolB_min")]
    pool_b_min: f64,
    #[serde(rename = "poolA_max")]
    pool_a_max: f64,
    #[serde(rename = "poolB_max")]
    pool_b_max: f64,
}

impl Default for RawDownstreamDiff {
    fn default() -> Self {
        Self {
            default_min: 1.0,
            pool_a_min: 1.0,
            pool_b_min: 1.0,
            pool_a_max: f64::MAX,
            pool_b_max: f64::MAX,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLogging {
    level: String,
    allow: Vec<String>,
    deny: Vec<String>,
}

/// One of the two upstream pools.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub wallet: String,
    /// Upper-cased chain label, e.g. `"BTC"`, `"BCH"`, or empty if unset.
    pub chain: String,
    pub weight: u32,
    pub min_diff: f64,
    pub max_diff: f64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub pool_a_weight: u32,
    pub pool_b_weight: u32,
    pub min_switch_seconds: u64,
    pub slice_seconds: u64,
    pub auto_balance: bool,
    pub auto_balance_max_deviation: i32,
    pub oracle_url: String,
    pub oracle_poll_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_host: String,
    pub listen_port: u16,
    pub metrics_enabled: bool,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub pool_a: PoolConfig,
    pub pool_b: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub default_min_diff: f64,
    pub logging: LoggingConfig,
    /// Directory where `weights_override.json`/`oracle_mode.json`/
    /// `oracle_chart_history.json` are read and written.
    pub control_plane_dir: std::path::PathBuf,
}

/// Load and validate configuration from a JSON file at `path`. Safety clamps
/// from SPEC_FULL.md §6 are applied and logged; `control_plane_dir` defaults
/// to the config file's parent directory.
pub fn load(path: impl AsRef<Path>) -> Result<AppConfig, ProxyError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| ProxyError::Config(format!("reading {}: {e}", path.display())))?;
    let raw: RawConfig = serde_json::from_slice(&bytes)
        .map_err(|e| ProxyError::Config(format!("parsing {}: {e}", path.display())))?;

    let (wa, wb) = if raw.scheduler.pool_a_weight < 0
        || raw.scheduler.pool_b_weight < 0
        || (raw.scheduler.pool_a_weight == 0 && raw.scheduler.pool_b_weight == 0)
    {
        (50u32, 50u32)
    } else {
        (
            raw.scheduler.pool_a_weight as u32,
            raw.scheduler.pool_b_weight as u32,
        )
    };

    let mut max_dev = raw.scheduler.auto_balance_max_deviation;
    if max_dev < MIN_AUTO_BALANCE_DEVIATION || max_dev > MAX_AUTO_BALANCE_DEVIATION {
        let corrected = max_dev.clamp(MIN_AUTO_BALANCE_DEVIATION, MAX_AUTO_BALANCE_DEVIATION);
        log::warn!(
            "event=config_safety_max_deviation_clamped raw={max_dev} corrected={corrected}"
        );
        max_dev = corrected;
    }

    let mut oracle_poll = raw.scheduler.oracle_poll_seconds;
    if oracle_poll < MIN_ORACLE_POLL_SECONDS {
        log::warn!(
            "event=config_safety_oracle_poll_clamped raw={oracle_poll} corrected={MIN_ORACLE_POLL_SECONDS}"
        );
        oracle_poll = MIN_ORACLE_POLL_SECONDS;
    }

    let mut min_switch = raw.scheduler.min_switch_seconds;
    if min_switch < MIN_SWITCH_FLOOR_SECONDS {
        log::warn!(
            "event=config_safety_min_switch_clamped raw={min_switch} corrected={MIN_SWITCH_FLOOR_SECONDS}"
        );
        min_switch = MIN_SWITCH_FLOOR_SECONDS;
    }

    let mut slice = raw.scheduler.slice_seconds;
    if slice >= min_switch {
        let corrected = min_switch.saturating_sub(5).max(1);
        log::warn!(
            "event=config_safety_slice_clamped raw_slice={slice} raw_min_switch={min_switch} corrected={corrected}"
        );
        slice = corrected;
    }

    log::info!("event=scheduler_config_validated min_switch_seconds={min_switch} slice_seconds={slice} wA={wa} wB={wb}");

    let pool_a = PoolConfig {
        name: if raw.pools.a.name.is_empty() { "A".to_string() } else { raw.pools.a.name },
        host: raw.pools.a.host,
        port: raw.pools.a.port,
        wallet: raw.pools.a.wallet,
        chain: raw.pools.a.chain.to_uppercase(),
        weight: wa,
        min_diff: if raw.downstream_diff.pool_a_min > 0.0 { raw.downstream_diff.pool_a_min } else { raw.downstream_diff.default_min },
        max_diff: raw.downstream_diff.pool_a_max,
    };
    let pool_b = PoolConfig {
        name: if raw.pools.b.name.is_empty() { "B".to_string() } else { raw.pools.b.name },
        host: raw.pools.b.host,
        port: raw.pools.b.port,
        wallet: raw.pools.b.wallet,
        chain: raw.pools.b.chain.to_uppercase(),
        weight: wb,
        min_diff: if raw.downstream_diff.pool_b_min > 0.0 { raw.downstream_diff.pool_b_min } else { raw.downstream_diff.default_min },
        max_diff: raw.downstream_diff.pool_b_max,
    };

    if raw.scheduler.auto_balance {
        log::info!(
            "event=oracle_config auto_balance=true max_deviation={max_dev} oracle_url={} poll_seconds={oracle_poll}",
            raw.scheduler.oracle_url
        );
    }

    let control_plane_dir = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    Ok(AppConfig {
        listen_host: raw.listen.host,
        listen_port: raw.listen.port,
        metrics_enabled: raw.metrics.enabled,
        metrics_host: raw.metrics.host,
        metrics_port: raw.metrics.port,
        pool_a,
        pool_b,
        scheduler: SchedulerConfig {
            pool_a_weight: wa,
            pool_b_weight: wb,
            min_switch_seconds: min_switch,
            slice_seconds: slice,
            auto_balance: raw.scheduler.auto_balance,
            auto_balance_max_deviation: max_dev,
            oracle_url: raw.scheduler.oracle_url,
            oracle_poll_seconds: oracle_poll,
        },
        default_min_diff: raw.downstream_diff.default_min,
        logging: LoggingConfig {
            level: if raw.logging.level.is_empty() { "info".to_string() } else { raw.logging.level },
            allow: raw.logging.allow,
            deny: raw.logging.deny,
        },
        control_plane_dir,
    })
}
