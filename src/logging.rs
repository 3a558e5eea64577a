//! Structured event logging on top of the `log` facade.
//!
//! The source emits one JSON object per event (`dpmpv2.py::log`), filtered by
//! an allow/deny list and a coarse debug/info level split. We keep the same
//! shape but ride on `log`/`env_logger` rather than hand-rolling a print
//! statement, so the rest of the ambient stack (log levels, `RUST_LOG`,
//! whatever the deployment already captures stdout with) keeps working.

use crate::config::LoggingConfig;
use std::collections::HashSet;
use std::sync::OnceLock;

/// Events considered high-volume/diagnostic; suppressed unless the
/// configured level is debug/trace or the event is explicitly allow-listed.
/// Mirrors `dpmpv2.py::_DEBUG_EVENTS`.
const DEBUG_EVENTS: &[&str] = &[
    "downstream_tx",
    "upstream_tx",
    "miner_method",
    "submit_snapshot",
    "submit_local_sanity",
    "job_forwarded_diff_state",
    "downstream_send_notify",
    "downstream_send_raw",
    "downstream_send_diff",
    "scheduler_tick",
];

struct Filters {
    level: String,
    allow: HashSet<String>,
    deny: HashSet<String>,
}

static FILTERS: OnceLock<Filters> = OnceLock::new();

fn parse_list(s: &str) -> HashSet<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Initialize `env_logger` and the event-filter state. `config` provides the
/// defaults; `DPMP_LOG_LEVEL`/`DPMP_LOG_ALLOW`/`DPMP_LOG_DENY` environment
/// variables win when set, matching the source's override order.
pub fn init(config: &LoggingConfig) {
    let level = std::env::var("DPMP_LOG_LEVEL")
        .ok()
        .unwrap_or_else(|| config.level.clone())
        .to_lowercase();
    let allow = std::env::var("DPMP_LOG_ALLOW")
        .ok()
        .map(|s| parse_list(&s))
        .unwrap_or_else(|| config.allow.iter().cloned().collect());
    let deny = std::env::var("DPMP_LOG_DENY")
        .ok()
        .map(|s| parse_list(&s))
        .unwrap_or_else(|| config.deny.iter().cloned().collect());

    let _ = FILTERS.set(Filters {
        level: level.clone(),
        allow,
        deny,
    });

    let rust_log_level = match level.as_str() {
        "quiet" | "off" | "none" => "off",
        "debug" | "trace" => level.as_str(),
        _ => "info",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(rust_log_level),
    )
    .format_timestamp_millis()
    .init();
}

/// Returns true if an event with this name should be emitted under the
/// current filter configuration.
pub fn event_allowed(event: &str) -> bool {
    let Some(f) = FILTERS.get() else {
        return true;
    };
    if !f.allow.is_empty() && !f.allow.contains(event) {
        return false;
    }
    if f.deny.contains(event) {
        return false;
    }
    if matches!(f.level.as_str(), "quiet" | "off" | "none") {
        return false;
    }
    if matches!(f.level.as_str(), "info" | "warn" | "warning" | "error") && DEBUG_EVENTS.contains(&event) {
        return false;
    }
    true
}

/// Emit a structured event. Prefer the `log_event!` macro at call sites; this
/// function backs it.
pub fn emit(event: &str, level: log::Level, fields: &[(&str, String)]) {
    if !event_allowed(event) {
        return;
    }
    let mut rendered = String::new();
    for (k, v) in fields {
        rendered.push(' ');
        rendered.push_str(k);
        rendered.push('=');
        rendered.push_str(v);
    }
    log::log!(level, "event={event}{rendered}");
}

/// Structured-event logging macro: `log_event!(Info, "scheduler_switch", pool = "A", reason = "urgent")`.
#[macro_export]
macro_rules! log_event {
    ($level:ident, $event:expr $(, $key:ident = $val:expr)* $(,)?) => {
        $crate::logging::emit(
            $event,
            log::Level::$level,
            &[$((stringify!($key), $val.to_string())),*],
        )
    };
}
