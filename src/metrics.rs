//! Prometheus metrics registry and minimal HTTP exposition, matching the
//! exact metric names in SPEC_FULL.md §6 (grounded on the `Counter`/`Gauge`
//! declarations at the top of `dpmpv2.py`).

use prometheus::{CounterVec, Gauge, GaugeVec, Opts, Registry};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub struct Metrics {
    pub registry: Registry,
    pub downstream_connections: Gauge,
    pub upstream_connections: GaugeVec,
    pub messages_rx_total: CounterVec,
    pub messages_tx_total: CounterVec,
    pub shares_submitted_total: prometheus::Counter,
    pub shares_accepted_total: CounterVec,
    pub shares_rejected_total: CounterVec,
    pub jobs_forwarded_total: CounterVec,
    pub accepted_difficulty_sum: CounterVec,
    pub downstream_difficulty: Gauge,
    pub active_pool: GaugeVec,
    pub oracle_hashrate: GaugeVec,
    pub oracle_ratio: GaugeVec,
    pub oracle_weight: GaugeVec,
    pub oracle_status: Gauge,
    pub oracle_data_age_seconds: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let downstream_connections = Gauge::new(
            "dpmp_downstream_connections",
            "Active downstream miner connections",
        )?;
        let upstream_connections = GaugeVec::new(
            Opts::new("dpmp_upstream_connections", "Active upstream pool connections"),
            &["pool"],
        )?;
        let messages_rx_total = CounterVec::new(
            Opts::new("dpmp_messages_rx_total", "Messages received"),
            &["side"],
        )?;
        let messages_tx_total = CounterVec::new(
            Opts::new("dpmp_messages_tx_total", "Messages sent"),
            &["side"],
        )?;
        let shares_submitted_total = prometheus::Counter::new(
            "dpmp_shares_submitted_total",
            "Shares submitted by miners",
        )?;
        let shares_accepted_total = CounterVec::new(
            Opts::new("dpmp_shares_accepted_total", "Shares accepted by pools"),
            &["pool"],
        )?;
        let shares_rejected_total = CounterVec::new(
            Opts::new("dpmp_shares_rejected_total", "Shares rejected by pools"),
            &["pool"],
        )?;
        let jobs_forwarded_total = CounterVec::new(
            Opts::new("dpmp_jobs_forwarded_total", "Jobs forwarded to miner"),
            &["pool"],
        )?;
        let accepted_difficulty_sum = CounterVec::new(
            Opts::new(
                "dpmp_accepted_difficulty_sum",
                "Sum of difficulty for accepted shares",
            ),
            &["pool"],
        )?;
        let downstream_difficulty = Gauge::new(
            "dpmp_downstream_difficulty",
            "Current downstream difficulty",
        )?;
        let active_pool = GaugeVec::new(
            Opts::new("dpmp_active_pool", "Active pool (1=active,0=inactive)"),
            &["pool"],
        )?;
        let oracle_hashrate = GaugeVec::new(
            Opts::new("dpmp_oracle_hashrate", "Network hashrate from oracle"),
            &["chain", "window"],
        )?;
        let oracle_ratio = GaugeVec::new(
            Opts::new("dpmp_oracle_ratio", "Hashrate ratio (short/baseline)"),
            &["chain"],
        )?;
        let oracle_weight = GaugeVec::new(
            Opts::new("dpmp_oracle_weight", "Oracle-calculated pool weight"),
            &["pool"],
        )?;
        let oracle_status = Gauge::new(
            "dpmp_oracle_status",
            "Oracle status (1=healthy, 0=error)",
        )?;
        let oracle_data_age_seconds = Gauge::new(
            "dpmp_oracle_data_age_seconds",
            "Age of oracle data in seconds",
        )?;

        registry.register(Box::new(downstream_connections.clone()))?;
        registry.register(Box::new(upstream_connections.clone()))?;
        registry.register(Box::new(messages_rx_total.clone()))?;
        registry.register(Box::new(messages_tx_total.clone()))?;
        registry.register(Box::new(shares_submitted_total.clone()))?;
        registry.register(Box::new(shares_accepted_total.clone()))?;
        registry.register(Box::new(shares_rejected_total.clone()))?;
        registry.register(Box::new(jobs_forwarded_total.clone()))?;
        registry.register(Box::new(accepted_difficulty_sum.clone()))?;
        registry.register(Box::new(downstream_difficulty.clone()))?;
        registry.register(Box::new(active_pool.clone()))?;
        registry.register(Box::new(oracle_hashrate.clone()))?;
        registry.register(Box::new(oracle_ratio.clone()))?;
        registry.register(Box::new(oracle_weight.clone()))?;
        registry.register(Box::new(oracle_status.clone()))?;
        registry.register(Box::new(oracle_data_age_seconds.clone()))?;

        Ok(Self {
            registry,
            downstream_connections,
            upstream_connections,
            messages_rx_total,
            messages_tx_total,
            shares_submitted_total,
            shares_accepted_total,
            shares_rejected_total,
            jobs_forwarded_total,
            accepted_difficulty_sum,
            downstream_difficulty,
            active_pool,
            oracle_hashrate,
            oracle_ratio,
            oracle_weight,
            oracle_status,
            oracle_data_age_seconds,
        })
    }

    fn render(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        let _ = encoder.encode(&families, &mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Serve `GET /metrics` over plain HTTP until the process exits. A bind
/// failure is logged and swallowed (SPEC_FULL.md §7: metrics bind failure is
/// tolerated, never fatal).
pub async fn serve(metrics: Arc<Metrics>, addr: SocketAddr) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            log::warn!("event=metrics_bind_failed addr={addr} err={e}");
            return;
        }
    };
    log::info!("event=metrics_listening addr={addr}");
    loop {
        let (mut socket, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("event=metrics_accept_failed err={e}");
                continue;
            }
        };
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let _: Result<(), Infallible> = handle_connection(&mut socket, &metrics).await;
        });
    }
}

async fn handle_connection(
    socket: &mut tokio::net::TcpStream,
    metrics: &Metrics,
) -> Result<(), Infallible> {
    let mut buf = [0u8; 1024];
    // We don't need to parse the request line; any GET gets /metrics.
    let _ = socket.read(&mut buf).await;
    let body = metrics.render();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_match_spec() {
        let m = Metrics::new().unwrap();
        let families = m.registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        for expected in [
            "dpmp_downstream_connections",
            "dpmp_upstream_connections",
            "dpmp_messages_rx_total",
            "dpmp_messages_tx_total",
            "dpmp_shares_submitted_total",
            "dpmp_shares_accepted_total",
            "dpmp_shares_rejected_total",
            "dpmp_jobs_forwarded_total",
            "dpmp_accepted_difficulty_sum",
            "dpmp_downstream_difficulty",
            "dpmp_active_pool",
            "dpmp_oracle_hashrate",
            "dpmp_oracle_ratio",
            "dpmp_oracle_weight",
            "dpmp_oracle_status",
            "dpmp_oracle_data_age_seconds",
        ] {
            assert!(names.contains(&expected.to_string()), "missing metric {expected}");
        }
    }
}
