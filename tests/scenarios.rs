//! End-to-end scenarios against mock pool TCP servers, driving the real
//! session supervisor as a black box (the miner side of the wire).
//!
//! Follows the mock-server-plus-driver style of the teacher's
//! `tests/integration_tests.rs`, generalized from one upstream to two.

use dualstratum::config::{AppConfig, LoggingConfig, PoolConfig, SchedulerConfig};
use dualstratum::metrics::Metrics;
use dualstratum::session::supervisor::run_session;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

/// A generic mock pool: on accept, pushes an initial `set_difficulty` +
/// `notify`, then answers every `subscribe`/`configure`/`authorize`/`submit`
/// request it receives with a plausible success response reusing the
/// request's id.
async fn spawn_mock_pool(jobid: &str, difficulty: f64) -> (String, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let jobid = jobid.to_string();
    tokio::spawn(async move {
        let Ok((socket, _)) = listener.accept().await else { return };
        let (read_half, mut write_half) = socket.into_split();

        let diff_msg = json!({"method": "mining.set_difficulty", "params": [difficulty]});
        let _ = write_half.write_all(format!("{diff_msg}\n").as_bytes()).await;
        let notify_msg = json!({
            "method": "mining.notify",
            "params": [jobid, "prevhash", "cb1", "cb2", [], "2", "1d00ffff", "5f000000", false]
        });
        let _ = write_half.write_all(format!("{notify_msg}\n").as_bytes()).await;

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else { continue };
            let Some(method) = value.get("method").and_then(Value::as_str) else { continue };
            let id = value.get("id").cloned().unwrap_or(Value::Null);
            let response = match method {
                "mining.subscribe" => json!({
                    "id": id,
                    "result": [[["mining.set_difficulty", "1"], ["mining.notify", "1"]], "en1prefix", 4],
                    "error": null,
                }),
                "mining.authorize" => json!({"id": id, "result": true, "error": null}),
                "mining.submit" => json!({"id": id, "result": true, "error": null}),
                "mining.configure" => json!({"id": id, "result": {}, "error": null}),
                _ => continue,
            };
            if write_half.write_all(format!("{response}\n").as_bytes()).await.is_err() {
                break;
            }
        }
    });
    (addr.ip().to_string(), addr.port())
}

fn mk_config(pool_a_host: String, pool_a_port: u16, pool_b_host: String, pool_b_port: u16) -> AppConfig {
    AppConfig {
        listen_host: "127.0.0.1".into(),
        listen_port: 0,
        metrics_enabled: false,
        metrics_host: "127.0.0.1".into(),
        metrics_port: 0,
        pool_a: PoolConfig {
            name: "A".into(), host: pool_a_host, port: pool_a_port, wallet: "walletA".into(),
            chain: "".into(), weight: 50, min_diff: 1.0, max_diff: f64::MAX,
        },
        pool_b: PoolConfig {
            name: "B".into(), host: pool_b_host, port: pool_b_port, wallet: "walletB".into(),
            chain: "".into(), weight: 50, min_diff: 1.0, max_diff: f64::MAX,
        },
        scheduler: SchedulerConfig {
            pool_a_weight: 50, pool_b_weight: 50, min_switch_seconds: 30, slice_seconds: 25,
            auto_balance: false, auto_balance_max_deviation: 20,
            oracle_url: "http://localhost".into(), oracle_poll_seconds: 600,
        },
        default_min_diff: 1.0,
        logging: LoggingConfig { level: "off".into(), allow: vec![], deny: vec![] },
        control_plane_dir: std::env::temp_dir(),
    }
}

async fn read_json_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Value {
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a line from the proxy")
        .unwrap();
    serde_json::from_str(line.trim()).expect("proxy sent malformed JSON")
}

/// S1 + S2: handshake with equal weights (handshake pool = A on the tie),
/// then a first submit routes to A and its response comes back downstream.
#[tokio::test]
async fn handshake_and_first_submit_route_to_a() {
    let (host_a, port_a) = spawn_mock_pool("jobA", 10.0).await;
    let (host_b, port_b) = spawn_mock_pool("jobB", 20.0).await;
    let config = Arc::new(mk_config(host_a, port_a, host_b, port_b));
    let metrics = Arc::new(Metrics::new().unwrap());

    let proxy_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = proxy_listener.local_addr().unwrap();
    let session_config = config.clone();
    let session_metrics = metrics.clone();
    tokio::spawn(async move {
        let (socket, _) = proxy_listener.accept().await.unwrap();
        run_session(socket, session_config, session_metrics).await;
    });

    let miner_stream = TcpStream::connect(proxy_addr).await.unwrap();
    let (miner_read, mut miner_write) = miner_stream.into_split();
    let mut miner_reader = BufReader::new(miner_read);

    let subscribe = json!({"id": 1, "method": "mining.subscribe", "params": ["miner/1.0"]});
    miner_write.write_all(format!("{subscribe}\n").as_bytes()).await.unwrap();

    let raw_subscribe_response = read_json_line(&mut miner_reader).await;
    assert_eq!(raw_subscribe_response["id"], json!(1));
    assert!(raw_subscribe_response.get("jsonrpc").is_none());

    let authorize = json!({"id": 2, "method": "mining.authorize", "params": ["wA.w1", "x"]});
    miner_write.write_all(format!("{authorize}\n").as_bytes()).await.unwrap();

    let authorize_response = read_json_line(&mut miner_reader).await;
    assert_eq!(authorize_response["id"], json!(2));
    assert_eq!(authorize_response["result"], json!(true));

    // Next two lines: a set_difficulty and a clean mining.notify, in order.
    let diff_msg = read_json_line(&mut miner_reader).await;
    assert_eq!(diff_msg["method"], json!("mining.set_difficulty"));
    assert!(diff_msg.get("jsonrpc").is_none());
    assert!(diff_msg.get("id").is_none());

    let notify_msg = read_json_line(&mut miner_reader).await;
    assert_eq!(notify_msg["method"], json!("mining.notify"));
    let params = notify_msg["params"].as_array().unwrap();
    assert_eq!(params[0], json!("jobA"));
    assert_eq!(params[8], json!(true));

    // S2: submit a share against jobA; it should route to A and the
    // accepted response should come back downstream.
    let submit = json!({
        "id": 10, "method": "mining.submit",
        "params": ["wA.w1", "jobA", "00000000", "5f000000", "deadbeef"]
    });
    miner_write.write_all(format!("{submit}\n").as_bytes()).await.unwrap();

    let submit_response = read_json_line(&mut miner_reader).await;
    assert_eq!(submit_response["id"], json!(10));
    assert_eq!(submit_response["result"], json!(true));
}
