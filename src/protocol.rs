//! JSON-RPC wire shapes and line-level sanitization for Stratum v1.
//!
//! Framing itself (newline-delimited reads/writes) lives on `pool::PoolLink`
//! and the miner connection handling in `session::supervisor`; this module
//! holds the pure, synchronous transformations so they're unit-testable
//! without a socket.

use serde_json::{json, Value};

pub const MINING_CONFIGURE: &str = "mining.configure";
pub const MINING_SUBSCRIBE: &str = "mining.subscribe";
pub const MINING_AUTHORIZE: &str = "mining.authorize";
pub const MINING_SUBMIT: &str = "mining.submit";
pub const MINING_NOTIFY: &str = "mining.notify";
pub const MINING_SET_DIFFICULTY: &str = "mining.set_difficulty";
pub const MINING_SET_EXTRANONCE: &str = "mining.set_extranonce";
pub const CLIENT_RECONNECT: &str = "client.reconnect";
pub const MINING_SET_VERSION_MASK: &str = "mining.set_version_mask";

/// A parsed JSON-RPC line, classified by the presence/absence of `method`
/// and `id` rather than by any tagged type (mirrors the duck-typing the
/// source relies on; see SPEC_FULL.md §9).
#[derive(Debug, Clone)]
pub enum Classified {
    /// Has `method`, no meaningful response shape (a notification/request).
    Notification { method: String, params: Vec<Value> },
    /// Has `id`, no `method` (a JSON-RPC response).
    Response { id: Value, raw: Value },
}

pub fn classify(raw: &Value) -> Option<Classified> {
    let obj = raw.as_object()?;
    if let Some(method) = obj.get("method").and_then(Value::as_str) {
        let params = obj
            .get("params")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        return Some(Classified::Notification {
            method: method.to_string(),
            params,
        });
    }
    if let Some(id) = obj.get("id") {
        if !id.is_null() {
            return Some(Classified::Response {
                id: id.clone(),
                raw: raw.clone(),
            });
        }
    }
    None
}

/// Strip `jsonrpc`/`id` from a server→client notification before it is sent
/// to the miner. Mandatory: some miner firmware disconnects if these fields
/// are present on a notification (SPEC_FULL.md §4.1).
pub fn sanitize_notification(msg: &Value) -> Value {
    let Some(obj) = msg.as_object() else {
        return msg.clone();
    };
    if obj.get("method").map(Value::is_null).unwrap_or(true) {
        return msg.clone();
    }
    let mut m = obj.clone();
    m.remove("jsonrpc");
    m.remove("id");
    Value::Object(m)
}

/// Inject `"error": null` into an outbound response that has a non-null
/// `id` and a `result` but no `error` field. Required by some pools
/// (SPEC_FULL.md §4.1 / §6).
pub fn inject_null_error(msg: &Value) -> Value {
    let Some(obj) = msg.as_object() else {
        return msg.clone();
    };
    let has_id = obj.get("id").map(|v| !v.is_null()).unwrap_or(false);
    let has_result = obj.contains_key("result");
    let has_error = obj.contains_key("error");
    if has_id && has_result && !has_error {
        let mut m = obj.clone();
        m.insert("error".to_string(), Value::Null);
        return Value::Object(m);
    }
    msg.clone()
}

/// Build a `mining.notify` payload with `clean_jobs` (the 9th param, 0-indexed 8)
/// forced to `true`, padding with `null` if the cached array is shorter.
pub fn force_clean_notify(mut params: Vec<Value>) -> Vec<Value> {
    while params.len() < 9 {
        params.push(Value::Null);
    }
    params[8] = json!(true);
    params
}

/// Build the outbound `mining.notify` JSON-RPC object the miner receives.
pub fn build_notification(method: &str, params: Vec<Value>) -> Value {
    json!({ "method": method, "params": params })
}

/// Build a JSON-RPC request with an explicit numeric id.
pub fn build_request(id: u64, method: &str, params: Vec<Value>) -> Value {
    json!({ "id": id, "method": method, "params": params })
}

/// Build a JSON-RPC request reusing an arbitrary (miner-supplied) id value.
pub fn build_request_with_id(id: Value, method: &str, params: Vec<Value>) -> Value {
    json!({ "id": id, "method": method, "params": params })
}

/// Extract the job id from a `mining.notify` params array (first element).
pub fn jobid_from_notify_params(params: &[Value]) -> Option<String> {
    params.first().and_then(Value::as_str).map(str::to_string)
}

/// Extract the job id from a `mining.submit` params array (second element,
/// per `[user, job_id, extranonce2, ntime, nonce, versionbits?]`).
pub fn jobid_from_submit_params(params: &[Value]) -> Option<String> {
    params.get(1).and_then(Value::as_str).map(str::to_string)
}

/// Derive the worker name from a miner `authorize` username: the rightmost
/// `.`-separated token, or `"unknown"` for an empty input.
pub fn extract_worker_name(user: &str) -> String {
    let u = user.trim();
    if u.is_empty() {
        return "unknown".to_string();
    }
    match u.rsplit_once('.') {
        Some((_, last)) if !last.trim().is_empty() => last.trim().to_string(),
        _ => u.to_string(),
    }
}
