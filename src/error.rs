use thiserror::Error;

/// Error taxonomy for the proxy. Each variant maps to a distinct propagation
/// policy (see DESIGN.md / SPEC_FULL.md §7): decode errors are logged and
/// skipped, protocol-policy errors become a local reject sent to the miner,
/// upstream-transient errors drive failover, auth errors are forwarded as-is,
/// config errors disable the offending subsystem, and fatal errors abort the
/// process.
#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("malformed line: {0}")]
    Decode(String),

    #[error("protocol policy reject (code {code}): {message}")]
    ProtocolPolicy { code: i32, message: String },

    #[error("upstream transient error: {0}")]
    UpstreamTransient(String),

    #[error("upstream authorize rejected: {0}")]
    UpstreamAuth(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal error: {0}")]
    Fatal(String),
}

impl ProxyError {
    /// Job not found / pool unavailable (code 21).
    pub fn job_not_found(message: impl Into<String>) -> Self {
        ProxyError::ProtocolPolicy {
            code: 21,
            message: message.into(),
        }
    }

    /// Duplicate share (code 22).
    pub fn duplicate_share() -> Self {
        ProxyError::ProtocolPolicy {
            code: 22,
            message: "duplicate share".into(),
        }
    }

    /// Stale extranonce context (code 23).
    pub fn stale_extranonce_context() -> Self {
        ProxyError::ProtocolPolicy {
            code: 23,
            message: "stale extranonce context".into(),
        }
    }

    /// Render this policy error as the `{result:false, error:{...}}` shape
    /// sent downstream. Panics if called on a non-`ProtocolPolicy` variant;
    /// callers only invoke this after matching that variant out.
    pub fn to_downstream_response(&self, id: serde_json::Value) -> serde_json::Value {
        match self {
            ProxyError::ProtocolPolicy { code, message } => serde_json::json!({
                "id": id,
                "result": false,
                "error": { "code": code, "message": message, "data": null },
            }),
            other => panic!("to_downstream_response called on non-policy error: {other}"),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::UpstreamTransient(err.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_response_shape() {
        let err = ProxyError::job_not_found("job not found");
        let resp = err.to_downstream_response(serde_json::json!(10));
        assert_eq!(resp["result"], serde_json::json!(false));
        assert_eq!(resp["error"]["code"], serde_json::json!(21));
        assert_eq!(resp["error"]["data"], serde_json::Value::Null);
    }

    #[test]
    fn duplicate_share_code_is_22() {
        match ProxyError::duplicate_share() {
            ProxyError::ProtocolPolicy { code, .. } => assert_eq!(code, 22),
            _ => panic!("wrong variant"),
        }
    }
}
