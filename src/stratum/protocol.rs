//! Stratum message types.
//!
//! One line per message, each line a JSON-RPC 2.0 object. The pool layers
//! its own numeric error codes on top of the JSON-RPC conventions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    /// Request id; null for notifications.
    #[serde(default)]
    pub id: Value,

    pub method: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,

    pub id: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: StratumError) -> Self {
        Self {
            jsonrpc: Some("2.0".to_string()),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Server-to-client notification (no id).
pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "id": Value::Null,
        "method": method,
        "params": params,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl StratumError {
    /// Stale, duplicate and malformed shares share one code.
    pub const INVALID_SHARE: i32 = -1;
    pub const JOB_NOT_FOUND: i32 = -2;
    pub const OTHER: i32 = 20;
    pub const LOW_DIFFICULTY: i32 = 23;
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;
    pub const PARSE_ERROR: i32 = -32700;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn stale_share() -> Self {
        Self::new(Self::INVALID_SHARE, "stale share")
    }

    pub fn duplicate_share() -> Self {
        Self::new(Self::INVALID_SHARE, "duplicate share")
    }

    pub fn low_difficulty(actual: f64) -> Self {
        Self::new(
            Self::LOW_DIFFICULTY,
            format!("low difficulty share ({})", actual),
        )
    }

    pub fn job_not_found() -> Self {
        Self::new(Self::JOB_NOT_FOUND, "job not found")
    }

    pub fn unauthorized() -> Self {
        Self::new(Self::UNAUTHORIZED, "unauthorized worker")
    }

    pub fn not_subscribed() -> Self {
        Self::new(Self::NOT_SUBSCRIBED, "not subscribed")
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(Self::OTHER, message)
    }

    pub fn parse_error() -> Self {
        Self::new(Self::PARSE_ERROR, "parse error")
    }
}

impl std::fmt::Display for StratumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let line = r#"{"id":1,"method":"mining.subscribe","params":["miner/1.0"]}"#;
        let req: StratumRequest = serde_json::from_str(line).unwrap();
        assert_eq!(req.method, "mining.subscribe");
        assert_eq!(req.id, serde_json::json!(1));
    }

    #[test]
    fn notification_id_is_null() {
        let req: StratumRequest =
            serde_json::from_str(r#"{"method":"mining.ping"}"#).unwrap();
        assert!(req.id.is_null());
    }

    #[test]
    fn error_response_shape() {
        let resp = StratumResponse::failure(serde_json::json!(7), StratumError::stale_share());
        let text = serde_json::to_string(&resp).unwrap();
        assert!(text.contains(r#""code":-1"#));
        assert!(text.contains("stale share"));
        assert!(!text.contains(r#""result""#));
    }

    #[test]
    fn low_difficulty_message_carries_ratio() {
        let err = StratumError::low_difficulty(500.0);
        assert_eq!(err.message, "low difficulty share (500)");
    }
}
