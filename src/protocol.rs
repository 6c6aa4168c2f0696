//! Wire types exchanged over an execution session
//!
//! Inbound: exactly one [`Request`]. Outbound: zero or more output messages
//! followed by exactly one exit message whose `data` is itself a JSON
//! encoded [`ExecutionOutcome`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Exit code reported when the program could not be run at all
pub const FAILURE_EXIT_CODE: i32 = -1;

/// Request received from the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub version: String,
    pub code: String,
    /// Auxiliary files keyed by path relative to the workspace
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    /// Requested timeout in milliseconds
    #[serde(default)]
    pub timeout: i64,
}

/// Message sent to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Raw terminal output, chunked however the reads happened to return it
    Output(String),
    /// Encoded [`ExecutionOutcome`], always the last message
    Exit(String),
}

impl StreamMessage {
    pub fn exit(outcome: &ExecutionOutcome) -> Self {
        Self::Exit(outcome.encode())
    }
}

/// Terminal result of one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    #[serde(rename = "msg", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ExecutionOutcome {
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            exit_code: FAILURE_EXIT_CODE,
            message: Some(message.into()),
        }
    }

    fn encode(&self) -> String {
        let mut data = serde_json::json!({ "exit_code": self.exit_code });
        if let Some(msg) = &self.message {
            data["msg"] = serde_json::Value::String(msg.clone());
        }
        data.to_string()
    }
}

/// Clamp a requested timeout to `[0, max]`; anything outside becomes `max`
pub fn clamp_timeout(requested_ms: i64, max_ms: u64) -> Duration {
    let ms = match u64::try_from(requested_ms) {
        Ok(ms) if ms <= max_ms => ms,
        _ => max_ms,
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: Request = serde_json::from_str(r#"{"version":"v1","code":"print ok"}"#).unwrap();
        assert_eq!(req.version, "v1");
        assert!(req.files.is_empty());
        assert_eq!(req.timeout, 0);
    }

    #[test]
    fn test_output_message_shape() {
        let msg = serde_json::to_value(StreamMessage::Output("ok\n".into())).unwrap();
        assert_eq!(msg, serde_json::json!({"type": "output", "data": "ok\n"}));
    }

    #[test]
    fn test_exit_message_data_is_encoded_json() {
        let msg = StreamMessage::exit(&ExecutionOutcome::exited(0));
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "exit");
        assert_eq!(value["data"], r#"{"exit_code":0}"#);

        let failed = StreamMessage::exit(&ExecutionOutcome::failed("boom"));
        let StreamMessage::Exit(data) = failed else {
            panic!("expected exit message");
        };
        let outcome: ExecutionOutcome = serde_json::from_str(&data).unwrap();
        assert_eq!(outcome.exit_code, FAILURE_EXIT_CODE);
        assert_eq!(outcome.message.as_deref(), Some("boom"));
    }

    #[test]
    fn test_clamp_timeout() {
        assert_eq!(clamp_timeout(1000, 30_000), Duration::from_millis(1000));
        assert_eq!(clamp_timeout(-5, 30_000), Duration::from_millis(30_000));
        assert_eq!(clamp_timeout(90_000, 30_000), Duration::from_millis(30_000));
        assert_eq!(clamp_timeout(0, 30_000), Duration::ZERO);
        assert_eq!(clamp_timeout(30_000, 30_000), Duration::from_millis(30_000));
    }
}
