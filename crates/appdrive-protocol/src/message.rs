use crate::status::Status;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command written to the proxy socket, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    pub id: String,
    pub payload: String,
}

/// Structured result of a single command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub value: Value,
}

impl CommandResponse {
    pub fn success(value: Value) -> Self {
        Self {
            status: Status::SUCCESS,
            value,
        }
    }

    pub fn error(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            value: Value::String(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The value as a string slice, if it is one
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// A response line read back from the proxy socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyReply {
    pub id: String,
    #[serde(flatten)]
    pub response: CommandResponse,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reply_parses_flattened_response() {
        let line = r#"{"id":"abc","status":7,"value":"no element"}"#;
        let reply: ProxyReply = serde_json::from_str(line).unwrap();
        assert_eq!(reply.id, "abc");
        assert_eq!(reply.response.status, Status::NO_SUCH_ELEMENT);
        assert_eq!(reply.response.value_str(), Some("no element"));
    }

    #[test]
    fn test_reply_defaults_missing_fields() {
        let reply: ProxyReply = serde_json::from_str(r#"{"id":"x"}"#).unwrap();
        assert!(reply.response.is_success());
        assert_eq!(reply.response.value, json!(null));
    }
}
