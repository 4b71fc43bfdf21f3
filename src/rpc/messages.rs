//! JSON-RPC 2.0 Message Types
//!
//! One JSON object per line. Three shapes travel in both directions:
//!
//! - request: `{"jsonrpc":"2.0","id":1,"method":"run","params":{...}}`
//! - response: `{"jsonrpc":"2.0","id":1,"result":...}` or `...,"error":{code,message,data?}}`
//! - notification: `{"jsonrpc":"2.0","method":"progress","params":{...}}`

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const JSONRPC_VERSION: &str = "2.0";

/// Wire error object
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("RPC error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// A run is already active
    pub const RUN_ACTIVE: i64 = -32000;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl std::fmt::Display) -> Self {
        Self::new(Self::INVALID_PARAMS, format!("Invalid params: {}", message))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Value,
        result: Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Superset of all three shapes, used for both decoding and encoding
#[derive(Debug, Default, Serialize, Deserialize)]
struct Envelope {
    #[serde(default)]
    jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

/// Why a line could not be decoded
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not a JSON-RPC message")]
    Shape,
}

impl Message {
    pub fn request(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id: Value::from(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response(id: Value, result: Result<Value, RpcError>) -> Self {
        Message::Response { id, result }
    }

    /// Decode one line.
    ///
    /// A message with a method is a request when it has a non-null id and a
    /// notification otherwise. A message without a method but with an id is
    /// a response; a missing `result` reads as `null`.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let envelope: Envelope = serde_json::from_str(line)?;
        let id = envelope.id.filter(|id| !id.is_null());

        match (envelope.method, id) {
            (Some(method), Some(id)) => Ok(Message::Request {
                id,
                method,
                params: envelope.params,
            }),
            (Some(method), None) => Ok(Message::Notification {
                method,
                params: envelope.params,
            }),
            (None, Some(id)) => {
                let result = match envelope.error {
                    Some(error) => Err(error),
                    None => Ok(envelope.result.unwrap_or(Value::Null)),
                };
                Ok(Message::Response { id, result })
            }
            (None, None) => Err(DecodeError::Shape),
        }
    }

    /// Encode as one line, without the trailing newline
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let mut envelope = Envelope {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            ..Default::default()
        };

        match self {
            Message::Request { id, method, params } => {
                envelope.id = Some(id.clone());
                envelope.method = Some(method.clone());
                envelope.params = params.clone();
            }
            Message::Response { id, result } => {
                envelope.id = Some(id.clone());
                match result {
                    Ok(value) => envelope.result = Some(value.clone()),
                    Err(error) => envelope.error = Some(error.clone()),
                }
            }
            Message::Notification { method, params } => {
                envelope.method = Some(method.clone());
                envelope.params = params.clone();
            }
        }

        serde_json::to_string(&envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_request() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","id":42,"method":"run","params":{"a":1}}"#).unwrap();
        assert_eq!(msg, Message::Request {
            id: json!(42),
            method: "run".to_string(),
            params: Some(json!({"a": 1})),
        });
    }

    #[test]
    fn test_decode_notification_with_null_id() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","id":null,"method":"log"}"#).unwrap();
        assert_eq!(msg, Message::notification("log", None));
    }

    #[test]
    fn test_decode_response_without_result() {
        let msg = Message::decode(r#"{"jsonrpc":"2.0","id":7}"#).unwrap();
        assert_eq!(msg, Message::response(json!(7), Ok(Value::Null)));
    }

    #[test]
    fn test_decode_error_response() {
        let msg = Message::decode(
            r#"{"jsonrpc":"2.0","id":"x","error":{"code":-32601,"message":"Method not found: nope"}}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            Message::response(json!("x"), Err(RpcError::method_not_found("nope")))
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Message::decode("not json"), Err(DecodeError::Json(_))));
        assert!(matches!(Message::decode(r#"{"jsonrpc":"2.0"}"#), Err(DecodeError::Shape)));
    }

    #[test]
    fn test_encode_null_result_is_kept() {
        let line = Message::response(json!(1), Ok(Value::Null)).encode().unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","id":1,"result":null}"#);
    }

    #[test]
    fn test_encode_notification_has_no_id() {
        let line = Message::notification("ready", Some(json!({"version": "1.0"})))
            .encode()
            .unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","method":"ready","params":{"version":"1.0"}}"#);
    }
}
