//! JSON-RPC 2.0 message model
//!
//! A single [`Message`] type covers everything that crosses the wire. Parsing
//! classifies a raw body by which members are present; a `null` result is
//! kept distinct from an absent one.

use crate::lsp::jsonrpc_utils::JSONRPC_VERSION;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ============================================================================
// JSON-RPC Types
// ============================================================================

/// Request identifier
///
/// This client only ever generates numeric ids, but servers may use strings
/// for their own requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(id) => write!(f, "{id}"),
            RequestId::String(id) => write!(f, "\"{id}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    /// Error code
    pub code: i32,

    /// Error message
    pub message: String,

    /// Optional additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// Request (expects a response)
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

/// Response to an earlier request
///
/// `id` is `None` only for errors the peer could not attribute to a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: Option<RequestId>,
    pub outcome: Result<Value, ResponseError>,
}

/// Notification (no response expected)
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Any JSON-RPC 2.0 message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Error produced when a body is not a valid JSON-RPC message
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid JSON-RPC message: {0}")]
    Invalid(String),
}

// ============================================================================
// Parsing
// ============================================================================

/// Wire shape used for classification
#[derive(Deserialize)]
struct RawMessage {
    #[serde(default, deserialize_with = "deserialize_some")]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, deserialize_with = "deserialize_some")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ResponseError>,
}

/// Maps a present member to `Some` even when its value is `null`
fn deserialize_some<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

fn parse_id(id: Value) -> Result<Option<RequestId>, MessageError> {
    match id {
        Value::Null => Ok(None),
        other => serde_json::from_value(other)
            .map(Some)
            .map_err(|_| MessageError::Invalid("id must be a number or string".to_string())),
    }
}

impl Message {
    /// Parse one message body
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let raw: RawMessage = serde_json::from_str(body)?;

        match (raw.method, raw.id) {
            (Some(method), Some(id)) => {
                let id = parse_id(id)?
                    .ok_or_else(|| MessageError::Invalid("request id is null".to_string()))?;
                Ok(Message::Request(Request {
                    id,
                    method,
                    params: raw.params,
                }))
            }
            (Some(method), None) => Ok(Message::Notification(Notification {
                method,
                params: raw.params,
            })),
            (None, Some(id)) => {
                let outcome = match (raw.error, raw.result) {
                    (Some(error), _) => Err(error),
                    (None, Some(result)) => Ok(result),
                    // Some servers omit `result` for void responses
                    (None, None) => Ok(Value::Null),
                };
                Ok(Message::Response(Response {
                    id: parse_id(id)?,
                    outcome,
                }))
            }
            (None, None) => Err(MessageError::Invalid(
                "message has neither method nor id".to_string(),
            )),
        }
    }

    /// Serialize into a wire body
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let mut object = Map::new();
        object.insert("jsonrpc".to_string(), Value::from(JSONRPC_VERSION));

        match self {
            Message::Request(request) => {
                object.insert("id".to_string(), serde_json::to_value(&request.id)?);
                object.insert("method".to_string(), Value::from(request.method.as_str()));
                if let Some(params) = &request.params {
                    object.insert("params".to_string(), params.clone());
                }
            }
            Message::Response(response) => {
                object.insert("id".to_string(), serde_json::to_value(&response.id)?);
                match &response.outcome {
                    Ok(result) => {
                        object.insert("result".to_string(), result.clone());
                    }
                    Err(error) => {
                        object.insert("error".to_string(), serde_json::to_value(error)?);
                    }
                }
            }
            Message::Notification(notification) => {
                object.insert(
                    "method".to_string(),
                    Value::from(notification.method.as_str()),
                );
                if let Some(params) = &notification.params {
                    object.insert("params".to_string(), params.clone());
                }
            }
        }

        serde_json::to_string(&Value::Object(object))
    }

    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(request) => Some(&request.method),
            Message::Notification(notification) => Some(&notification.method),
            Message::Response(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_with_string_id() {
        let message =
            Message::parse(r#"{"jsonrpc":"2.0","id":"abc","method":"workspace/configuration","params":{"items":[]}}"#)
                .unwrap();

        match message {
            Message::Request(request) => {
                assert_eq!(request.id, RequestId::String("abc".to_string()));
                assert_eq!(request.method, "workspace/configuration");
                assert_eq!(request.params, Some(json!({"items": []})));
            }
            other => panic!("Expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_null_result_is_distinct_from_error() {
        let message = Message::parse(r#"{"jsonrpc":"2.0","id":4,"result":null}"#).unwrap();
        assert_eq!(
            message,
            Message::Response(Response {
                id: Some(RequestId::Number(4)),
                outcome: Ok(Value::Null),
            })
        );

        let message = Message::parse(
            r#"{"jsonrpc":"2.0","id":5,"error":{"code":-32601,"message":"nope"}}"#,
        )
        .unwrap();
        match message {
            Message::Response(Response {
                outcome: Err(error),
                ..
            }) => {
                assert_eq!(error.code, -32601);
                assert_eq!(error.message, "nope");
                assert!(error.data.is_none());
            }
            other => panic!("Expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_notification() {
        let message = Message::parse(r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#)
            .unwrap();
        assert_eq!(message.method(), Some("initialized"));
        assert!(matches!(message, Message::Notification(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Message::parse("not json"),
            Err(MessageError::Json(_))
        ));
        assert!(matches!(
            Message::parse(r#"{"jsonrpc":"2.0"}"#),
            Err(MessageError::Invalid(_))
        ));
        assert!(matches!(
            Message::parse(r#"{"jsonrpc":"2.0","id":{"nested":true},"result":1}"#),
            Err(MessageError::Invalid(_))
        ));
    }

    #[test]
    fn test_request_serialization_omits_missing_params() {
        let body = Message::Request(Request {
            id: RequestId::Number(1),
            method: "shutdown".to_string(),
            params: None,
        })
        .to_json()
        .unwrap();

        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 1, "method": "shutdown"}));
    }

    #[test]
    fn test_error_response_serialization() {
        let body = Message::Response(Response {
            id: Some(RequestId::String("x".to_string())),
            outcome: Err(ResponseError::new(-32601, "Method not found")),
        })
        .to_json()
        .unwrap();

        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "id": "x",
                "error": {"code": -32601, "message": "Method not found"}
            })
        );
    }
}
