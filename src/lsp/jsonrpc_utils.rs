//! JSON-RPC 2.0 protocol utilities
//!
//! Provides constants and response builders for JSON-RPC 2.0 as per
//! https://www.jsonrpc.org/specification, plus the LSP-reserved error codes.

use crate::lsp::protocol::{Message, RequestId, Response, ResponseError};
use serde_json::Value;

// ============================================================================
// JSON-RPC 2.0 Constants
// ============================================================================

/// JSON-RPC 2.0 version identifier
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC 2.0 and LSP error codes
/// https://www.jsonrpc.org/specification#error_object
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    /// LSP: server received a request before `initialize`
    pub const SERVER_NOT_INITIALIZED: i32 = -32002;
    /// LSP: request failed but the server is otherwise healthy
    pub const REQUEST_FAILED: i32 = -32803;
    /// LSP: server cancelled the request
    pub const SERVER_CANCELLED: i32 = -32802;
    /// LSP: document changed while the request was computed
    pub const CONTENT_MODIFIED: i32 = -32801;
    /// LSP: client cancelled the request
    pub const REQUEST_CANCELLED: i32 = -32800;
}

// ============================================================================
// JSON-RPC Response Builders
// ============================================================================

/// Create a successful JSON-RPC response
pub fn success_response(id: RequestId, result: Value) -> Message {
    Message::Response(Response {
        id: Some(id),
        outcome: Ok(result),
    })
}

/// Create a JSON-RPC error response
pub fn error_response(id: RequestId, error: ResponseError) -> Message {
    Message::Response(Response {
        id: Some(id),
        outcome: Err(error),
    })
}

/// Create a null success response (for requests that return void)
pub fn null_success_response(id: RequestId) -> Message {
    success_response(id, Value::Null)
}

/// Human-readable name of a well-known error code
pub fn error_code_name(code: i32) -> Option<&'static str> {
    use error_codes::*;
    match code {
        PARSE_ERROR => Some("ParseError"),
        INVALID_REQUEST => Some("InvalidRequest"),
        METHOD_NOT_FOUND => Some("MethodNotFound"),
        INVALID_PARAMS => Some("InvalidParams"),
        INTERNAL_ERROR => Some("InternalError"),
        SERVER_NOT_INITIALIZED => Some("ServerNotInitialized"),
        REQUEST_FAILED => Some("RequestFailed"),
        SERVER_CANCELLED => Some("ServerCancelled"),
        CONTENT_MODIFIED => Some("ContentModified"),
        REQUEST_CANCELLED => Some("RequestCancelled"),
        _ => None,
    }
}
