//! Error types for mcp-relay

use serde::{Deserialize, Serialize};

/// Standard JSON-RPC error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    /// Invalid JSON was received
    ParseError = -32700,
    /// The JSON sent is not a valid Request object
    InvalidRequest = -32600,
    /// The method does not exist / is not available
    MethodNotFound = -32601,
    /// Invalid method parameter(s)
    InvalidParams = -32602,
    /// Internal JSON-RPC error
    InternalError = -32603,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Method not found: {}", method),
        )
    }

    /// Unknown tool name on `tools/call`. Shares the method-not-found code.
    pub fn tool_not_found(name: &str) -> Self {
        Self::new(ErrorCode::MethodNotFound, format!("Tool not found: {}", name))
    }

    /// Unknown URI on `resources/read`. Also method-not-found; the `data`
    /// member names the URI, and a failed read is `-32603` instead.
    pub fn resource_not_found(uri: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Resource not found: {}", uri),
        )
        .with_data(serde_json::json!({ "uri": uri }))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

/// mcp-relay error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("JSON-RPC error: {0:?}")]
    JsonRpc(JsonRpcError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Tool error: {0}")]
    Tool(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("A tool named '{0}' is already registered")]
    DuplicateTool(String),

    #[error("A resource with URI '{0}' is already registered")]
    DuplicateResource(String),

    #[error("Invalid tool name: {0}")]
    InvalidToolName(String),

    #[error("Invalid resource URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Client state error: {0}")]
    ClientState(String),

    #[error("Session '{0}' not found")]
    SessionNotFound(String),

    #[error("Backplane error: {0}")]
    Backplane(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a tool error from any displayable message
    pub fn tool(message: impl Into<String>) -> Self {
        Error::Tool(message.into())
    }

    /// Create a resource error from any displayable message
    pub fn resource(message: impl Into<String>) -> Self {
        Error::Resource(message.into())
    }

    /// Map this error onto the JSON-RPC error sent back to the client.
    ///
    /// JSON-RPC errors keep their code; handler failures become internal errors
    /// carrying the handler's own message.
    pub fn into_jsonrpc(self) -> JsonRpcError {
        match self {
            Error::JsonRpc(err) => err,
            Error::Serialization(e) => JsonRpcError::invalid_params(e.to_string()),
            Error::Tool(msg) | Error::Resource(msg) => JsonRpcError::internal_error(msg),
            e => JsonRpcError::internal_error(e.to_string()),
        }
    }
}

impl From<JsonRpcError> for Error {
    fn from(err: JsonRpcError) -> Self {
        Error::JsonRpc(err)
    }
}

/// Result type alias for mcp-relay
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used at the binary boundary
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_errors_keep_message() {
        let err = Error::tool("disk on fire").into_jsonrpc();
        assert_eq!(err.code, ErrorCode::InternalError.code());
        assert_eq!(err.message, "disk on fire");
    }

    #[test]
    fn test_jsonrpc_errors_keep_code() {
        let err = Error::JsonRpc(JsonRpcError::tool_not_found("nope")).into_jsonrpc();
        assert_eq!(err.code, -32601);
    }

    #[test]
    fn test_resource_not_found_is_method_not_found() {
        let err = JsonRpcError::resource_not_found("file:///missing");
        assert_eq!(err.code, -32601);
        assert_ne!(err.code, ErrorCode::InternalError.code());
        assert_eq!(err.data.unwrap()["uri"], "file:///missing");
    }
}
