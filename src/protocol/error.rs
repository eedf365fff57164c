use serde_json::json;
use thiserror::Error;

use crate::gateway::error::GatewayError;
use crate::protocol::types::JsonRpcError;

#[derive(Debug, Error)]
pub enum McpError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Operation not permitted: {0}")]
    OperationNotPermitted(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl McpError {
    pub fn code(&self) -> i32 {
        match self {
            McpError::ParseError(_) => -32700,
            McpError::MethodNotFound(_) => -32601,
            McpError::InvalidParams(_) => -32602,
            McpError::InternalError(_) => -32603,
            McpError::ResourceNotFound(_) => 1,
            McpError::ToolNotFound(_) => 2,
            McpError::RateLimitExceeded => 6,
            McpError::OperationNotPermitted(_) => 8,
            McpError::Gateway(e) => e.kind().code(),
        }
    }

    pub fn to_json_rpc_error(&self) -> JsonRpcError {
        let message = match self {
            McpError::ParseError(msg)
            | McpError::MethodNotFound(msg)
            | McpError::InvalidParams(msg)
            | McpError::InternalError(msg) => msg.clone(),
            other => other.to_string(),
        };
        let data = match self {
            McpError::Gateway(e) => Some(json!({ "kind": e.kind() })),
            _ => None,
        };

        JsonRpcError {
            code: self.code(),
            message,
            data,
        }
    }
}

impl From<std::io::Error> for McpError {
    fn from(error: std::io::Error) -> Self {
        McpError::InternalError(error.to_string())
    }
}

impl From<serde_json::Error> for McpError {
    fn from(error: serde_json::Error) -> Self {
        McpError::ParseError(error.to_string())
    }
}
