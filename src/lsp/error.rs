//! Error taxonomy of the runtime and its mapping onto JSON-RPC error objects.

use crate::lsp::types::{RequestId, ResponseError};
use std::time::Duration;
use thiserror::Error;

/// Reserved JSON-RPC / LSP error codes.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const SERVER_NOT_INITIALIZED: i32 = -32002;
    pub const UNKNOWN_ERROR_CODE: i32 = -32001;
    pub const REQUEST_FAILED: i32 = -32803;
    pub const SERVER_CANCELLED: i32 = -32802;
    pub const CONTENT_MODIFIED: i32 = -32801;
    pub const REQUEST_CANCELLED: i32 = -32800;
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("transport closed")]
    Closed,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("i/o error: {0}")]
    Io(String),
    #[error("malformed frame: {0}")]
    Framing(String),
    #[error("unparsable message: {0}")]
    Parse(String),
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        TransportError::Io(value.to_string())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CorrelationError {
    #[error("request {id} ({method}) timed out after {}ms", .after.as_millis())]
    Timeout {
        id: RequestId,
        method: String,
        after: Duration,
    },
    #[error("request {id} was cancelled")]
    Cancelled { id: RequestId },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("response for unknown request id {0}")]
    UnknownId(RequestId),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("method '{method}' requires capability '{path}' which is not declared")]
    Unsupported { method: String, path: String },
    #[error("method '{method}' has no known capability mapping")]
    UnknownMethod { method: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProtocolError {
    #[error("'{method}' received before initialization completed")]
    NotInitialized { method: String },
    #[error("initialize may only be sent once")]
    AlreadyInitialized,
    #[error("'{method}' received after shutdown")]
    ShutDown { method: String },
    #[error("invalid lifecycle transition: {0}")]
    InvalidState(String),
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Umbrella error returned by peer operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("remote error: {0}")]
    Remote(ResponseError),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("handler failed: {0}")]
    Handler(String),
    #[error("middleware failed: {0}")]
    Middleware(String),
}

impl RpcError {
    pub fn handler(message: impl Into<String>) -> Self {
        RpcError::Handler(message.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RpcError::Correlation(CorrelationError::Timeout { .. }))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            RpcError::Correlation(CorrelationError::Cancelled { .. })
        )
    }

    pub fn code(&self) -> i32 {
        match self {
            RpcError::Transport(TransportError::Parse(_)) => codes::PARSE_ERROR,
            RpcError::Transport(_) => codes::INTERNAL_ERROR,
            RpcError::Correlation(CorrelationError::Cancelled { .. }) => codes::REQUEST_CANCELLED,
            RpcError::Correlation(_) => codes::REQUEST_FAILED,
            RpcError::Capability(_) => codes::METHOD_NOT_FOUND,
            RpcError::Protocol(ProtocolError::NotInitialized { .. }) => {
                codes::SERVER_NOT_INITIALIZED
            }
            RpcError::Protocol(_) => codes::INVALID_REQUEST,
            RpcError::Remote(error) => error.code,
            RpcError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            RpcError::InvalidParams(_) => codes::INVALID_PARAMS,
            RpcError::Handler(_) | RpcError::Middleware(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Wire-level rendering used when a local failure answers a remote request.
    pub fn to_response_error(&self) -> ResponseError {
        match self {
            RpcError::Remote(error) => error.clone(),
            other => ResponseError::new(other.code(), other.to_string()),
        }
    }
}

impl From<ResponseError> for RpcError {
    fn from(value: ResponseError) -> Self {
        RpcError::Remote(value)
    }
}
