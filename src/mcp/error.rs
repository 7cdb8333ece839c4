use thiserror::Error;

/// Errors surfaced by the MCP connection layer.
///
/// Registry and facade operations never let these escape as panics; they are
/// folded into [`super::OperationResult`] / [`super::McpResponse`] at the boundary.
#[derive(Debug, Error)]
pub enum McpError {
    /// The configuration names a transport the adapter layer does not implement.
    #[error("unsupported transport kind: {0}")]
    UnsupportedTransportKind(String),

    /// The transport parameters do not match the declared transport kind.
    #[error("invalid server configuration: {0}")]
    Config(String),

    /// Transport construction or handshake failed.
    #[error("failed to connect to MCP server '{server}': {message}")]
    ConnectFailure { server: String, message: String },

    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    #[error("MCP server '{0}' is not connected")]
    ServerNotConnected(String),

    /// The remote answered with a JSON-RPC error object.
    #[error("MCP protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("MCP {operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// Channel-level failure (EOF, HTTP status, malformed frame).
    #[error("MCP transport error: {0}")]
    Transport(String),

    /// The model requested a function that no aggregated tool maps to.
    #[error("unknown function name: {0}")]
    UnknownFunctionName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    pub fn connect_failure(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectFailure {
            server: server.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            secs,
        }
    }

    /// Whether this error means the session can no longer be trusted.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Lower an arbitrary error chain into an `McpError`, keeping typed variants intact.
impl From<anyhow::Error> for McpError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<McpError>() {
            Ok(mcp) => mcp,
            Err(other) => Self::Transport(format!("{other:#}")),
        }
    }
}
