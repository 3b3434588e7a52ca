pub type Result<T> = std::result::Result<T, BridgeError>;

/// Unified error taxonomy for the bridge.
///
/// Variants map one-to-one onto process exit codes (see [`BridgeError::exit_code`])
/// and onto the `retriable` flag surfaced in MCP diagnostics
/// (see [`BridgeError::is_transient`]).
#[derive(thiserror::Error, Debug, Clone)]
pub enum BridgeError {
    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("{0}")]
    EndpointSelection(String),

    #[error("Failed to connect to {url} within {timeout_ms}ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool is disabled: {0}")]
    ToolDisabled(String),

    #[error("Catalog guard failed: {0}")]
    CatalogGuard(String),

    #[error("Request timed out: request_id={request_id}, tool={tool}, timeout_ms={timeout_ms}")]
    RequestTimeout {
        request_id: String,
        tool: String,
        timeout_ms: u64,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request broker error: {0}")]
    Broker(String),

    #[error("Message parse error: {0}")]
    MessageParse(String),

    #[error("Tool execution failed: tool={tool}, request_id={request_id}, status={status}")]
    ToolExecution {
        tool: String,
        request_id: String,
        status: String,
    },
}

impl BridgeError {
    /// True for failures that a retry against the same peer may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::RequestTimeout { .. } | Self::Connection(_)
        )
    }

    /// Stable short name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Argument(_) => "Argument",
            Self::Config(_) => "Config",
            Self::EndpointSelection(_) => "EndpointSelection",
            Self::ConnectTimeout { .. } => "ConnectTimeout",
            Self::UnknownTool(_) => "UnknownTool",
            Self::ToolDisabled(_) => "ToolDisabled",
            Self::CatalogGuard(_) => "CatalogGuard",
            Self::RequestTimeout { .. } => "RequestTimeout",
            Self::Connection(_) => "Connection",
            Self::Broker(_) => "Broker",
            Self::MessageParse(_) => "MessageParse",
            Self::ToolExecution { .. } => "ToolExecution",
        }
    }

    /// Process exit code for one-shot front-end modes.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Argument(_) | Self::Config(_) | Self::EndpointSelection(_) => 2,
            Self::ConnectTimeout { .. } => 3,
            Self::UnknownTool(_) | Self::ToolDisabled(_) | Self::CatalogGuard(_) => 4,
            Self::ToolExecution { .. } => 5,
            _ => 6,
        }
    }
}
