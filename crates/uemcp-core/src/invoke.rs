use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;

/// One downstream tool call as issued by the catalog and pass-through layers.
#[derive(Debug, Clone, Default)]
pub struct ToolCallSpec {
    pub tool: String,
    pub params: Map<String, Value>,
    pub context: Map<String, Value>,
    pub timeout_ms: Option<u64>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    /// When set, a `status == "error"` envelope is turned into
    /// [`BridgeError::ToolExecution`](crate::BridgeError::ToolExecution)
    /// instead of being returned.
    pub raise_on_error: bool,
}

impl ToolCallSpec {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            raise_on_error: true,
            ..Self::default()
        }
    }
}

/// A downstream envelope reduced to the fields callers act on.
#[derive(Debug, Clone)]
pub struct ToolCallResult {
    pub ok: bool,
    pub status: String,
    pub request_id: String,
    pub result: Map<String, Value>,
    pub diagnostics: Map<String, Value>,
    pub raw_envelope: Value,
}

impl ToolCallResult {
    /// True when any diagnostics error entry carries `retriable: true`.
    pub fn has_retriable_error(&self) -> bool {
        let Some(errors) = self.diagnostics.get("errors").and_then(Value::as_array) else {
            return false;
        };
        errors.iter().any(|entry| {
            entry
                .get("retriable")
                .and_then(Value::as_bool)
                .unwrap_or(false)
        })
    }

    /// First `code: message` pair out of diagnostics errors, for retry logs.
    pub fn first_error_summary(&self) -> String {
        if let Some(errors) = self.diagnostics.get("errors").and_then(Value::as_array) {
            for entry in errors {
                let code = entry.get("code").and_then(Value::as_str).unwrap_or("");
                let message = entry.get("message").and_then(Value::as_str).unwrap_or("");
                if !code.is_empty() || !message.is_empty() {
                    return format!("{code}: {message}");
                }
            }
        }
        "retryable tool error".to_string()
    }
}

/// Seam between the service layer and the live transport, so catalog and
/// pass-through logic can run against a fake peer in tests.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call_tool(&self, spec: ToolCallSpec) -> Result<ToolCallResult>;
}
