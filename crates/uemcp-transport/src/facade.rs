use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use uemcp_core::{BridgeError, Result, ToolCallResult, ToolCallSpec, ToolInvoker};

use crate::broker::ToolRequest;
use crate::transport::UeWsTransport;

/// Thin façade over the transport: stamps the runtime session id and reduces
/// response envelopes to [`ToolCallResult`]s.
pub struct McpFacade {
    transport: Arc<UeWsTransport>,
    session_id: String,
}

impl McpFacade {
    pub fn new(transport: Arc<UeWsTransport>, session_id: Option<String>) -> Self {
        Self {
            transport,
            session_id: session_id.unwrap_or_else(build_runtime_session_id),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[async_trait]
impl ToolInvoker for McpFacade {
    async fn call_tool(&self, spec: ToolCallSpec) -> Result<ToolCallResult> {
        let request = ToolRequest {
            tool: spec.tool.clone(),
            params: spec.params,
            context: spec.context,
            timeout_ms: spec.timeout_ms,
            request_id: spec.request_id,
            session_id: spec.session_id.or_else(|| Some(self.session_id.clone())),
        };
        let response = self.transport.request(request).await?;

        let envelope = response.envelope;
        let status = envelope
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("error")
            .to_string();
        let result = envelope
            .get("result")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let diagnostics = envelope
            .get("diagnostics")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let call_result = ToolCallResult {
            ok: response.ok,
            status,
            request_id: response.request_id,
            result,
            diagnostics,
            raw_envelope: envelope,
        };

        if spec.raise_on_error && (call_result.status == "error" || !call_result.ok) {
            return Err(BridgeError::ToolExecution {
                tool: spec.tool,
                request_id: call_result.request_id,
                status: call_result.status,
            });
        }
        Ok(call_result)
    }
}

fn build_runtime_session_id() -> String {
    let host = std::env::var("HOSTNAME")
        .unwrap_or_else(|_| "localhost".to_string())
        .replace('|', "-");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "mcp-server:{host}:{pid}:{short}",
        pid = std::process::id(),
        short = &suffix[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_has_the_expected_shape() {
        let session_id = build_runtime_session_id();
        let parts: Vec<&str> = session_id.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "mcp-server");
        assert_eq!(parts[3].len(), 8);
    }
}
