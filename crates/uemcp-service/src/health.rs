use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use uemcp_core::metrics::now_ms;
use uemcp_core::{Result, ToolCallSpec, ToolInvoker};

#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub captured_at_ms: i64,
    pub ok: bool,
    pub latency_ms: u64,
    pub payload: Map<String, Value>,
}

/// One-shot `system.health` probe against the connected peer.
pub struct HealthProbe {
    invoker: Arc<dyn ToolInvoker>,
}

impl HealthProbe {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }

    pub async fn check_once(&self) -> Result<HealthSnapshot> {
        let started = Instant::now();
        let response = self.invoker.call_tool(ToolCallSpec::new("system.health")).await?;
        Ok(HealthSnapshot {
            captured_at_ms: now_ms(),
            ok: response.ok,
            latency_ms: started.elapsed().as_millis() as u64,
            payload: response.result,
        })
    }
}
