use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use tracing::warn;

use uemcp_core::messages::WIRE_PROTOCOL;
use uemcp_core::{BridgeError, Result, RuntimeMetrics, UeResponse, parse_mcp_response};

const DEFAULT_SESSION_ID: &str = "default-session";

/// One outgoing tool request, before the broker wraps it in an envelope.
#[derive(Debug, Clone, Default)]
pub struct ToolRequest {
    pub tool: String,
    pub params: Map<String, Value>,
    pub context: Map<String, Value>,
    pub timeout_ms: Option<u64>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            ..Self::default()
        }
    }
}

struct PendingRequest {
    tool: String,
    timeout_ms: u64,
    created_at: Instant,
    resolver: oneshot::Sender<Result<UeResponse>>,
}

/// Correlates in-flight requests to responses by `request_id`.
///
/// Every pending entry resolves exactly once: with the matching response,
/// with [`BridgeError::RequestTimeout`], or with the error handed to
/// [`RequestBroker::fail_all`] on disconnect.
pub struct RequestBroker {
    default_timeout_ms: u64,
    pending: Mutex<HashMap<String, PendingRequest>>,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl RequestBroker {
    pub fn new(default_timeout_ms: u64, metrics: Option<Arc<RuntimeMetrics>>) -> Self {
        assert!(default_timeout_ms > 0, "default_timeout_ms must be > 0");
        Self {
            default_timeout_ms,
            pending: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn default_timeout_ms(&self) -> u64 {
        self.default_timeout_ms
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("broker lock poisoned").len()
    }

    /// Send one request through `send_json` and await its response.
    ///
    /// `send_json` is invoked exactly once with the full wire object; if it
    /// fails, the pending entry is removed before the error surfaces.
    pub async fn send_request<F, Fut>(&self, send_json: F, request: ToolRequest) -> Result<UeResponse>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if request.tool.is_empty() {
            return Err(BridgeError::Broker("tool is required.".into()));
        }
        if let Some(metrics) = &self.metrics {
            metrics.inc("request_broker.request_started");
        }

        let timeout_ms = self.resolve_timeout_ms(request.timeout_ms, &request.context)?;
        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| format!("req-{}", uuid::Uuid::new_v4().simple()));

        let mut context = request.context.clone();
        context
            .entry("timeout_ms".to_string())
            .or_insert_with(|| json!(timeout_ms));

        let message = json!({
            "type": "mcp.request",
            "request": {
                "protocol": WIRE_PROTOCOL,
                "request_id": request_id.as_str(),
                "session_id": request.session_id.as_deref().unwrap_or(DEFAULT_SESSION_ID),
                "tool": request.tool.as_str(),
                "params": request.params,
                "context": context,
            },
        });

        let receiver = self.register_pending(&request_id, &request.tool, timeout_ms)?;

        if let Err(error) = send_json(message).await {
            self.remove_pending(&request_id);
            if let Some(metrics) = &self.metrics {
                metrics.inc("request_broker.send_failed");
            }
            return Err(error);
        }

        let response = match tokio::time::timeout(Duration::from_millis(timeout_ms), receiver).await
        {
            Err(_elapsed) => {
                self.remove_pending(&request_id);
                if let Some(metrics) = &self.metrics {
                    metrics.inc("request_broker.request_timeout");
                }
                return Err(BridgeError::RequestTimeout {
                    request_id,
                    tool: request.tool,
                    timeout_ms,
                });
            }
            Ok(Err(_dropped)) => {
                // Resolver dropped without a value; the entry is already gone.
                return Err(BridgeError::Connection(
                    "Request resolver dropped before completion.".into(),
                ));
            }
            Ok(Ok(result)) => result?,
        };

        if let Some(metrics) = &self.metrics {
            metrics.inc("request_broker.request_resolved");
        }
        Ok(response)
    }

    /// Route an incoming wire message; true when it completed a pending request.
    pub fn resolve_from_message(&self, message: &Value) -> Result<bool> {
        match parse_mcp_response(message)? {
            Some(response) => Ok(self.resolve_response(response)),
            None => Ok(false),
        }
    }

    pub fn resolve_response(&self, response: UeResponse) -> bool {
        let Some(pending) = self.remove_pending(&response.request_id) else {
            warn!(
                request_id = %response.request_id,
                "Received response for unknown request_id"
            );
            if let Some(metrics) = &self.metrics {
                metrics.inc("request_broker.unknown_response");
            }
            return false;
        };

        let _ = pending.resolver.send(Ok(response));
        if let Some(metrics) = &self.metrics {
            metrics.inc("request_broker.response_mapped");
        }
        true
    }

    /// Fail every outstanding request with `error`. Used on disconnect.
    pub fn fail_all(&self, error: BridgeError) {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().expect("broker lock poisoned");
            let drained = pending.drain().map(|(_, entry)| entry).collect();
            if let Some(metrics) = &self.metrics {
                metrics.set_gauge("request_broker.pending", 0.0);
            }
            drained
        };

        let count = drained.len();
        for entry in drained {
            tracing::debug!(
                tool = %entry.tool,
                timeout_ms = entry.timeout_ms,
                age_ms = entry.created_at.elapsed().as_millis() as u64,
                "Failing pending request"
            );
            let _ = entry.resolver.send(Err(error.clone()));
        }
        if count > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.inc_by("request_broker.fail_all", count as u64);
            }
        }
    }

    fn register_pending(
        &self,
        request_id: &str,
        tool: &str,
        timeout_ms: u64,
    ) -> Result<oneshot::Receiver<Result<UeResponse>>> {
        let (resolver, receiver) = oneshot::channel();
        let mut pending = self.pending.lock().expect("broker lock poisoned");
        if pending.contains_key(request_id) {
            return Err(BridgeError::Broker(format!(
                "Duplicate request_id: {request_id}"
            )));
        }
        pending.insert(
            request_id.to_string(),
            PendingRequest {
                tool: tool.to_string(),
                timeout_ms,
                created_at: Instant::now(),
                resolver,
            },
        );
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge("request_broker.pending", pending.len() as f64);
        }
        Ok(receiver)
    }

    fn remove_pending(&self, request_id: &str) -> Option<PendingRequest> {
        let mut pending = self.pending.lock().expect("broker lock poisoned");
        let removed = pending.remove(request_id);
        if let Some(metrics) = &self.metrics {
            metrics.set_gauge("request_broker.pending", pending.len() as f64);
        }
        removed
    }

    fn resolve_timeout_ms(
        &self,
        timeout_ms: Option<u64>,
        context: &Map<String, Value>,
    ) -> Result<u64> {
        if let Some(timeout_ms) = timeout_ms {
            if timeout_ms == 0 {
                return Err(BridgeError::Broker("timeout_ms must be > 0".into()));
            }
            return Ok(timeout_ms);
        }

        if let Some(value) = context.get("timeout_ms") {
            let context_timeout = value.as_u64().unwrap_or(0);
            if context_timeout == 0 {
                return Err(BridgeError::Broker("context.timeout_ms must be > 0".into()));
            }
            return Ok(context_timeout);
        }

        Ok(self.default_timeout_ms)
    }
}

impl std::fmt::Debug for RequestBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestBroker")
            .field("default_timeout_ms", &self.default_timeout_ms)
            .field("pending", &self.pending_count())
            .finish()
    }
}
