use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use uemcp_core::{BridgeError, Result, ToolCallResult, ToolCallSpec, ToolInvoker};
use uemcp_transport::events::{EventRouter, NormalizedEvent, NotificationKind};

use crate::catalog::ToolCatalog;
use crate::passthrough::{PassThroughService, PassThroughSettings, ToolCall};

fn ok_result(request_id: &str) -> ToolCallResult {
    ToolCallResult {
        ok: true,
        status: "ok".into(),
        request_id: request_id.into(),
        result: Map::new(),
        diagnostics: json!({"errors": []}).as_object().cloned().unwrap(),
        raw_envelope: Value::Null,
    }
}

fn error_result(request_id: &str, retriable: bool) -> ToolCallResult {
    ToolCallResult {
        ok: false,
        status: "error".into(),
        request_id: request_id.into(),
        result: Map::new(),
        diagnostics: json!({
            "errors": [{"code": "UE.BUSY", "message": "editor busy", "retriable": retriable}]
        })
        .as_object()
        .cloned()
        .unwrap(),
        raw_envelope: Value::Null,
    }
}

fn default_tool(name: &str, enabled: bool) -> Value {
    json!({
        "name": name,
        "domain": "system",
        "version": "1.0.0",
        "enabled": enabled,
        "write": false,
        "params_schema": {"type": "object"},
        "result_schema": {"type": "object"},
    })
}

struct FakeInvoker {
    calls: StdMutex<Vec<ToolCallSpec>>,
    queued: StdMutex<VecDeque<Result<ToolCallResult>>>,
    schema_hash: StdMutex<String>,
    tools: StdMutex<Vec<Value>>,
    events: StdMutex<Option<Arc<EventRouter>>>,
}

impl FakeInvoker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: StdMutex::new(Vec::new()),
            queued: StdMutex::new(VecDeque::new()),
            schema_hash: StdMutex::new("hash-001".into()),
            tools: StdMutex::new(vec![default_tool("system.health", true)]),
            events: StdMutex::new(None),
        })
    }

    fn queue(&self, outcome: Result<ToolCallResult>) {
        self.queued.lock().unwrap().push_back(outcome);
    }

    fn set_schema_hash(&self, hash: &str) {
        *self.schema_hash.lock().unwrap() = hash.into();
    }

    fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock().unwrap() = tools;
    }

    fn attach_events(&self, events: Arc<EventRouter>) {
        *self.events.lock().unwrap() = Some(events);
    }

    fn tool_calls(&self) -> Vec<ToolCallSpec> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.tool != "tools.list")
            .cloned()
            .collect()
    }

    fn tools_list_calls(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.tool == "tools.list")
            .count()
    }
}

#[async_trait]
impl ToolInvoker for FakeInvoker {
    async fn call_tool(&self, spec: ToolCallSpec) -> Result<ToolCallResult> {
        self.calls.lock().unwrap().push(spec.clone());

        if spec.tool == "tools.list" {
            let mut result = Map::new();
            result.insert("protocol_version".into(), json!("unreal-mcp/1.0"));
            result.insert("schema_hash".into(), json!(*self.schema_hash.lock().unwrap()));
            result.insert(
                "capabilities".into(),
                json!(["core_tools_v1", "umg_widget_event_k2_v1"]),
            );
            result.insert("tools".into(), json!(*self.tools.lock().unwrap()));
            let mut response = ok_result("req-tools-list");
            response.result = result;
            return Ok(response);
        }

        if let Some(events) = self.events.lock().unwrap().clone() {
            events.publish(&json!({
                "event_id": "evt-1",
                "event_type": "event.progress",
                "request_id": spec.request_id.clone().unwrap_or_default(),
                "timestamp_ms": 1,
                "payload": {"percent": 50, "phase": "A"},
            }));
        }

        if let Some(outcome) = self.queued.lock().unwrap().pop_front() {
            return outcome;
        }
        Ok(ok_result(spec.request_id.as_deref().unwrap_or("req-default")))
    }
}

fn test_settings() -> PassThroughSettings {
    PassThroughSettings {
        refresh_interval_ms: 0,
        backoff_initial_ms: 1,
        backoff_max_ms: 5,
        ..PassThroughSettings::default()
    }
}

fn build_service(
    invoker: Arc<FakeInvoker>,
    settings: PassThroughSettings,
) -> (Arc<PassThroughService>, Arc<EventRouter>) {
    let events = Arc::new(EventRouter::new(None));
    let catalog = Arc::new(ToolCatalog::new());
    let service = Arc::new(PassThroughService::new(
        invoker,
        catalog,
        events.clone(),
        settings,
        None,
    ));
    (service, events)
}

#[tokio::test]
async fn start_refreshes_the_catalog() {
    let invoker = FakeInvoker::new();
    let (service, _events) = build_service(invoker.clone(), test_settings());

    service.start().await.unwrap();
    assert_eq!(invoker.tools_list_calls(), 1);
    assert_eq!(service.list_tools().len(), 1);
    assert_eq!(service.schema_hash(), "hash-001");
    assert!(service.has_capability("umg_widget_event_k2_v1"));
    assert!(service.last_refresh_ms() > 0);
    service.stop().await;
}

#[tokio::test]
async fn unknown_tool_refreshes_once_then_errors() {
    let invoker = FakeInvoker::new();
    let (service, _events) = build_service(invoker.clone(), test_settings());

    let err = service
        .call_tool(ToolCall::new("missing.tool"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnknownTool(_)));
    assert_eq!(invoker.tools_list_calls(), 1);
    assert!(invoker.tool_calls().is_empty());
}

#[tokio::test]
async fn disabled_tools_are_rejected() {
    let invoker = FakeInvoker::new();
    invoker.set_tools(vec![default_tool("umg.widget.add", false)]);
    let (service, _events) = build_service(invoker.clone(), test_settings());
    service.refresh_catalog().await.unwrap();

    let err = service
        .call_tool(ToolCall::new("umg.widget.add"))
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::ToolDisabled(_)));
    assert!(invoker.tool_calls().is_empty());
}

#[tokio::test]
async fn retryable_tool_error_retries_with_suffixed_request_id() {
    let invoker = FakeInvoker::new();
    invoker.queue(Ok(error_result("req-abc", true)));
    invoker.queue(Ok(ok_result("req-abc-r2")));
    let (service, _events) = build_service(invoker.clone(), test_settings());
    service.refresh_catalog().await.unwrap();

    let mut call = ToolCall::new("system.health");
    call.request_id = Some("req-abc".into());
    let result = service.call_tool(call).await.unwrap();
    assert_eq!(result.status, "ok");

    let attempts = invoker.tool_calls();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].request_id.as_deref(), Some("req-abc"));
    assert_eq!(attempts[1].request_id.as_deref(), Some("req-abc-r2"));
}

#[tokio::test]
async fn transient_exceptions_are_retried() {
    let invoker = FakeInvoker::new();
    invoker.queue(Err(BridgeError::RequestTimeout {
        request_id: "req-1".into(),
        tool: "system.health".into(),
        timeout_ms: 10,
    }));
    let (service, _events) = build_service(invoker.clone(), test_settings());
    service.refresh_catalog().await.unwrap();

    let mut call = ToolCall::new("system.health");
    call.request_id = Some("req-1".into());
    let result = service.call_tool(call).await.unwrap();
    assert_eq!(result.status, "ok");
    assert_eq!(invoker.tool_calls().len(), 2);
}

#[tokio::test]
async fn non_retriable_error_results_are_returned_as_is() {
    let invoker = FakeInvoker::new();
    invoker.queue(Ok(error_result("req-1", false)));
    let (service, _events) = build_service(invoker.clone(), test_settings());
    service.refresh_catalog().await.unwrap();

    let result = service.call_tool(ToolCall::new("system.health")).await.unwrap();
    assert_eq!(result.status, "error");
    assert_eq!(invoker.tool_calls().len(), 1);
}

#[tokio::test]
async fn worst_case_produces_exactly_max_attempts_calls() {
    let invoker = FakeInvoker::new();
    invoker.queue(Ok(error_result("req-worst", true)));
    invoker.queue(Ok(error_result("req-worst-r2", true)));
    let (service, _events) = build_service(invoker.clone(), test_settings());
    service.refresh_catalog().await.unwrap();

    let mut call = ToolCall::new("system.health");
    call.request_id = Some("req-worst".into());
    let result = service.call_tool(call).await.unwrap();
    assert_eq!(result.status, "error");
    assert_eq!(invoker.tool_calls().len(), 2);
}

#[tokio::test]
async fn allow_retry_false_makes_a_single_attempt() {
    let invoker = FakeInvoker::new();
    invoker.queue(Ok(error_result("req-once", true)));
    let (service, _events) = build_service(invoker.clone(), test_settings());
    service.refresh_catalog().await.unwrap();

    let mut call = ToolCall::new("system.health");
    call.allow_retry = false;
    let result = service.call_tool(call).await.unwrap();
    assert_eq!(result.status, "error");
    assert_eq!(invoker.tool_calls().len(), 1);
}

#[tokio::test]
async fn non_transient_exception_propagates_immediately() {
    let invoker = FakeInvoker::new();
    invoker.queue(Err(BridgeError::Broker("duplicate".into())));
    let (service, _events) = build_service(invoker.clone(), test_settings());
    service.refresh_catalog().await.unwrap();

    let err = service.call_tool(ToolCall::new("system.health")).await.unwrap_err();
    assert!(matches!(err, BridgeError::Broker(_)));
    assert_eq!(invoker.tool_calls().len(), 1);
}

#[tokio::test]
async fn guard_rejects_missing_required_tools() {
    let invoker = FakeInvoker::new();
    let settings = PassThroughSettings {
        required_tools: vec!["umg.widget.add".into()],
        ..test_settings()
    };
    let (service, _events) = build_service(invoker, settings);

    let err = service.start().await.unwrap_err();
    assert!(matches!(err, BridgeError::CatalogGuard(_)));
    assert!(err.to_string().contains("umg.widget.add"));
}

#[tokio::test]
async fn guard_compares_pinned_hash_case_insensitively() {
    let invoker = FakeInvoker::new();
    let settings = PassThroughSettings {
        pin_schema_hash: "HASH-001".into(),
        ..test_settings()
    };
    let (service, _events) = build_service(invoker.clone(), settings);
    service.refresh_catalog().await.unwrap();

    let settings = PassThroughSettings {
        pin_schema_hash: "HASH-XYZ".into(),
        ..test_settings()
    };
    let (mismatched, _events) = build_service(invoker, settings);
    let err = mismatched.refresh_catalog().await.unwrap_err();
    assert!(matches!(err, BridgeError::CatalogGuard(_)));
    assert!(err.to_string().contains("schema_hash mismatch"));
}

#[tokio::test]
async fn guard_detects_schema_drift_from_the_baseline() {
    let invoker = FakeInvoker::new();
    let settings = PassThroughSettings {
        fail_on_schema_change: true,
        ..test_settings()
    };
    let (service, _events) = build_service(invoker.clone(), settings);

    service.refresh_catalog().await.unwrap();
    service.refresh_catalog().await.unwrap();

    invoker.set_schema_hash("hash-002");
    let err = service.refresh_catalog().await.unwrap_err();
    assert!(matches!(err, BridgeError::CatalogGuard(_)));
    assert!(err.to_string().contains("schema_hash changed"));
}

#[tokio::test]
async fn stream_delivers_events_then_result_and_closes_the_subscription() {
    let invoker = FakeInvoker::new();
    let (service, events) = build_service(invoker.clone(), test_settings());
    invoker.attach_events(events.clone());
    service.refresh_catalog().await.unwrap();

    let collected: Arc<StdMutex<Vec<NormalizedEvent>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = collected.clone();

    let mut call = ToolCall::new("system.health");
    call.request_id = Some("req-s".into());
    let result = service
        .call_tool_stream(
            call,
            move |event| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(event);
                }
            },
            Duration::from_millis(10),
        )
        .await
        .unwrap();

    assert_eq!(result.status, "ok");
    let seen = collected.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].notification_kind, NotificationKind::Progress);
    assert_eq!(seen[0].payload["phase"], "A");
    assert_eq!(seen[0].request_id, "req-s");
    drop(seen);

    assert_eq!(events.subscription_count(), 0);

    // Streamed calls never retry, so the attempt id is the original.
    let attempts = invoker.tool_calls();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].request_id.as_deref(), Some("req-s"));
}
