use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use uemcp_core::{BridgeError, Result, RuntimeMetrics, ToolCallResult, ToolCallSpec, ToolInvoker};
use uemcp_service::ToolCatalog;
use uemcp_service::passthrough::{PassThroughService, PassThroughSettings};
use uemcp_transport::EventRouter;

use crate::dispatch::RequestDispatcher;

struct FakeInvoker {
    calls: StdMutex<Vec<ToolCallSpec>>,
    queued: StdMutex<VecDeque<Result<ToolCallResult>>>,
}

impl FakeInvoker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: StdMutex::new(Vec::new()),
            queued: StdMutex::new(VecDeque::new()),
        })
    }

    fn queue(&self, outcome: Result<ToolCallResult>) {
        self.queued.lock().unwrap().push_back(outcome);
    }

    fn recorded_request_ids(&self) -> Vec<Option<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.tool != "tools.list")
            .map(|spec| spec.request_id.clone())
            .collect()
    }
}

#[async_trait]
impl ToolInvoker for FakeInvoker {
    async fn call_tool(&self, spec: ToolCallSpec) -> Result<ToolCallResult> {
        self.calls.lock().unwrap().push(spec.clone());

        if spec.tool == "tools.list" {
            let result = json!({
                "protocol_version": "unreal-mcp/1.0",
                "schema_hash": "hash-001",
                "capabilities": ["core_tools_v1", "umg_widget_event_k2_v1"],
                "tools": [
                    {
                        "name": "system.health",
                        "domain": "system",
                        "version": "1.0.0",
                        "enabled": true,
                        "write": false,
                        "params_schema": {"type": "object"},
                        "result_schema": {"type": "object"},
                    },
                    {
                        "name": "umg.widget.add",
                        "domain": "umg",
                        "version": "1.2.0",
                        "enabled": true,
                        "write": true,
                        "params_schema": {"type": "object"},
                    },
                ],
            });
            return Ok(ToolCallResult {
                ok: true,
                status: "ok".into(),
                request_id: "req-tools-list".into(),
                result: result.as_object().cloned().unwrap(),
                diagnostics: Map::new(),
                raw_envelope: Value::Null,
            });
        }

        if let Some(outcome) = self.queued.lock().unwrap().pop_front() {
            return outcome;
        }
        Ok(ToolCallResult {
            ok: true,
            status: "ok".into(),
            request_id: spec.request_id.clone().unwrap_or_else(|| "req-x".into()),
            result: Map::new(),
            diagnostics: json!({"errors": []}).as_object().cloned().unwrap(),
            raw_envelope: Value::Null,
        })
    }
}

async fn build_dispatcher() -> (Arc<RequestDispatcher>, Arc<FakeInvoker>) {
    let invoker = FakeInvoker::new();
    let events = Arc::new(EventRouter::new(None::<Arc<RuntimeMetrics>>));
    let catalog = Arc::new(ToolCatalog::new());
    let settings = PassThroughSettings {
        refresh_interval_ms: 0,
        ..PassThroughSettings::default()
    };
    let pass_through = Arc::new(PassThroughService::new(
        invoker.clone(),
        catalog,
        events,
        settings,
        None,
    ));
    pass_through.refresh_catalog().await.unwrap();
    (Arc::new(RequestDispatcher::new(pass_through)), invoker)
}

fn request(id: Value, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

async fn initialize(dispatcher: &RequestDispatcher) {
    let response = dispatcher
        .handle_request(&request(json!(0), "initialize", json!({})))
        .await;
    assert!(response.get("error").is_none());
}

#[tokio::test]
async fn requests_before_initialize_are_rejected() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    let response = dispatcher
        .handle_request(&request(json!(1), "tools/list", json!({})))
        .await;
    assert_eq!(response["error"]["code"], -32002);
}

#[tokio::test]
async fn initialize_reports_capabilities_and_echoes_the_protocol_version() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    let response = dispatcher
        .handle_request(&request(
            json!(1),
            "initialize",
            json!({"protocolVersion": "2024-11-05"}),
        ))
        .await;

    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["capabilities"]["tools"]["listChanged"], false);
    assert_eq!(result["serverInfo"]["name"], "ue-mcp-bridge");

    // Missing version falls back to the server default.
    let response = dispatcher
        .handle_request(&request(json!(2), "initialize", json!({})))
        .await;
    assert_eq!(response["result"]["protocolVersion"], "2025-03-26");
}

#[tokio::test]
async fn ping_returns_an_empty_object() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;
    let response = dispatcher
        .handle_request(&request(json!(1), "ping", json!({})))
        .await;
    assert_eq!(response["result"], json!({}));
}

#[tokio::test]
async fn tools_list_merges_catalog_and_virtual_tools() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;

    let response = dispatcher
        .handle_request(&request(json!(1), "tools/list", json!({})))
        .await;
    let tools = response["result"]["tools"].as_array().unwrap();
    let names: Vec<&str> = tools
        .iter()
        .map(|tool| tool["name"].as_str().unwrap())
        .collect();

    assert!(names.contains(&"system.health"));
    assert!(names.contains(&"umg.widget.add"));
    assert!(names.contains(&"umg.workflow.compose"));
    assert!(names.contains(&"seq.workflow.compose"));

    let health = tools
        .iter()
        .find(|tool| tool["name"] == "system.health")
        .unwrap();
    assert_eq!(health["annotations"]["readOnlyHint"], true);
    assert_eq!(health["description"], "[system] version=1.0.0 write=false");
    assert!(health.get("outputSchema").is_some());

    let widget_add = tools
        .iter()
        .find(|tool| tool["name"] == "umg.widget.add")
        .unwrap();
    assert_eq!(widget_add["annotations"]["readOnlyHint"], false);
    assert!(widget_add.get("outputSchema").is_none());
}

#[tokio::test]
async fn tools_list_with_a_cursor_returns_an_empty_page() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;
    let response = dispatcher
        .handle_request(&request(json!(1), "tools/list", json!({"cursor": "next"})))
        .await;
    assert_eq!(response["result"]["tools"], json!([]));
}

#[tokio::test]
async fn tools_call_happy_path_builds_the_structured_reply() {
    let (dispatcher, invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;

    let response = dispatcher
        .handle_request(&request(
            json!(1),
            "tools/call",
            json!({"name": "system.health", "arguments": {}}),
        ))
        .await;

    let result = &response["result"];
    assert_eq!(result["isError"], false);
    let structured = &result["structuredContent"];
    assert_eq!(structured["ok"], true);
    assert_eq!(structured["status"], "ok");
    assert_eq!(structured["request_id"], "mcp-1");
    assert_eq!(structured["result"], json!({}));
    assert_eq!(structured["diagnostics"]["errors"], json!([]));

    // The text content is the structured payload serialized.
    let text = result["content"][0]["text"].as_str().unwrap();
    let reparsed: Value = serde_json::from_str(text).unwrap();
    assert_eq!(&reparsed, structured);

    assert_eq!(
        invoker.recorded_request_ids(),
        vec![Some("mcp-1".to_string())]
    );
}

#[tokio::test]
async fn unknown_tools_become_tool_not_found_payloads() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;

    let response = dispatcher
        .handle_request(&request(
            json!(7),
            "tools/call",
            json!({"name": "missing.tool", "arguments": {}}),
        ))
        .await;

    let result = &response["result"];
    assert_eq!(result["isError"], true);
    let error_entry = &result["structuredContent"]["diagnostics"]["errors"][0];
    assert_eq!(error_entry["code"], "MCP.SERVER.TOOL_NOT_FOUND");
    assert_eq!(error_entry["retriable"], false);
}

#[tokio::test]
async fn orchestrator_argument_errors_map_to_invalid_params() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;

    let response = dispatcher
        .handle_request(&request(
            json!(3),
            "tools/call",
            json!({"name": "umg.workflow.compose", "arguments": {"actions": []}}),
        ))
        .await;
    assert_eq!(response["error"]["code"], -32602);
}

#[tokio::test]
async fn transient_failures_are_reported_retriable() {
    let (dispatcher, invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;
    invoker.queue(Err(BridgeError::Connection("socket closed".into())));
    // The second attempt (passthrough retry) fails the same way.
    invoker.queue(Err(BridgeError::Connection("socket closed".into())));

    let response = dispatcher
        .handle_request(&request(
            json!(4),
            "tools/call",
            json!({"name": "system.health", "arguments": {}}),
        ))
        .await;

    let result = &response["result"];
    assert_eq!(result["isError"], true);
    let error_entry = &result["structuredContent"]["diagnostics"]["errors"][0];
    assert_eq!(error_entry["code"], "MCP.SERVER.INTERNAL");
    assert_eq!(error_entry["retriable"], true);
}

#[tokio::test]
async fn malformed_tools_call_params_are_invalid_params() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;

    let no_name = dispatcher
        .handle_request(&request(json!(1), "tools/call", json!({})))
        .await;
    assert_eq!(no_name["error"]["code"], -32602);

    let bad_arguments = dispatcher
        .handle_request(&request(
            json!(2),
            "tools/call",
            json!({"name": "system.health", "arguments": [1, 2]}),
        ))
        .await;
    assert_eq!(bad_arguments["error"]["code"], -32602);

    let bad_params = dispatcher
        .handle_request(&json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": "nope"
        }))
        .await;
    assert_eq!(bad_params["error"]["code"], -32602);
}

#[tokio::test]
async fn unknown_methods_and_stub_listings() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    initialize(&dispatcher).await;

    let unknown = dispatcher
        .handle_request(&request(json!(1), "sampling/create", json!({})))
        .await;
    assert_eq!(unknown["error"]["code"], -32601);

    let resources = dispatcher
        .handle_request(&request(json!(2), "resources/list", json!({})))
        .await;
    assert_eq!(resources["result"]["resources"], json!([]));

    let templates = dispatcher
        .handle_request(&request(json!(3), "resources/templates/list", json!({})))
        .await;
    assert_eq!(templates["result"]["resourceTemplates"], json!([]));

    let prompts = dispatcher
        .handle_request(&request(json!(4), "prompts/list", json!({})))
        .await;
    assert_eq!(prompts["result"]["prompts"], json!([]));
}

#[tokio::test]
async fn notifications_do_not_panic() {
    let (dispatcher, _invoker) = build_dispatcher().await;
    dispatcher.handle_notification(&json!({
        "jsonrpc": "2.0",
        "method": "notifications/initialized",
    }));
}
