use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value, json};
use tracing::{error, info};

use uemcp_core::BridgeError;
use uemcp_service::catalog::ToolDefinition;
use uemcp_service::passthrough::{PassThroughService, ToolCall};
use uemcp_service::{SequencerOrchestrator, UmgOrchestrator};

pub const JSONRPC_VERSION: &str = "2.0";
pub const DEFAULT_MCP_PROTOCOL_VERSION: &str = "2025-03-26";

pub const JSONRPC_PARSE_ERROR: i64 = -32700;
pub const JSONRPC_INVALID_REQUEST: i64 = -32600;
pub const JSONRPC_METHOD_NOT_FOUND: i64 = -32601;
pub const JSONRPC_INVALID_PARAMS: i64 = -32602;
pub const JSONRPC_SERVER_NOT_INITIALIZED: i64 = -32002;

pub fn make_jsonrpc_error(
    request_id: Option<Value>,
    code: i64,
    message: &str,
    data: Option<Value>,
) -> Value {
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": request_id.unwrap_or(Value::Null),
        "error": error,
    })
}

pub fn make_jsonrpc_result(request_id: Option<Value>, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": request_id.unwrap_or(Value::Null),
        "result": result,
    })
}

/// Routes JSON-RPC methods to the pass-through engine and the virtual-tool
/// orchestrators. Gated behind `initialize`.
pub struct RequestDispatcher {
    pass_through: Arc<PassThroughService>,
    umg: UmgOrchestrator,
    sequencer: SequencerOrchestrator,
    initialized: AtomicBool,
}

impl RequestDispatcher {
    pub fn new(pass_through: Arc<PassThroughService>) -> Self {
        Self {
            umg: UmgOrchestrator::new(pass_through.clone()),
            sequencer: SequencerOrchestrator::new(pass_through.clone()),
            pass_through,
            initialized: AtomicBool::new(false),
        }
    }

    pub fn handle_notification(&self, request: &Value) {
        if request.get("method").and_then(Value::as_str) == Some("notifications/initialized") {
            info!("MCP client initialized notification received.");
        }
    }

    pub async fn handle_request(&self, request: &Value) -> Value {
        let request_id = request.get("id").cloned();
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return make_jsonrpc_error(
                request_id,
                JSONRPC_INVALID_REQUEST,
                "Request method must be a string.",
                None,
            );
        };

        let params = match request.get("params") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(params)) => params.clone(),
            Some(_) => {
                return make_jsonrpc_error(
                    request_id,
                    JSONRPC_INVALID_PARAMS,
                    "Request params must be an object.",
                    None,
                );
            }
        };

        if method == "initialize" {
            return self.handle_initialize(request_id, &params);
        }
        if !self.initialized.load(Ordering::Acquire) {
            return make_jsonrpc_error(
                request_id,
                JSONRPC_SERVER_NOT_INITIALIZED,
                "Server not initialized. Call initialize first.",
                None,
            );
        }

        match method {
            "ping" => make_jsonrpc_result(request_id, json!({})),
            "tools/list" => make_jsonrpc_result(request_id, self.handle_tools_list(&params)),
            "tools/call" => self.handle_tools_call(request_id, &params).await,
            "resources/list" => make_jsonrpc_result(request_id, json!({"resources": []})),
            "resources/templates/list" => {
                make_jsonrpc_result(request_id, json!({"resourceTemplates": []}))
            }
            "prompts/list" => make_jsonrpc_result(request_id, json!({"prompts": []})),
            other => make_jsonrpc_error(
                request_id,
                JSONRPC_METHOD_NOT_FOUND,
                &format!("Method not found: {other}"),
                None,
            ),
        }
    }

    fn handle_initialize(&self, request_id: Option<Value>, params: &Map<String, Value>) -> Value {
        let protocol_version = params
            .get("protocolVersion")
            .and_then(Value::as_str)
            .filter(|version| !version.is_empty())
            .unwrap_or(DEFAULT_MCP_PROTOCOL_VERSION);

        self.initialized.store(true, Ordering::Release);
        make_jsonrpc_result(
            request_id,
            json!({
                "protocolVersion": protocol_version,
                "capabilities": {
                    "tools": {
                        "listChanged": false,
                    }
                },
                "serverInfo": {
                    "name": "ue-mcp-bridge",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    fn handle_tools_list(&self, params: &Map<String, Value>) -> Value {
        // No pagination: a non-empty cursor addresses a page past the end.
        match params.get("cursor") {
            None | Some(Value::Null) => {}
            Some(Value::String(cursor)) if cursor.is_empty() => {}
            Some(_) => return json!({"tools": []}),
        }

        let mut tools: Vec<Value> = self
            .pass_through
            .list_tools()
            .iter()
            .map(build_mcp_tool)
            .collect();
        tools.extend(self.umg.list_virtual_tools());
        tools.extend(self.sequencer.list_virtual_tools());
        json!({"tools": tools})
    }

    async fn handle_tools_call(
        &self,
        request_id: Option<Value>,
        params: &Map<String, Value>,
    ) -> Value {
        let Some(tool_name) = params
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
        else {
            return make_jsonrpc_error(
                request_id,
                JSONRPC_INVALID_PARAMS,
                "tools/call requires 'name' as non-empty string.",
                None,
            );
        };
        let arguments = match params.get("arguments") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(arguments)) => arguments.clone(),
            Some(_) => {
                return make_jsonrpc_error(
                    request_id,
                    JSONRPC_INVALID_PARAMS,
                    "tools/call 'arguments' must be an object.",
                    None,
                );
            }
        };

        let tool_request_id = request_id.as_ref().map(|id| match id {
            Value::String(id) => format!("mcp-{id}"),
            other => format!("mcp-{other}"),
        });

        let outcome = if self.umg.is_virtual_tool(tool_name) {
            self.umg
                .call_virtual_tool(tool_name, &arguments, tool_request_id.as_deref())
                .await
        } else if self.sequencer.is_virtual_tool(tool_name) {
            self.sequencer
                .call_virtual_tool(tool_name, &arguments, tool_request_id.as_deref())
                .await
        } else {
            let mut call = ToolCall::new(tool_name);
            call.params = arguments;
            call.request_id = tool_request_id.clone();
            self.pass_through.call_tool(call).await
        };

        let (is_error, structured_content) = match outcome {
            Ok(result) => {
                let is_error = result.status == "error" || !result.ok;
                let structured = json!({
                    "ok": result.ok,
                    "status": result.status,
                    "request_id": result.request_id,
                    "result": result.result,
                    "diagnostics": result.diagnostics,
                });
                (is_error, structured)
            }
            Err(error @ (BridgeError::UnknownTool(_) | BridgeError::ToolDisabled(_))) => (
                true,
                error_content(
                    tool_request_id.as_deref(),
                    "MCP.SERVER.TOOL_NOT_FOUND",
                    &error.to_string(),
                    false,
                ),
            ),
            Err(BridgeError::Argument(message)) => {
                return make_jsonrpc_error(request_id, JSONRPC_INVALID_PARAMS, &message, None);
            }
            Err(error) => {
                error!(tool = tool_name, %error, "tools/call failed");
                (
                    true,
                    error_content(
                        tool_request_id.as_deref(),
                        "MCP.SERVER.INTERNAL",
                        &error.to_string(),
                        error.is_transient(),
                    ),
                )
            }
        };

        let text = structured_content.to_string();
        make_jsonrpc_result(
            request_id,
            json!({
                "isError": is_error,
                "structuredContent": structured_content,
                "content": [
                    {
                        "type": "text",
                        "text": text,
                    }
                ],
            }),
        )
    }
}

fn error_content(request_id: Option<&str>, code: &str, message: &str, retriable: bool) -> Value {
    json!({
        "ok": false,
        "status": "error",
        "request_id": request_id.unwrap_or(""),
        "result": {},
        "diagnostics": {
            "errors": [
                {
                    "code": code,
                    "message": message,
                    "retriable": retriable,
                }
            ]
        },
    })
}

fn build_mcp_tool(tool: &ToolDefinition) -> Value {
    let mut object = json!({
        "name": tool.name,
        "description": format!("[{}] version={} write={}", tool.domain, tool.version, tool.write),
        "inputSchema": tool
            .params_schema
            .clone()
            .unwrap_or_else(|| json!({"type": "object", "additionalProperties": true})),
        "annotations": {
            "readOnlyHint": !tool.write,
        },
    });
    if let Some(result_schema) = &tool.result_schema {
        object["outputSchema"] = result_schema.clone();
    }
    object
}
