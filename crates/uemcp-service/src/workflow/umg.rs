use std::sync::Arc;

use serde_json::{Map, Value, json};

use uemcp_core::{BridgeError, Result, ToolCallResult};

use crate::passthrough::{ToolCall, ToolGateway};
use crate::workflow::{
    ResolvedAction, action_kind_and_args, actions_array, bool_arg, collect_touched_packages,
    inject_auto_save, step_failed_error, step_payload, step_request_id, workflow_result,
};

pub const UMG_VIRTUAL_TOOL: &str = "umg.workflow.compose";
const K2_EVENT_CAPABILITY: &str = "umg_widget_event_k2_v1";
const STEP_FAILED_CODE: &str = "MCP.SERVER.UMG_WORKFLOW_STEP_FAILED";

const COMPILE_AWARE_TOOLS: &[&str] = &[
    "umg.widget.add",
    "umg.widget.remove",
    "umg.widget.reparent",
    "umg.widget.patch",
    "umg.widget.patch.v2",
    "umg.slot.patch",
    "umg.slot.patch.v2",
    "umg.binding.set",
    "umg.binding.clear",
    "umg.widget.event.bind",
    "umg.widget.event.unbind",
    "umg.blueprint.patch",
];

const SAVE_AWARE_TOOLS: &[&str] = COMPILE_AWARE_TOOLS;

/// Composes UMG widget/binding/blueprint edits into one downstream sequence
/// with capability-aware fallback for K2 event binding.
pub struct UmgOrchestrator {
    gateway: Arc<dyn ToolGateway>,
}

impl UmgOrchestrator {
    pub fn new(gateway: Arc<dyn ToolGateway>) -> Self {
        Self { gateway }
    }

    pub fn is_virtual_tool(&self, tool_name: &str) -> bool {
        tool_name == UMG_VIRTUAL_TOOL
    }

    pub fn list_virtual_tools(&self) -> Vec<Value> {
        vec![json!({
            "name": UMG_VIRTUAL_TOOL,
            "description": "[umg] server-side orchestration helper. \
                Composes multiple UMG operations with capability-aware fallback.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "object_path": {"type": "string"},
                    "actions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "kind": {
                                    "type": "string",
                                    "enum": [
                                        "widget.add",
                                        "widget.remove",
                                        "widget.reparent",
                                        "widget.patch",
                                        "slot.patch",
                                        "widget.event.bind",
                                        "widget.event.unbind",
                                        "binding.set",
                                        "binding.clear",
                                        "blueprint.patch",
                                    ],
                                },
                                "args": {"type": "object"},
                            },
                            "required": ["kind", "args"],
                            "additionalProperties": false,
                        },
                    },
                    "prefer_v2": {"type": "boolean", "default": true},
                    "compile_on_finish": {"type": "boolean", "default": true},
                    "auto_save": {"type": "boolean", "default": false},
                    "continue_on_error": {"type": "boolean", "default": false},
                },
                "required": ["object_path", "actions"],
                "additionalProperties": false,
            },
            "annotations": {"readOnlyHint": false},
        })]
    }

    pub async fn call_virtual_tool(
        &self,
        tool_name: &str,
        arguments: &Map<String, Value>,
        request_id: Option<&str>,
    ) -> Result<ToolCallResult> {
        if tool_name != UMG_VIRTUAL_TOOL {
            return Err(BridgeError::UnknownTool(format!(
                "Unknown virtual tool: {tool_name}"
            )));
        }

        let object_path = arguments
            .get("object_path")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .ok_or_else(|| {
                BridgeError::Argument(format!(
                    "{UMG_VIRTUAL_TOOL} requires non-empty string 'object_path'."
                ))
            })?;

        let actions = actions_array(arguments, UMG_VIRTUAL_TOOL)?;
        let prefer_v2 = bool_arg(arguments, "prefer_v2", true);
        let compile_on_finish = bool_arg(arguments, "compile_on_finish", true);
        let auto_save = bool_arg(arguments, "auto_save", false);
        let continue_on_error = bool_arg(arguments, "continue_on_error", false);

        // Resolve every action up front so malformed input never reaches a
        // downstream call.
        let mut resolved_actions = Vec::with_capacity(actions.len());
        for action in actions {
            resolved_actions.push(self.resolve_action(object_path, action, prefer_v2)?);
        }

        let mut steps: Vec<Value> = Vec::new();
        let mut errors: Vec<Value> = Vec::new();
        let mut touched_packages: Vec<String> = Vec::new();

        for (index, resolved) in resolved_actions.iter().enumerate() {
            let mut params = resolved.params.clone();
            let is_last_action = index == resolved_actions.len() - 1;

            if COMPILE_AWARE_TOOLS.contains(&resolved.delegated_tool.as_str()) {
                params.insert(
                    "compile_on_success".into(),
                    json!(compile_on_finish && is_last_action),
                );
            }
            if auto_save && SAVE_AWARE_TOOLS.contains(&resolved.delegated_tool.as_str()) {
                inject_auto_save(&mut params);
            }

            let mut call = ToolCall::new(resolved.delegated_tool.clone());
            call.params = params;
            call.request_id = step_request_id(request_id, index);
            let result = self.gateway.call_tool(call).await?;

            let step = step_payload(index, resolved, &result);
            let step_ok = step["ok"].as_bool().unwrap_or(false);
            collect_touched_packages(&result, &mut touched_packages);
            steps.push(step);

            if !step_ok {
                errors.push(step_failed_error(STEP_FAILED_CODE, index, resolved, &result.status));
                if !continue_on_error {
                    break;
                }
            }
        }

        let strategy = json!({
            "prefer_v2": prefer_v2,
            "compile_on_finish": compile_on_finish,
            "auto_save": auto_save,
            "continue_on_error": continue_on_error,
            "k2_event_capability": self.gateway.has_capability(K2_EVENT_CAPABILITY),
            "capabilities": self.gateway.capabilities(),
        });
        Ok(workflow_result(
            request_id,
            "umg-workflow",
            object_path,
            steps,
            errors,
            touched_packages,
            strategy,
        ))
    }

    fn resolve_action(
        &self,
        object_path: &str,
        action: &Value,
        prefer_v2: bool,
    ) -> Result<ResolvedAction> {
        let (requested_kind, mut params) = action_kind_and_args(action)?;
        params
            .entry("object_path".to_string())
            .or_insert_with(|| json!(object_path));

        let direct = |tool: &str, params: Map<String, Value>| -> Result<ResolvedAction> {
            self.require_tool(tool)?;
            Ok(ResolvedAction {
                requested_kind: requested_kind.clone(),
                delegated_tool: tool.to_string(),
                params,
                fallback_note: String::new(),
            })
        };

        match requested_kind.as_str() {
            "widget.patch" => {
                let tool = if prefer_v2 && self.has_tool("umg.widget.patch.v2") {
                    "umg.widget.patch.v2"
                } else {
                    "umg.widget.patch"
                };
                direct(tool, params)
            }
            "slot.patch" => {
                let tool = if prefer_v2 && self.has_tool("umg.slot.patch.v2") {
                    "umg.slot.patch.v2"
                } else {
                    "umg.slot.patch"
                };
                direct(tool, params)
            }
            "widget.event.bind" => {
                let has_k2_event = self.gateway.has_capability(K2_EVENT_CAPABILITY);
                if has_k2_event && self.has_tool("umg.widget.event.bind") {
                    return direct("umg.widget.event.bind", params);
                }
                if self.has_tool("umg.binding.set") {
                    let translated = translate_event_bind_to_binding(&params)?;
                    return Ok(ResolvedAction {
                        requested_kind: requested_kind.clone(),
                        delegated_tool: "umg.binding.set".into(),
                        params: translated,
                        fallback_note: "fallback: umg.widget.event.bind -> umg.binding.set".into(),
                    });
                }
                self.require_tool("umg.widget.event.bind")?;
                Ok(ResolvedAction {
                    requested_kind: requested_kind.clone(),
                    delegated_tool: "umg.widget.event.bind".into(),
                    params,
                    fallback_note: "capability missing: using legacy umg.widget.event.bind".into(),
                })
            }
            "widget.event.unbind" => {
                let has_k2_event = self.gateway.has_capability(K2_EVENT_CAPABILITY);
                if has_k2_event && self.has_tool("umg.widget.event.unbind") {
                    return direct("umg.widget.event.unbind", params);
                }
                if self.has_tool("umg.binding.clear") {
                    let translated = translate_event_unbind_to_binding(&params);
                    return Ok(ResolvedAction {
                        requested_kind: requested_kind.clone(),
                        delegated_tool: "umg.binding.clear".into(),
                        params: translated,
                        fallback_note: "fallback: umg.widget.event.unbind -> umg.binding.clear"
                            .into(),
                    });
                }
                self.require_tool("umg.widget.event.unbind")?;
                Ok(ResolvedAction {
                    requested_kind: requested_kind.clone(),
                    delegated_tool: "umg.widget.event.unbind".into(),
                    params,
                    fallback_note: "capability missing: using legacy umg.widget.event.unbind"
                        .into(),
                })
            }
            "widget.add" => direct("umg.widget.add", params),
            "widget.remove" => direct("umg.widget.remove", params),
            "widget.reparent" => direct("umg.widget.reparent", params),
            "binding.set" => direct("umg.binding.set", params),
            "binding.clear" => direct("umg.binding.clear", params),
            "blueprint.patch" => direct("umg.blueprint.patch", params),
            other => Err(BridgeError::Argument(format!(
                "Unsupported action kind: {other}"
            ))),
        }
    }

    fn has_tool(&self, tool_name: &str) -> bool {
        self.gateway
            .list_tools()
            .iter()
            .any(|tool| tool.name == tool_name && tool.enabled)
    }

    fn require_tool(&self, tool_name: &str) -> Result<()> {
        if self.has_tool(tool_name) {
            Ok(())
        } else {
            Err(BridgeError::UnknownTool(format!(
                "Workflow requires tool not available: {tool_name}"
            )))
        }
    }
}

fn translate_event_bind_to_binding(params: &Map<String, Value>) -> Result<Map<String, Value>> {
    let event_name = params
        .get("event_name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            BridgeError::Argument("widget.event.bind action requires non-empty event_name.".into())
        })?
        .to_string();
    let function_name = params
        .get("function_name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            BridgeError::Argument(
                "widget.event.bind action requires non-empty function_name.".into(),
            )
        })?
        .to_string();

    let mut translated = params.clone();
    translated.remove("event_name");
    translated.insert("property_name".into(), json!(event_name));
    translated.insert("function_name".into(), json!(function_name));
    Ok(translated)
}

fn translate_event_unbind_to_binding(params: &Map<String, Value>) -> Map<String, Value> {
    let mut translated = params.clone();
    if let Some(event_name) = translated.remove("event_name") {
        if event_name.as_str().map(|name| !name.is_empty()).unwrap_or(false) {
            translated.insert("property_name".into(), event_name);
        }
    }
    translated
}
