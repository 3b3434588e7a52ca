use std::sync::Arc;

use serde_json::{Map, Value, json};

use uemcp_core::{BridgeError, Result, ToolCallResult};

use crate::passthrough::{ToolCall, ToolGateway};
use crate::workflow::{
    ResolvedAction, action_kind_and_args, actions_array, bool_arg, collect_touched_packages,
    inject_auto_save, step_failed_error, step_payload, step_request_id, workflow_result,
};

pub const SEQ_VIRTUAL_TOOL: &str = "seq.workflow.compose";
const CORE_CAPABILITY: &str = "sequencer_core_v1";
const KEYS_CAPABILITY: &str = "sequencer_keys_v1";
const STEP_FAILED_CODE: &str = "MCP.SERVER.SEQ_WORKFLOW_STEP_FAILED";

const DIRECT_MAP: &[(&str, &str)] = &[
    ("asset.create", "seq.asset.create"),
    ("asset.load", "seq.asset.load"),
    ("inspect", "seq.inspect"),
    ("binding.list", "seq.binding.list"),
    ("track.list", "seq.track.list"),
    ("section.list", "seq.section.list"),
    ("channel.list", "seq.channel.list"),
    ("binding.add", "seq.binding.add"),
    ("binding.remove", "seq.binding.remove"),
    ("track.add", "seq.track.add"),
    ("track.remove", "seq.track.remove"),
    ("section.add", "seq.section.add"),
    ("section.patch", "seq.section.patch"),
    ("section.remove", "seq.section.remove"),
    ("key.set", "seq.key.set"),
    ("key.remove", "seq.key.remove"),
    ("object.inspect", "seq.object.inspect"),
    ("object.patch.v2", "seq.object.patch.v2"),
    ("playback.patch", "seq.playback.patch"),
    ("save", "seq.save"),
    ("validate", "seq.validate"),
];

const SAVE_AWARE_TOOLS: &[&str] = &[
    "seq.asset.create",
    "seq.binding.add",
    "seq.binding.remove",
    "seq.track.add",
    "seq.track.remove",
    "seq.section.add",
    "seq.section.patch",
    "seq.section.remove",
    "seq.key.set",
    "seq.key.remove",
    "seq.key.bulk_set",
    "seq.playback.patch",
    "seq.save",
];

/// Composes sequencer lifecycle/structure/key edits, carrying the most
/// recently created asset path forward between steps.
pub struct SequencerOrchestrator {
    gateway: Arc<dyn ToolGateway>,
}

impl SequencerOrchestrator {
    pub fn new(gateway: Arc<dyn ToolGateway>) -> Self {
        Self { gateway }
    }

    pub fn is_virtual_tool(&self, tool_name: &str) -> bool {
        tool_name == SEQ_VIRTUAL_TOOL
    }

    pub fn list_virtual_tools(&self) -> Vec<Value> {
        let kinds: Vec<&str> = DIRECT_MAP
            .iter()
            .map(|(kind, _)| *kind)
            .chain(std::iter::once("key.bulk_set"))
            .collect();
        vec![json!({
            "name": SEQ_VIRTUAL_TOOL,
            "description": "[seq] server-side orchestration helper. Composes sequencer \
                lifecycle/structure/key operations with capability-aware fallback.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "object_path": {"type": "string"},
                    "actions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "kind": {"type": "string", "enum": kinds},
                                "args": {"type": "object"},
                            },
                            "required": ["kind", "args"],
                            "additionalProperties": false,
                        },
                    },
                    "auto_save": {"type": "boolean", "default": false},
                    "continue_on_error": {"type": "boolean", "default": false},
                },
                "required": ["actions"],
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
        if tool_name != SEQ_VIRTUAL_TOOL {
            return Err(BridgeError::UnknownTool(format!(
                "Unknown virtual tool: {tool_name}"
            )));
        }

        let actions = actions_array(arguments, SEQ_VIRTUAL_TOOL)?;

        let mut current_object_path = match arguments.get("object_path") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(path)) => path.trim().to_string(),
            Some(_) => {
                return Err(BridgeError::Argument(format!(
                    "{SEQ_VIRTUAL_TOOL} optional 'object_path' must be string."
                )));
            }
        };
        let auto_save = bool_arg(arguments, "auto_save", false);
        let continue_on_error = bool_arg(arguments, "continue_on_error", false);

        let mut steps: Vec<Value> = Vec::new();
        let mut errors: Vec<Value> = Vec::new();
        let mut touched_packages: Vec<String> = Vec::new();

        for (index, action) in actions.iter().enumerate() {
            let resolved = self.resolve_action(action)?;
            let mut params = resolved.params.clone();

            // Later steps default to the most recently created asset.
            if !current_object_path.is_empty()
                && !params.contains_key("object_path")
                && resolved.requested_kind != "asset.create"
            {
                params.insert("object_path".into(), json!(current_object_path));
            }
            if auto_save && SAVE_AWARE_TOOLS.contains(&resolved.delegated_tool.as_str()) {
                inject_auto_save(&mut params);
            }

            let mut call = ToolCall::new(resolved.delegated_tool.clone());
            call.params = params;
            call.request_id = step_request_id(request_id, index);
            let result = self.gateway.call_tool(call).await?;

            let step = step_payload(index, &resolved, &result);
            let step_ok = step["ok"].as_bool().unwrap_or(false);
            steps.push(step);

            if let Some(object_path) = result.result.get("object_path").and_then(Value::as_str) {
                if !object_path.is_empty() {
                    current_object_path = object_path.to_string();
                }
            }
            collect_touched_packages(&result, &mut touched_packages);

            if !step_ok {
                errors.push(step_failed_error(
                    STEP_FAILED_CODE,
                    index,
                    &resolved,
                    &result.status,
                ));
                if !continue_on_error {
                    break;
                }
            }
        }

        let strategy = json!({
            "auto_save": auto_save,
            "continue_on_error": continue_on_error,
            "sequencer_core_capability": self.gateway.has_capability(CORE_CAPABILITY),
            "sequencer_keys_capability": self.gateway.has_capability(KEYS_CAPABILITY),
            "capabilities": self.gateway.capabilities(),
        });
        Ok(workflow_result(
            request_id,
            "seq-workflow",
            &current_object_path,
            steps,
            errors,
            touched_packages,
            strategy,
        ))
    }

    fn resolve_action(&self, action: &Value) -> Result<ResolvedAction> {
        let (requested_kind, params) = action_kind_and_args(action)?;

        if requested_kind == "key.bulk_set" {
            if self.gateway.has_capability(KEYS_CAPABILITY) && self.has_tool("seq.key.bulk_set") {
                return Ok(ResolvedAction {
                    requested_kind,
                    delegated_tool: "seq.key.bulk_set".into(),
                    params,
                    fallback_note: String::new(),
                });
            }
            self.require_tool("seq.key.set")?;
            return Ok(ResolvedAction {
                requested_kind,
                delegated_tool: "seq.key.set".into(),
                params: translate_bulk_to_single_key(&params)?,
                fallback_note: "fallback: seq.key.bulk_set -> seq.key.set(first key)".into(),
            });
        }

        let delegated_tool = DIRECT_MAP
            .iter()
            .find(|(kind, _)| *kind == requested_kind)
            .map(|(_, tool)| *tool)
            .ok_or_else(|| {
                BridgeError::Argument(format!("Unsupported action kind: {requested_kind}"))
            })?;

        self.require_tool(delegated_tool)?;
        Ok(ResolvedAction {
            requested_kind,
            delegated_tool: delegated_tool.to_string(),
            params,
            fallback_note: String::new(),
        })
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
                "Required tool is not available: {tool_name}"
            )))
        }
    }
}

/// Keep only the first key of a bulk request for the single-key fallback.
fn translate_bulk_to_single_key(params: &Map<String, Value>) -> Result<Map<String, Value>> {
    let first_key = params
        .get("keys")
        .and_then(Value::as_array)
        .and_then(|keys| keys.first())
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| {
            BridgeError::Argument(
                "key.bulk_set action requires non-empty keys array for fallback.".into(),
            )
        })?;

    let mut translated = params.clone();
    translated.remove("keys");
    for (key, value) in first_key {
        translated.insert(key, value);
    }
    Ok(translated)
}
