//! Server-side composite tools that sequence downstream calls.

pub mod sequencer;
pub mod umg;

use serde_json::{Map, Value, json};

use uemcp_core::{BridgeError, Result, ToolCallResult};

/// One workflow action after kind resolution and fallback translation.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedAction {
    pub requested_kind: String,
    pub delegated_tool: String,
    pub params: Map<String, Value>,
    pub fallback_note: String,
}

pub(crate) fn actions_array<'a>(arguments: &'a Map<String, Value>, tool: &str) -> Result<&'a Vec<Value>> {
    match arguments.get("actions").and_then(Value::as_array) {
        Some(actions) if !actions.is_empty() => Ok(actions),
        _ => Err(BridgeError::Argument(format!(
            "{tool} requires non-empty array 'actions'."
        ))),
    }
}

pub(crate) fn action_kind_and_args(action: &Value) -> Result<(String, Map<String, Value>)> {
    let Some(action) = action.as_object() else {
        return Err(BridgeError::Argument(
            "Each action must be an object with kind/args.".into(),
        ));
    };

    let kind = action
        .get("kind")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .ok_or_else(|| BridgeError::Argument("Action kind must be a non-empty string.".into()))?
        .to_string();

    let args = action
        .get("args")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| {
            BridgeError::Argument(format!("Action '{kind}' requires object 'args'."))
        })?;

    Ok((kind, args))
}

pub(crate) fn bool_arg(arguments: &Map<String, Value>, key: &str, default: bool) -> bool {
    arguments.get(key).and_then(Value::as_bool).unwrap_or(default)
}

/// Inject `save.auto_save = true` into a step's params.
pub(crate) fn inject_auto_save(params: &mut Map<String, Value>) {
    let mut save = params
        .get("save")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    save.insert("auto_save".into(), json!(true));
    params.insert("save".into(), Value::Object(save));
}

pub(crate) fn step_payload(index: usize, resolved: &ResolvedAction, result: &ToolCallResult) -> Value {
    json!({
        "index": index + 1,
        "requested_kind": resolved.requested_kind,
        "delegated_tool": resolved.delegated_tool,
        "request_id": result.request_id,
        "status": result.status,
        "ok": result.ok && result.status != "error",
        "fallback": resolved.fallback_note,
        "diagnostics": result.diagnostics,
    })
}

pub(crate) fn step_failed_error(
    code: &str,
    index: usize,
    resolved: &ResolvedAction,
    status: &str,
) -> Value {
    json!({
        "code": code,
        "message": "Workflow step failed.",
        "detail": format!(
            "index={}, kind={}, tool={}, status={}",
            index + 1,
            resolved.requested_kind,
            resolved.delegated_tool,
            status,
        ),
        "retriable": false,
    })
}

pub(crate) fn step_request_id(base: Option<&str>, index: usize) -> Option<String> {
    base.filter(|base| !base.is_empty())
        .map(|base| format!("{base}-step{}", index + 1))
}

pub(crate) fn collect_touched_packages(result: &ToolCallResult, touched: &mut Vec<String>) {
    let Some(packages) = result.result.get("touched_packages").and_then(Value::as_array) else {
        return;
    };
    for package in packages.iter().filter_map(Value::as_str) {
        if !package.is_empty() && !touched.iter().any(|existing| existing == package) {
            touched.push(package.to_string());
        }
    }
}

/// Assemble the composite result envelope shared by both orchestrators.
pub(crate) fn workflow_result(
    request_id: Option<&str>,
    fallback_request_id: &str,
    object_path: &str,
    steps: Vec<Value>,
    errors: Vec<Value>,
    touched_packages: Vec<String>,
    strategy: Value,
) -> ToolCallResult {
    let status = if errors.is_empty() { "ok" } else { "error" };
    let workflow_result = json!({
        "object_path": object_path,
        "step_count": steps.len(),
        "failed_count": errors.len(),
        "steps": steps,
        "touched_packages": touched_packages,
        "strategy": strategy,
    });
    let diagnostics = json!({
        "errors": errors,
        "warnings": [],
        "infos": [],
    });

    ToolCallResult {
        ok: status == "ok",
        status: status.to_string(),
        request_id: request_id
            .filter(|id| !id.is_empty())
            .unwrap_or(fallback_request_id)
            .to_string(),
        result: workflow_result.as_object().cloned().unwrap_or_default(),
        diagnostics: diagnostics.as_object().cloned().unwrap_or_default(),
        raw_envelope: json!({
            "status": status,
            "result": workflow_result,
            "diagnostics": diagnostics,
        }),
    }
}
