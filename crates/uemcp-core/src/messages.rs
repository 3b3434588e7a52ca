use serde_json::Value;

use crate::error::{BridgeError, Result};

/// Protocol revision stamped into every request envelope.
pub const WIRE_PROTOCOL: &str = "unreal-mcp/1.0";

/// A decoded `mcp.response` wire message.
#[derive(Debug, Clone)]
pub struct UeResponse {
    pub request_id: String,
    pub status: String,
    pub ok: bool,
    /// Envelope decoded out of the wrapper's `response_json` string.
    pub envelope: Value,
    /// The wrapper object exactly as it arrived.
    pub raw_message: Value,
}

/// Parse a raw text frame into a JSON object. Non-object roots are rejected.
pub fn parse_json_message(raw: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(raw)
        .map_err(|e| BridgeError::MessageParse(format!("Invalid JSON payload: {e}")))?;
    if !parsed.is_object() {
        return Err(BridgeError::MessageParse(
            "JSON payload must be an object.".into(),
        ));
    }
    Ok(parsed)
}

/// Decode an `mcp.response` wrapper.
///
/// Returns `Ok(None)` when the message is some other type. The wrapper's
/// `ok` boolean wins when present; otherwise `ok` derives from
/// `status != "error"`. A missing or non-string `status` defaults to `"error"`.
pub fn parse_mcp_response(message: &Value) -> Result<Option<UeResponse>> {
    if message.get("type").and_then(Value::as_str) != Some("mcp.response") {
        return Ok(None);
    }

    let response_json = message
        .get("response_json")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            BridgeError::MessageParse("mcp.response.response_json must be a string.".into())
        })?;

    let envelope: Value = serde_json::from_str(response_json)
        .map_err(|e| BridgeError::MessageParse(format!("Invalid response_json payload: {e}")))?;
    if !envelope.is_object() {
        return Err(BridgeError::MessageParse(
            "mcp.response.response_json must decode to an object.".into(),
        ));
    }

    let request_id = match envelope.get("request_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return Err(BridgeError::MessageParse(
                "mcp.response.response_json.request_id is missing.".into(),
            ));
        }
    };

    let status = envelope
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("error")
        .to_string();

    let ok = match message.get("ok") {
        Some(Value::Bool(flag)) => *flag,
        _ => status != "error",
    };

    Ok(Some(UeResponse {
        request_id,
        status,
        ok,
        envelope,
        raw_message: message.clone(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wrap(envelope: &Value) -> Value {
        json!({
            "type": "mcp.response",
            "ok": true,
            "response_json": serde_json::to_string(envelope).unwrap(),
        })
    }

    #[test]
    fn rejects_non_object_roots() {
        assert!(parse_json_message("[1,2]").is_err());
        assert!(parse_json_message("42").is_err());
        assert!(parse_json_message("not json").is_err());
        assert!(parse_json_message("{\"a\":1}").is_ok());
    }

    #[test]
    fn non_response_messages_pass_through() {
        let msg = json!({"type": "pong"});
        assert!(parse_mcp_response(&msg).unwrap().is_none());
    }

    #[test]
    fn decodes_a_complete_response() {
        let envelope = json!({
            "request_id": "req-1",
            "status": "ok",
            "result": {"value": 3},
            "diagnostics": {"errors": []},
        });
        let response = parse_mcp_response(&wrap(&envelope)).unwrap().unwrap();
        assert_eq!(response.request_id, "req-1");
        assert_eq!(response.status, "ok");
        assert!(response.ok);
        assert_eq!(response.envelope["result"]["value"], 3);
    }

    #[test]
    fn status_defaults_to_error_when_absent() {
        let envelope = json!({"request_id": "req-2"});
        let message = json!({
            "type": "mcp.response",
            "response_json": serde_json::to_string(&envelope).unwrap(),
        });
        let response = parse_mcp_response(&message).unwrap().unwrap();
        assert_eq!(response.status, "error");
        assert!(!response.ok);
    }

    #[test]
    fn wrapper_ok_wins_over_status() {
        let envelope = json!({"request_id": "req-3", "status": "error"});
        let message = json!({
            "type": "mcp.response",
            "ok": true,
            "response_json": serde_json::to_string(&envelope).unwrap(),
        });
        let response = parse_mcp_response(&message).unwrap().unwrap();
        assert_eq!(response.status, "error");
        assert!(response.ok);
    }

    #[test]
    fn rejects_blank_request_id_and_bad_payloads() {
        let no_id = json!({"status": "ok"});
        assert!(parse_mcp_response(&wrap(&no_id)).is_err());

        let blank_id = json!({"request_id": "", "status": "ok"});
        assert!(parse_mcp_response(&wrap(&blank_id)).is_err());

        let not_a_string = json!({"type": "mcp.response", "response_json": 7});
        assert!(parse_mcp_response(&not_a_string).is_err());

        let not_an_object = json!({"type": "mcp.response", "response_json": "[1,2]"});
        assert!(parse_mcp_response(&not_an_object).is_err());
    }
}
