use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::{Value, json};

use uemcp_core::messages::WIRE_PROTOCOL;
use uemcp_core::{Result, ToolCallSpec, ToolInvoker};

/// One downstream tool as advertised by `tools.list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub domain: String,
    pub version: String,
    pub enabled: bool,
    pub write: bool,
    pub params_schema: Option<Value>,
    pub result_schema: Option<Value>,
}

#[derive(Debug)]
struct CatalogState {
    tools_by_name: HashMap<String, ToolDefinition>,
    schema_hash: String,
    protocol_version: String,
    capabilities: Vec<String>,
}

impl Default for CatalogState {
    fn default() -> Self {
        Self {
            tools_by_name: HashMap::new(),
            schema_hash: String::new(),
            protocol_version: WIRE_PROTOCOL.to_string(),
            capabilities: Vec::new(),
        }
    }
}

/// Mirror of the downstream tool catalog.
///
/// `refresh` replaces the whole state atomically, so concurrent readers
/// always see one consistent generation.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    state: Mutex<CatalogState>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema_hash(&self) -> String {
        self.state.lock().expect("catalog lock poisoned").schema_hash.clone()
    }

    pub fn protocol_version(&self) -> String {
        self.state
            .lock()
            .expect("catalog lock poisoned")
            .protocol_version
            .clone()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.state
            .lock()
            .expect("catalog lock poisoned")
            .capabilities
            .clone()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.state
            .lock()
            .expect("catalog lock poisoned")
            .capabilities
            .iter()
            .any(|entry| entry == capability)
    }

    /// All tools, sorted by name.
    pub fn tools(&self) -> Vec<ToolDefinition> {
        let state = self.state.lock().expect("catalog lock poisoned");
        let mut tools: Vec<ToolDefinition> = state.tools_by_name.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub fn tool_count(&self) -> usize {
        self.state
            .lock()
            .expect("catalog lock poisoned")
            .tools_by_name
            .len()
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolDefinition> {
        self.state
            .lock()
            .expect("catalog lock poisoned")
            .tools_by_name
            .get(name)
            .cloned()
    }

    /// Call downstream `tools.list` and swap in the new catalog state.
    pub async fn refresh(&self, invoker: &dyn ToolInvoker, include_schemas: bool) -> Result<()> {
        let mut spec = ToolCallSpec::new("tools.list");
        spec.params
            .insert("include_schemas".into(), json!(include_schemas));
        let response = invoker.call_tool(spec).await?;

        let protocol_version = response
            .result
            .get("protocol_version")
            .and_then(Value::as_str)
            .unwrap_or(WIRE_PROTOCOL)
            .to_string();
        let schema_hash = response
            .result
            .get("schema_hash")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let capabilities = normalize_capabilities(response.result.get("capabilities"));

        let mut tools_by_name = HashMap::new();
        if let Some(entries) = response.result.get("tools").and_then(Value::as_array) {
            for entry in entries {
                let Some(entry) = entry.as_object() else {
                    continue;
                };
                let Some(name) = entry.get("name").and_then(Value::as_str).filter(|n| !n.is_empty())
                else {
                    continue;
                };
                tools_by_name.insert(
                    name.to_string(),
                    ToolDefinition {
                        name: name.to_string(),
                        domain: entry
                            .get("domain")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string(),
                        version: entry
                            .get("version")
                            .and_then(Value::as_str)
                            .unwrap_or("1.0.0")
                            .to_string(),
                        enabled: entry.get("enabled").and_then(Value::as_bool).unwrap_or(true),
                        write: entry.get("write").and_then(Value::as_bool).unwrap_or(false),
                        params_schema: entry.get("params_schema").filter(|v| v.is_object()).cloned(),
                        result_schema: entry.get("result_schema").filter(|v| v.is_object()).cloned(),
                    },
                );
            }
        }

        let mut state = self.state.lock().expect("catalog lock poisoned");
        *state = CatalogState {
            tools_by_name,
            schema_hash,
            protocol_version,
            capabilities,
        };
        Ok(())
    }
}

fn normalize_capabilities(raw: Option<&Value>) -> Vec<String> {
    let Some(entries) = raw.and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|capability| !capability.is_empty())
        .filter(|capability| seen.insert(capability.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_deduplicate_preserving_order() {
        let raw = json!(["core_v1", " keys_v1 ", "core_v1", "", 7, "umg_v2"]);
        assert_eq!(
            normalize_capabilities(Some(&raw)),
            vec!["core_v1", "keys_v1", "umg_v2"]
        );
        assert!(normalize_capabilities(Some(&json!("nope"))).is_empty());
        assert!(normalize_capabilities(None).is_empty());
    }
}
