use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;
use url::Url;

use uemcp_config::AppConfig;
use uemcp_core::{BridgeError, Result, metrics::now_ms};

use crate::wsl;

pub const ENV_WS_URL: &str = "UE_MCP_WS_URL";
pub const ENV_CONNECTION_FILE: &str = "UE_MCP_CONNECTION_FILE";
pub const ENV_PROJECT_ROOT: &str = "UE_MCP_PROJECT_ROOT";
pub const ENV_INSTANCE_ID: &str = "UE_MCP_INSTANCE_ID";
pub const ENV_PROJECT_DIR: &str = "UE_MCP_PROJECT_DIR";
pub const ENV_PROCESS_ID: &str = "UE_MCP_PROCESS_ID";

const INSTANCE_HEARTBEAT_STALE_MS: i64 = 30_000;
const MAX_INSTANCE_REGISTRY_FILES: usize = 512;
const MAX_SIBLINGS_PER_LEVEL: usize = 128;
const MAX_LISTED_CANDIDATES: usize = 10;

/// Narrows endpoint discovery down to one peer.
#[derive(Debug, Clone, Default)]
pub struct EndpointSelector {
    pub instance_id: Option<String>,
    pub project_dir: Option<String>,
    pub process_id: Option<u32>,
}

impl EndpointSelector {
    pub fn has_any(&self) -> bool {
        self.instance_id.is_some() || self.project_dir.is_some() || self.process_id.is_some()
    }

    pub fn from_env(env: &HashMap<String, String>, cwd: &Path) -> Self {
        let instance_id = env
            .get(ENV_INSTANCE_ID)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let project_dir = env
            .get(ENV_PROJECT_DIR)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|raw| match normalize_fs_path(raw, cwd) {
                Some(path) => path.to_string_lossy().into_owned(),
                None => raw.to_string(),
            });

        let process_id = env
            .get(ENV_PROCESS_ID)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .and_then(|raw| match raw.parse::<i64>() {
                Ok(pid) if pid > 0 => u32::try_from(pid).ok(),
                Ok(_) => {
                    warn!(value = raw, "Ignoring non-positive {}", ENV_PROCESS_ID);
                    None
                }
                Err(_) => {
                    warn!(value = raw, "Ignoring invalid {}", ENV_PROCESS_ID);
                    None
                }
            });

        Self {
            instance_id,
            project_dir,
            process_id,
        }
    }
}

/// The endpoint discovery settled on.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointResolution {
    pub ws_url: String,
    pub source: String,
    pub connection_file: Option<String>,
    pub instance_id: Option<String>,
    pub project_dir: Option<String>,
    pub process_id: Option<u32>,
    pub project_name: Option<String>,
}

impl EndpointResolution {
    fn from_url(ws_url: String, source: &str) -> Self {
        Self {
            ws_url,
            source: source.to_string(),
            connection_file: None,
            instance_id: None,
            project_dir: None,
            process_id: None,
            project_name: None,
        }
    }
}

/// One discovered endpoint, as surfaced by the listing mode.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointCandidate {
    pub ws_url: String,
    pub source: String,
    pub descriptor_file: String,
    pub connection_file: Option<String>,
    pub instance_id: Option<String>,
    pub project_dir: Option<String>,
    pub process_id: Option<u32>,
    pub project_name: Option<String>,
    pub heartbeat_at_ms: Option<i64>,
    pub updated_at_ms: Option<i64>,
    pub stale: bool,
}

impl EndpointCandidate {
    /// Env/args hints a user can copy to pin this candidate.
    pub fn selector_hint(&self) -> Value {
        let mut env = serde_json::Map::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(instance_id) = &self.instance_id {
            env.insert(ENV_INSTANCE_ID.into(), json!(instance_id));
            args.extend(["--ue-instance-id".into(), instance_id.clone()]);
        }
        if let Some(project_dir) = &self.project_dir {
            env.insert(ENV_PROJECT_DIR.into(), json!(project_dir));
            args.extend(["--ue-project-dir".into(), project_dir.clone()]);
        }
        if let Some(process_id) = self.process_id {
            env.insert(ENV_PROCESS_ID.into(), json!(process_id));
            args.extend(["--ue-process-id".into(), process_id.to_string()]);
        }
        json!({"env": env, "args": args})
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    ws_url: String,
    source: &'static str,
    descriptor_file: String,
    connection_file: Option<String>,
    instance_id: Option<String>,
    project_dir: Option<String>,
    process_id: Option<u32>,
    project_name: Option<String>,
    heartbeat_at_ms: Option<i64>,
    updated_at_ms: Option<i64>,
}

impl Candidate {
    fn freshness(&self) -> (i64, i64) {
        (
            self.heartbeat_at_ms.unwrap_or(0),
            self.updated_at_ms.unwrap_or(0),
        )
    }

    fn is_stale(&self) -> bool {
        if self.source != "instance_registry" {
            return false;
        }
        let heartbeat = self.heartbeat_at_ms.or(self.updated_at_ms).unwrap_or(0);
        if heartbeat <= 0 {
            return false;
        }
        now_ms() - heartbeat > INSTANCE_HEARTBEAT_STALE_MS
    }

    fn to_public(&self) -> EndpointCandidate {
        EndpointCandidate {
            ws_url: self.ws_url.clone(),
            source: self.source.to_string(),
            descriptor_file: self.descriptor_file.clone(),
            connection_file: self.connection_file.clone(),
            instance_id: self.instance_id.clone(),
            project_dir: self.project_dir.clone(),
            process_id: self.process_id,
            project_name: self.project_name.clone(),
            heartbeat_at_ms: self.heartbeat_at_ms,
            updated_at_ms: self.updated_at_ms,
            stale: self.is_stale(),
        }
    }
}

#[derive(Debug, Hash, PartialEq, Eq)]
enum CandidateKey {
    Instance(String),
    Process(u32, String),
    Descriptor(String),
    Url(String),
}

impl CandidateKey {
    fn for_candidate(candidate: &Candidate) -> Self {
        if let Some(instance_id) = &candidate.instance_id {
            return Self::Instance(instance_id.clone());
        }
        if let Some(process_id) = candidate.process_id {
            return Self::Process(process_id, candidate.ws_url.clone());
        }
        if !candidate.descriptor_file.is_empty() {
            return Self::Descriptor(candidate.descriptor_file.clone());
        }
        Self::Url(candidate.ws_url.clone())
    }
}

/// Snapshot of the process environment, for callers that do not inject one.
pub fn os_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

/// Select exactly one WebSocket endpoint.
///
/// Order: a valid `UE_MCP_WS_URL` wins outright; otherwise connection-file
/// and instance-registry candidates are collected, filtered by the selector,
/// and must narrow to a single live endpoint. Zero candidates with no
/// selector falls back to the configured URL.
pub fn resolve_ws_endpoint(
    config: &AppConfig,
    env: &HashMap<String, String>,
    cwd: &Path,
    selector: Option<&EndpointSelector>,
) -> Result<EndpointResolution> {
    let env_selector;
    let effective_selector = match selector {
        Some(selector) => selector,
        None => {
            env_selector = EndpointSelector::from_env(env, cwd);
            &env_selector
        }
    };

    if let Some(raw_url) = env.get(ENV_WS_URL).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        match normalize_ws_url(raw_url) {
            Some(ws_url) => {
                return Ok(EndpointResolution::from_url(ws_url, "env:UE_MCP_WS_URL"));
            }
            None => warn!(url = raw_url, "Ignoring invalid {}", ENV_WS_URL),
        }
    }

    let candidates = collect_candidates(config, env, cwd, false);
    if !candidates.is_empty() {
        let filtered = filter_by_selector(&candidates, effective_selector, cwd);

        if effective_selector.has_any() && filtered.is_empty() {
            return Err(BridgeError::EndpointSelection(no_match_error_message(
                effective_selector,
                &candidates,
            )));
        }

        let selected = if effective_selector.has_any() {
            filtered
        } else {
            candidates.iter().collect()
        };

        if selected.len() > 1 {
            return Err(BridgeError::EndpointSelection(ambiguous_error_message(
                &selected,
            )));
        }
        if let Some(candidate) = selected.first() {
            return Ok(EndpointResolution {
                ws_url: candidate.ws_url.clone(),
                source: candidate.source.to_string(),
                connection_file: candidate.connection_file.clone(),
                instance_id: candidate.instance_id.clone(),
                project_dir: candidate.project_dir.clone(),
                process_id: candidate.process_id,
                project_name: candidate.project_name.clone(),
            });
        }
    }

    if effective_selector.has_any() {
        return Err(BridgeError::EndpointSelection(
            "No UE endpoint candidate is available for the requested selector.".into(),
        ));
    }

    Ok(EndpointResolution::from_url(
        config.ue.ws_url.clone(),
        "config:ue.ws_url",
    ))
}

/// All discovered candidates after selector filtering, for the listing mode.
pub fn list_endpoint_candidates(
    config: &AppConfig,
    env: &HashMap<String, String>,
    cwd: &Path,
    selector: Option<&EndpointSelector>,
    include_stale: bool,
) -> Vec<EndpointCandidate> {
    let env_selector;
    let effective_selector = match selector {
        Some(selector) => selector,
        None => {
            env_selector = EndpointSelector::from_env(env, cwd);
            &env_selector
        }
    };

    let candidates = collect_candidates(config, env, cwd, include_stale);
    filter_by_selector(&candidates, effective_selector, cwd)
        .into_iter()
        .map(Candidate::to_public)
        .collect()
}

/// Validate and canonicalize a `ws://`/`wss://` URL.
///
/// Wildcard and loopback host aliases are rewritten to `127.0.0.1` and the
/// port is always made explicit (80/443 inferred from the scheme).
pub fn normalize_ws_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "ws" | "wss") {
        return None;
    }
    let host = parsed.host_str()?;
    if host.is_empty() {
        return None;
    }
    let port = parsed
        .port_or_known_default()
        .unwrap_or(if parsed.scheme() == "wss" { 443 } else { 80 });

    let host = normalize_connect_host(host);
    let mut out = format!("{}://{}:{}", parsed.scheme(), host, port);
    if parsed.path() != "/" && !parsed.path().is_empty() {
        out.push_str(parsed.path());
    }
    if let Some(query) = parsed.query() {
        out.push('?');
        out.push_str(query);
    }
    Some(out)
}

fn normalize_connect_host(host: &str) -> String {
    let lowered = host.trim().to_lowercase();
    match lowered.as_str() {
        "" | "0.0.0.0" | "::" | "[::]" | "*" | "localhost" => "127.0.0.1".to_string(),
        _ => host.to_string(),
    }
}

/// Trim, rewrite Windows drive paths under WSL, expand `~`, anchor relative
/// paths at `cwd`, then canonicalize when the path exists.
pub fn normalize_fs_path(raw: &str, cwd: &Path) -> Option<PathBuf> {
    let mut text = raw.trim().to_string();
    if text.is_empty() {
        return None;
    }

    if wsl::is_wsl() {
        if let Some(rewritten) = wsl::rewrite_windows_path(&text) {
            text = rewritten;
        }
    }

    if let Some(rest) = text.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            text = Path::new(&home).join(rest).to_string_lossy().into_owned();
        }
    }

    let mut path = PathBuf::from(text);
    if !path.is_absolute() {
        path = cwd.join(path);
    }
    Some(path.canonicalize().unwrap_or(path))
}

fn connection_file_candidates(
    config: &AppConfig,
    env: &HashMap<String, String>,
    cwd: &Path,
) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut append = |path: Option<PathBuf>| {
        if let Some(path) = path {
            if seen.insert(path.clone()) {
                files.push(path);
            }
        }
    };

    if let Some(raw) = env.get(ENV_CONNECTION_FILE) {
        append(normalize_fs_path(raw, cwd));
    }
    append(normalize_fs_path(&config.ue.connection_file, cwd));

    for root in project_root_candidates(config, env, cwd) {
        append(Some(root.join("Saved").join("UnrealMCP").join("connection.json")));
    }

    files
}

fn instance_registry_dirs(
    config: &AppConfig,
    env: &HashMap<String, String>,
    cwd: &Path,
    connection_files: &[PathBuf],
) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut append = |path: PathBuf| {
        if seen.insert(path.clone()) {
            dirs.push(path);
        }
    };

    for connection_file in connection_files {
        if let Some(parent) = connection_file.parent() {
            append(parent.join("instances"));
        }
    }
    for root in project_root_candidates(config, env, cwd) {
        append(root.join("Saved").join("UnrealMCP").join("instances"));
    }

    dirs
}

fn project_root_candidates(
    config: &AppConfig,
    env: &HashMap<String, String>,
    cwd: &Path,
) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut append = |path: Option<PathBuf>| {
        if let Some(path) = path {
            if seen.insert(path.clone()) {
                roots.push(path);
            }
        }
    };

    if let Some(raw) = env.get(ENV_PROJECT_ROOT) {
        append(normalize_fs_path(raw, cwd));
    }
    append(normalize_fs_path(&config.ue.project_root, cwd));
    for discovered in discover_nearby_project_roots(cwd) {
        append(Some(discovered));
    }

    roots
}

fn discover_nearby_project_roots(cwd: &Path) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let append_if_project = |dir: &Path, roots: &mut Vec<PathBuf>, seen: &mut HashSet<PathBuf>| {
        if has_uproject(dir) && seen.insert(dir.to_path_buf()) {
            roots.push(dir.to_path_buf());
        }
    };

    let mut bases: Vec<PathBuf> = vec![cwd.to_path_buf()];
    let mut current = cwd;
    for _ in 0..3 {
        match current.parent() {
            Some(parent) => {
                bases.push(parent.to_path_buf());
                current = parent;
            }
            None => break,
        }
    }

    for base in &bases {
        append_if_project(base, &mut roots, &mut seen);

        let Ok(entries) = std::fs::read_dir(base) else {
            continue;
        };
        let mut children: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        children.sort();
        for child in children.iter().take(MAX_SIBLINGS_PER_LEVEL) {
            append_if_project(child, &mut roots, &mut seen);
        }
    }

    roots
}

fn has_uproject(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    entries.flatten().any(|entry| {
        entry
            .path()
            .extension()
            .map(|ext| ext == "uproject")
            .unwrap_or(false)
    })
}

fn collect_candidates(
    config: &AppConfig,
    env: &HashMap<String, String>,
    cwd: &Path,
    include_stale: bool,
) -> Vec<Candidate> {
    let connection_files = connection_file_candidates(config, env, cwd);
    let registry_dirs = instance_registry_dirs(config, env, cwd, &connection_files);

    let mut deduplicated: HashMap<CandidateKey, Candidate> = HashMap::new();
    let mut merge = |candidate: Candidate| {
        let key = CandidateKey::for_candidate(&candidate);
        match deduplicated.get(&key) {
            Some(existing) if candidate.freshness() < existing.freshness() => {}
            _ => {
                deduplicated.insert(key, candidate);
            }
        }
    };

    for connection_file in &connection_files {
        let fallback = Some(connection_file.to_string_lossy().into_owned());
        if let Some(candidate) =
            candidate_from_descriptor(connection_file, "connection_file", fallback, cwd)
        {
            merge(candidate);
        }
    }

    for registry_dir in &registry_dirs {
        if !registry_dir.is_dir() {
            continue;
        }
        let Ok(entries) = std::fs::read_dir(registry_dir) else {
            continue;
        };
        let mut instance_files: Vec<PathBuf> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false)
            })
            .collect();
        instance_files.sort();

        for instance_file in instance_files.iter().take(MAX_INSTANCE_REGISTRY_FILES) {
            let fallback = registry_dir
                .parent()
                .map(|parent| parent.join("connection.json").to_string_lossy().into_owned());
            let Some(candidate) =
                candidate_from_descriptor(instance_file, "instance_registry", fallback, cwd)
            else {
                continue;
            };
            if !include_stale && candidate.is_stale() {
                continue;
            }
            merge(candidate);
        }
    }

    let mut candidates: Vec<Candidate> = deduplicated.into_values().collect();
    candidates.sort_by(|a, b| b.freshness().cmp(&a.freshness()));
    candidates
}

fn candidate_from_descriptor(
    descriptor_file: &Path,
    source: &'static str,
    fallback_connection_file: Option<String>,
    cwd: &Path,
) -> Option<Candidate> {
    if !descriptor_file.is_file() {
        return None;
    }

    let content = match std::fs::read_to_string(descriptor_file) {
        Ok(content) => content,
        Err(error) => {
            warn!(
                path = %descriptor_file.display(),
                %error,
                "Failed to read UE endpoint descriptor"
            );
            return None;
        }
    };
    let payload: Value = match serde_json::from_str(&content) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(
                path = %descriptor_file.display(),
                %error,
                "Failed to parse UE endpoint descriptor"
            );
            return None;
        }
    };
    let Some(payload) = payload.as_object() else {
        warn!(
            path = %descriptor_file.display(),
            "Invalid UE endpoint descriptor root"
        );
        return None;
    };

    let ws_url = extract_ws_url(payload)?;

    let project_dir = string_field(payload, "project_dir").map(|raw| {
        normalize_fs_path(&raw, cwd)
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or(raw)
    });

    Some(Candidate {
        ws_url,
        source,
        descriptor_file: descriptor_file.to_string_lossy().into_owned(),
        connection_file: string_field(payload, "connection_file").or(fallback_connection_file),
        instance_id: string_field(payload, "instance_id"),
        project_dir,
        process_id: int_field(payload, "process_id").and_then(|pid| u32::try_from(pid).ok()),
        project_name: string_field(payload, "project_name"),
        heartbeat_at_ms: int_field(payload, "heartbeat_at_ms"),
        updated_at_ms: int_field(payload, "updated_at_ms"),
    })
}

fn extract_ws_url(payload: &serde_json::Map<String, Value>) -> Option<String> {
    if let Some(direct) = payload.get("ws_url").and_then(Value::as_str) {
        if let Some(normalized) = normalize_ws_url(direct) {
            return Some(normalized);
        }
    }

    let transport = payload.get("transport").and_then(Value::as_object);
    if let Some(transport) = transport {
        if let Some(nested) = transport.get("ws_url").and_then(Value::as_str) {
            if let Some(normalized) = normalize_ws_url(nested) {
                return Some(normalized);
            }
        }
    }

    let mut bind_address = string_field(payload, "bind_address");
    let mut port = int_field(payload, "port");
    if let Some(transport) = transport {
        bind_address = string_field(transport, "bind_address").or(bind_address);
        port = int_field(transport, "port").or(port);
    }

    let bind_address = bind_address?;
    let port = port.filter(|p| *p > 0)?;
    let host = normalize_connect_host(&bind_address);
    Some(format!("ws://{host}:{port}"))
}

fn string_field(payload: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn int_field(payload: &serde_json::Map<String, Value>, key: &str) -> Option<i64> {
    match payload.get(key) {
        Some(Value::Bool(_)) | None => None,
        Some(Value::Number(number)) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|value| value as i64)),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        Some(_) => None,
    }
}

fn filter_by_selector<'a>(
    candidates: &'a [Candidate],
    selector: &EndpointSelector,
    cwd: &Path,
) -> Vec<&'a Candidate> {
    if !selector.has_any() {
        return candidates.iter().collect();
    }

    let selector_project_dir = selector.project_dir.as_deref().map(|raw| {
        normalize_fs_path(raw, cwd)
            .map(|path| path.to_string_lossy().into_owned())
            .unwrap_or_else(|| raw.to_string())
            .to_lowercase()
    });

    candidates
        .iter()
        .filter(|candidate| {
            if let Some(instance_id) = &selector.instance_id {
                if candidate.instance_id.as_deref() != Some(instance_id.as_str()) {
                    return false;
                }
            }
            if let Some(process_id) = selector.process_id {
                if candidate.process_id != Some(process_id) {
                    return false;
                }
            }
            if let Some(selector_dir) = &selector_project_dir {
                match &candidate.project_dir {
                    Some(candidate_dir) if candidate_dir.to_lowercase() == *selector_dir => {}
                    _ => return false,
                }
            }
            true
        })
        .collect()
}

fn describe_candidate(candidate: &Candidate) -> String {
    format!(
        "- ws_url={} instance_id={} process_id={} project_dir={} source={} descriptor={}",
        candidate.ws_url,
        candidate.instance_id.as_deref().unwrap_or("-"),
        candidate
            .process_id
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "-".to_string()),
        candidate.project_dir.as_deref().unwrap_or("-"),
        candidate.source,
        candidate.descriptor_file,
    )
}

fn ambiguous_error_message(candidates: &[&Candidate]) -> String {
    let mut lines = vec![
        format!(
            "Multiple UE endpoints matched. Set {ENV_INSTANCE_ID}, {ENV_PROJECT_DIR}, or {ENV_PROCESS_ID}."
        ),
        "Matched endpoints:".to_string(),
    ];
    for candidate in candidates.iter().take(MAX_LISTED_CANDIDATES) {
        lines.push(describe_candidate(candidate));
    }
    lines.join("\n")
}

fn no_match_error_message(selector: &EndpointSelector, candidates: &[Candidate]) -> String {
    let mut lines = vec![
        format!(
            "No UE endpoint matched selector: instance_id={} project_dir={} process_id={}",
            selector.instance_id.as_deref().unwrap_or("-"),
            selector.project_dir.as_deref().unwrap_or("-"),
            selector
                .process_id
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ),
        "Available endpoints:".to_string(),
    ];
    for candidate in candidates.iter().take(MAX_LISTED_CANDIDATES) {
        lines.push(describe_candidate(candidate));
    }
    lines.join("\n")
}
