use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use uemcp_config::AppConfig;
use uemcp_core::{BridgeError, RuntimeMetrics, ToolInvoker};
use uemcp_endpoint::{
    EndpointCandidate, EndpointSelector, list_endpoint_candidates, os_env, resolve_ws_endpoint,
};
use uemcp_service::passthrough::{PassThroughService, PassThroughSettings, ToolCall};
use uemcp_service::{HealthProbe, ToolCatalog};
use uemcp_transport::{EventRouter, McpFacade, RequestBroker, TransportOptions, UeWsTransport};

use crate::dispatch::RequestDispatcher;
use crate::stdio::McpStdioServer;

/// What the process does after connecting.
#[derive(Debug)]
pub enum RunMode {
    /// Serve MCP JSON-RPC over stdin/stdout until EOF.
    Stdio,
    OnceHealth,
    OnceTools,
    CallTool {
        tool: String,
        params: Map<String, Value>,
        context: Map<String, Value>,
        timeout_ms: Option<u64>,
        stream_events: bool,
    },
}

fn current_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

/// `--once-endpoints`: list candidates and the would-be resolution, no
/// connection attempted.
pub fn run_once_endpoints(config: &AppConfig, selector: Option<&EndpointSelector>) -> i32 {
    let payload = build_endpoint_listing_payload(config, selector);
    println!("{payload}");
    0
}

/// Resolve the endpoint, bring up the transport and catalog, run `mode`.
pub async fn run(config: AppConfig, selector: Option<&EndpointSelector>, mode: RunMode, print_metrics: bool) -> i32 {
    let env = os_env();
    let cwd = current_dir();
    let resolution = match resolve_ws_endpoint(&config, &env, &cwd, selector) {
        Ok(resolution) => resolution,
        Err(selection_error) => {
            error!(error = %selection_error, "UE endpoint selection failed");
            error!(
                candidates = %build_endpoint_listing_payload(&config, selector),
                "UE endpoint candidates snapshot"
            );
            return 2;
        }
    };

    info!(ws_url = %resolution.ws_url, source = %resolution.source, "Resolved UE WS endpoint");
    if let Some(connection_file) = &resolution.connection_file {
        info!(path = %connection_file, "Using UE connection file");
    }
    if let Some(instance_id) = &resolution.instance_id {
        info!(
            instance_id = %instance_id,
            project_dir = resolution.project_dir.as_deref().unwrap_or("-"),
            process_id = %resolution.process_id.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into()),
            project_name = resolution.project_name.as_deref().unwrap_or("-"),
            "Resolved UE instance"
        );
    }
    info!(
        default_timeout_ms = config.request.default_timeout_ms,
        "Default request timeout"
    );

    let metrics = config
        .metrics
        .enabled
        .then(|| Arc::new(RuntimeMetrics::new()));
    let broker = Arc::new(RequestBroker::new(
        config.request.default_timeout_ms,
        metrics.clone(),
    ));
    let events = Arc::new(EventRouter::new(metrics.clone()));

    let mut options = TransportOptions::new(resolution.ws_url.clone());
    options.connect_timeout_ms = config.ue.connect_timeout_ms;
    options.ping_interval_ms = config.ue.ping_interval_ms;
    options.reconnect_initial_delay_ms = config.ue.reconnect.initial_delay_ms;
    options.reconnect_max_delay_ms = config.ue.reconnect.max_delay_ms;
    options.expected_instance_id = resolution.instance_id.clone();
    options.expected_process_id = resolution.process_id;
    options.expected_project_dir = resolution.project_dir.clone();
    let transport = Arc::new(UeWsTransport::new(
        options,
        broker.clone(),
        events.clone(),
        metrics.clone(),
    ));

    let facade: Arc<McpFacade> = Arc::new(McpFacade::new(transport.clone(), None));
    let invoker: Arc<dyn ToolInvoker> = facade.clone();
    let catalog = Arc::new(ToolCatalog::new());
    let pass_through = Arc::new(PassThroughService::new(
        invoker.clone(),
        catalog,
        events.clone(),
        PassThroughSettings::from_config(&config),
        metrics.clone(),
    ));

    if let Some(metrics) = &metrics {
        metrics.inc("app.start");
    }
    transport.start();
    if let Err(connect_error) = transport
        .wait_until_connected(Some(Duration::from_millis(config.ue.connect_timeout_ms)))
        .await
    {
        error!(
            error = %connect_error,
            ws_url = %resolution.ws_url,
            "Failed to connect UE WS within timeout"
        );
        transport.stop().await;
        return 3;
    }

    let stop = CancellationToken::new();
    let metrics_task = match (&metrics, config.metrics.log_interval_ms) {
        (Some(metrics), interval_ms) if interval_ms > 0 => Some(tokio::spawn(metrics_log_loop(
            metrics.clone(),
            Duration::from_millis(interval_ms),
            stop.clone(),
        ))),
        _ => None,
    };

    let stream_mode = matches!(
        mode,
        RunMode::CallTool {
            stream_events: true,
            ..
        }
    );
    let exit_code = match pass_through.start().await {
        Err(guard_error @ BridgeError::CatalogGuard(_)) => {
            error!(error = %guard_error, "Catalog guard failed");
            if !matches!(mode, RunMode::Stdio) {
                print_error_payload(
                    "MCP.SERVER.CATALOG_GUARD_FAILED",
                    &guard_error.to_string(),
                    false,
                    stream_mode,
                );
            }
            4
        }
        Err(start_error) => {
            error!(error = %start_error, "Pass-through startup failed");
            start_error.exit_code()
        }
        Ok(()) => {
            run_mode(mode, &pass_through, &invoker, metrics.as_deref(), print_metrics).await
        }
    };

    stop.cancel();
    if let Some(task) = metrics_task {
        let _ = task.await;
    }
    pass_through.stop().await;
    transport.stop().await;
    if let Some(metrics) = &metrics {
        metrics.inc("app.stop");
    }
    exit_code
}

async fn run_mode(
    mode: RunMode,
    pass_through: &Arc<PassThroughService>,
    invoker: &Arc<dyn ToolInvoker>,
    metrics: Option<&RuntimeMetrics>,
    print_metrics: bool,
) -> i32 {
    match mode {
        RunMode::Stdio => {
            let dispatcher = Arc::new(RequestDispatcher::new(pass_through.clone()));
            let server = McpStdioServer::new(dispatcher);
            server.run().await
        }
        RunMode::OnceHealth => {
            let probe = HealthProbe::new(invoker.clone());
            match probe.check_once().await {
                Ok(snapshot) => {
                    info!(ok = snapshot.ok, latency_ms = snapshot.latency_ms, "Health snapshot");
                    println!("{}", Value::Object(snapshot.payload.clone()));
                    maybe_print_metrics(metrics, print_metrics, false);
                    0
                }
                Err(health_error) => {
                    error!(error = %health_error, "Health check failed");
                    print_error_payload(
                        internal_code(&health_error),
                        &health_error.to_string(),
                        health_error.is_transient(),
                        false,
                    );
                    maybe_print_metrics(metrics, print_metrics, false);
                    health_error.exit_code()
                }
            }
        }
        RunMode::OnceTools => {
            let payload = json!({
                "protocol_version": pass_through.protocol_version(),
                "schema_hash": pass_through.schema_hash(),
                "last_refresh_ms": pass_through.last_refresh_ms(),
                "tools": pass_through.list_tools(),
            });
            println!("{payload}");
            maybe_print_metrics(metrics, print_metrics, false);
            0
        }
        RunMode::CallTool {
            tool,
            params,
            context,
            timeout_ms,
            stream_events,
        } => {
            let mut call = ToolCall::new(tool);
            call.params = params;
            call.context = context;
            call.timeout_ms = timeout_ms;

            let outcome = if stream_events {
                pass_through
                    .call_tool_stream(
                        call,
                        |event| async move {
                            println!("{}", json!({"type": "event", "event": event.to_value()}));
                        },
                        Duration::from_millis(100),
                    )
                    .await
            } else {
                pass_through.call_tool(call).await
            };

            let exit_code = match outcome {
                Ok(result) => {
                    let payload = json!({
                        "ok": result.ok,
                        "status": result.status,
                        "request_id": result.request_id,
                        "result": result.result,
                        "diagnostics": result.diagnostics,
                        "raw_envelope": result.raw_envelope,
                    });
                    if stream_events {
                        println!("{}", json!({"type": "result", "result": payload}));
                    } else {
                        println!("{payload}");
                    }
                    if result.ok && result.status != "error" { 0 } else { 5 }
                }
                Err(call_error @ (BridgeError::UnknownTool(_) | BridgeError::ToolDisabled(_))) => {
                    error!(error = %call_error, "Tool not available");
                    print_error_payload(
                        "MCP.SERVER.TOOL_NOT_FOUND",
                        &call_error.to_string(),
                        false,
                        stream_events,
                    );
                    4
                }
                Err(call_error) => {
                    error!(error = %call_error, "Tool call failed");
                    print_error_payload(
                        internal_code(&call_error),
                        &call_error.to_string(),
                        call_error.is_transient(),
                        stream_events,
                    );
                    6
                }
            };
            maybe_print_metrics(metrics, print_metrics, stream_events);
            exit_code
        }
    }
}

fn internal_code(error: &BridgeError) -> &'static str {
    if error.is_transient() {
        "MCP.SERVER.TRANSIENT_FAILURE"
    } else {
        "MCP.SERVER.INTERNAL"
    }
}

fn print_error_payload(code: &str, message: &str, retriable: bool, stream_events: bool) {
    let payload = json!({
        "code": code,
        "message": message,
        "retriable": retriable,
    });
    if stream_events {
        println!("{}", json!({"type": "error", "error": payload}));
    } else {
        println!("{}", json!({"error": payload}));
    }
}

fn maybe_print_metrics(metrics: Option<&RuntimeMetrics>, print_metrics: bool, stream_events: bool) {
    let Some(metrics) = metrics else {
        return;
    };
    if !print_metrics {
        return;
    }
    let snapshot = metrics.snapshot();
    if stream_events {
        println!("{}", json!({"type": "metrics", "metrics": snapshot}));
    } else {
        println!("{}", json!({"metrics": snapshot}));
    }
}

async fn metrics_log_loop(metrics: Arc<RuntimeMetrics>, interval: Duration, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if stop.is_cancelled() {
            return;
        }
        info!(metrics = %metrics.snapshot(), "runtime.metrics");
    }
}

pub fn build_endpoint_listing_payload(
    config: &AppConfig,
    selector: Option<&EndpointSelector>,
) -> Value {
    let env = os_env();
    let cwd = current_dir();
    let candidates = list_endpoint_candidates(config, &env, &cwd, selector, false);

    let mut payload = json!({
        "selector": selector_payload(selector),
        "candidate_count": candidates.len(),
        "candidates": candidates.iter().map(candidate_payload).collect::<Vec<Value>>(),
    });

    match resolve_ws_endpoint(config, &env, &cwd, selector) {
        Ok(resolution) => {
            payload["resolved"] = json!({
                "ws_url": resolution.ws_url,
                "source": resolution.source,
                "instance_id": resolution.instance_id,
                "project_dir": resolution.project_dir,
                "process_id": resolution.process_id,
                "project_name": resolution.project_name,
                "connection_file": resolution.connection_file,
            });
        }
        Err(resolution_error) => {
            payload["resolution_error"] = json!(resolution_error.to_string());
        }
    }
    payload
}

fn selector_payload(selector: Option<&EndpointSelector>) -> Value {
    match selector {
        None => json!({
            "instance_id": Value::Null,
            "project_dir": Value::Null,
            "process_id": Value::Null,
        }),
        Some(selector) => json!({
            "instance_id": selector.instance_id,
            "project_dir": selector.project_dir,
            "process_id": selector.process_id,
        }),
    }
}

fn candidate_payload(candidate: &EndpointCandidate) -> Value {
    json!({
        "ws_url": candidate.ws_url,
        "source": candidate.source,
        "instance_id": candidate.instance_id,
        "project_dir": candidate.project_dir,
        "process_id": candidate.process_id,
        "project_name": candidate.project_name,
        "connection_file": candidate.connection_file,
        "descriptor_file": candidate.descriptor_file,
        "heartbeat_at_ms": candidate.heartbeat_at_ms,
        "updated_at_ms": candidate.updated_at_ms,
        "stale": candidate.stale,
        "selector_hint": candidate.selector_hint(),
    })
}
