use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use uemcp_config::AppConfig;
use uemcp_core::metrics::now_ms;
use uemcp_core::retry::next_backoff_delay;
use uemcp_core::{BridgeError, Result, RuntimeMetrics, ToolCallResult, ToolCallSpec, ToolInvoker};
use uemcp_transport::events::{DEFAULT_SUBSCRIPTION_QUEUE, EventRouter, NormalizedEvent};

use crate::catalog::{ToolCatalog, ToolDefinition};

/// One pass-through tool call.
#[derive(Debug, Clone)]
pub struct ToolCall {
    pub tool: String,
    pub params: Map<String, Value>,
    pub context: Map<String, Value>,
    pub timeout_ms: Option<u64>,
    pub request_id: Option<String>,
    pub allow_retry: bool,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            params: Map::new(),
            context: Map::new(),
            timeout_ms: None,
            request_id: None,
            allow_retry: true,
        }
    }
}

/// Knobs for catalog refresh, guard rules, and transient retry.
#[derive(Debug, Clone)]
pub struct PassThroughSettings {
    pub include_schemas: bool,
    pub refresh_interval_ms: u64,
    pub transient_max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub required_tools: Vec<String>,
    pub pin_schema_hash: String,
    pub fail_on_schema_change: bool,
}

impl Default for PassThroughSettings {
    fn default() -> Self {
        Self {
            include_schemas: true,
            refresh_interval_ms: 60_000,
            transient_max_attempts: 2,
            backoff_initial_ms: 200,
            backoff_max_ms: 1_000,
            required_tools: Vec::new(),
            pin_schema_hash: String::new(),
            fail_on_schema_change: false,
        }
    }
}

impl PassThroughSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            include_schemas: config.catalog.include_schemas,
            refresh_interval_ms: config.catalog.refresh_interval_ms,
            transient_max_attempts: config.retry.transient_max_attempts,
            backoff_initial_ms: config.retry.backoff_initial_ms,
            backoff_max_ms: config.retry.backoff_max_ms,
            required_tools: config.catalog.required_tools.clone(),
            pin_schema_hash: config.catalog.pin_schema_hash.clone(),
            fail_on_schema_change: config.catalog.fail_on_schema_change,
        }
    }
}

/// The shared core of the pass-through service; cheap to clone into the
/// periodic refresh task and spawned stream calls.
struct Engine {
    invoker: Arc<dyn ToolInvoker>,
    catalog: Arc<ToolCatalog>,
    events: Arc<EventRouter>,
    settings: PassThroughSettings,
    baseline_schema_hash: StdMutex<Option<String>>,
    refresh_lock: Mutex<()>,
    last_refresh_ms: AtomicI64,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl Engine {
    async fn refresh_catalog(&self) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;

        let max_attempts = self.settings.transient_max_attempts;
        let max_delay = Duration::from_millis(self.settings.backoff_max_ms);
        let mut delay = Duration::from_millis(self.settings.backoff_initial_ms);
        let mut attempt = 1u32;

        loop {
            let outcome = async {
                self.catalog
                    .refresh(self.invoker.as_ref(), self.settings.include_schemas)
                    .await?;
                self.validate_catalog_guard()
            }
            .await;

            match outcome {
                Ok(()) => {
                    self.last_refresh_ms.store(now_ms(), Ordering::Relaxed);
                    info!(
                        tools = self.catalog.tool_count(),
                        protocol = %self.catalog.protocol_version(),
                        schema_hash = %self.catalog.schema_hash(),
                        "Tool catalog refreshed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.inc("tool_passthrough.catalog_refresh_success");
                        metrics.set_gauge(
                            "tool_passthrough.catalog_tool_count",
                            self.catalog.tool_count() as f64,
                        );
                    }
                    return Ok(());
                }
                Err(refresh_error) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.inc("tool_passthrough.catalog_refresh_failed");
                    }
                    if attempt >= max_attempts || !refresh_error.is_transient() {
                        return Err(refresh_error);
                    }
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %refresh_error,
                        "Catalog refresh retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    delay = next_backoff_delay(delay, max_delay);
                }
            }
        }
    }

    async fn call_tool(&self, call: ToolCall) -> Result<ToolCallResult> {
        let definition = self.resolve_tool_definition(&call.tool).await?;
        if !definition.enabled {
            return Err(BridgeError::ToolDisabled(call.tool.clone()));
        }

        let max_attempts = if call.allow_retry {
            self.settings.transient_max_attempts
        } else {
            1
        };
        let max_delay = Duration::from_millis(self.settings.backoff_max_ms);
        let mut delay = Duration::from_millis(self.settings.backoff_initial_ms);
        let mut attempt = 1u32;
        let mut retry_count = 0u64;
        let started_at = Instant::now();

        loop {
            let attempt_request_id = call.request_id.as_ref().map(|base| {
                if attempt > 1 {
                    format!("{base}-r{attempt}")
                } else {
                    base.clone()
                }
            });

            let mut spec = ToolCallSpec::new(call.tool.clone());
            spec.params = call.params.clone();
            spec.context = call.context.clone();
            spec.timeout_ms = call.timeout_ms;
            spec.request_id = attempt_request_id;
            spec.raise_on_error = false;

            match self.invoker.call_tool(spec).await {
                Err(call_error) => {
                    if attempt < max_attempts && call_error.is_transient() {
                        self.on_retry(&call.tool, attempt, delay, &call_error.to_string());
                        retry_count += 1;
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        delay = next_backoff_delay(delay, max_delay);
                        continue;
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_tool_exception(
                            &call.tool,
                            call_error.kind(),
                            started_at.elapsed().as_millis() as u64,
                            retry_count,
                        );
                    }
                    return Err(call_error);
                }
                Ok(result) => {
                    if attempt < max_attempts
                        && result.status == "error"
                        && result.has_retriable_error()
                    {
                        let reason = result.first_error_summary();
                        self.on_retry(&call.tool, attempt, delay, &reason);
                        retry_count += 1;
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        delay = next_backoff_delay(delay, max_delay);
                        continue;
                    }
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_tool_result(
                            &call.tool,
                            &result.status,
                            started_at.elapsed().as_millis() as u64,
                            retry_count,
                        );
                    }
                    return Ok(result);
                }
            }
        }
    }

    async fn resolve_tool_definition(&self, tool: &str) -> Result<ToolDefinition> {
        if let Some(definition) = self.catalog.get_tool(tool) {
            return Ok(definition);
        }

        self.refresh_catalog().await?;
        self.catalog
            .get_tool(tool)
            .ok_or_else(|| BridgeError::UnknownTool(tool.to_string()))
    }

    fn on_retry(&self, tool: &str, attempt: u32, delay: Duration, reason: &str) {
        warn!(
            tool,
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Retrying tool call"
        );
        if let Some(metrics) = &self.metrics {
            metrics.inc("tool_passthrough.retry");
            metrics.inc(&format!("tool_passthrough.retry_tool.{tool}"));
        }
    }

    fn validate_catalog_guard(&self) -> Result<()> {
        if !self.settings.required_tools.is_empty() {
            let available: std::collections::HashSet<String> = self
                .catalog
                .tools()
                .into_iter()
                .map(|tool| tool.name)
                .collect();
            let missing: Vec<&str> = self
                .settings
                .required_tools
                .iter()
                .filter(|tool| !available.contains(tool.as_str()))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                return Err(BridgeError::CatalogGuard(format!(
                    "Missing required tools after catalog refresh: {}",
                    missing.join(", ")
                )));
            }
        }

        let schema_hash = self.catalog.schema_hash().trim().to_uppercase();
        if !self.settings.pin_schema_hash.is_empty() && schema_hash != self.settings.pin_schema_hash
        {
            return Err(BridgeError::CatalogGuard(format!(
                "schema_hash mismatch: expected={} actual={}",
                self.settings.pin_schema_hash,
                if schema_hash.is_empty() { "-" } else { schema_hash.as_str() }
            )));
        }

        if !self.settings.fail_on_schema_change || schema_hash.is_empty() {
            return Ok(());
        }

        let mut baseline = self
            .baseline_schema_hash
            .lock()
            .expect("baseline lock poisoned");
        match baseline.as_ref() {
            None => {
                *baseline = Some(schema_hash);
                Ok(())
            }
            Some(existing) if *existing == schema_hash => Ok(()),
            Some(existing) => Err(BridgeError::CatalogGuard(format!(
                "schema_hash changed during runtime: baseline={existing} current={schema_hash}"
            ))),
        }
    }
}

/// Calls downstream tools through the synchronized catalog, retrying
/// transient failures and streaming correlated events on request.
pub struct PassThroughService {
    engine: Arc<Engine>,
    stop: CancellationToken,
    refresh_task: StdMutex<Option<JoinHandle<()>>>,
}

impl PassThroughService {
    pub fn new(
        invoker: Arc<dyn ToolInvoker>,
        catalog: Arc<ToolCatalog>,
        events: Arc<EventRouter>,
        settings: PassThroughSettings,
        metrics: Option<Arc<RuntimeMetrics>>,
    ) -> Self {
        let mut settings = settings;
        settings.transient_max_attempts = settings.transient_max_attempts.max(1);
        settings.pin_schema_hash = settings.pin_schema_hash.trim().to_uppercase();
        settings.required_tools = settings
            .required_tools
            .iter()
            .map(|tool| tool.trim().to_string())
            .filter(|tool| !tool.is_empty())
            .collect();

        Self {
            engine: Arc::new(Engine {
                invoker,
                catalog,
                events,
                settings,
                baseline_schema_hash: StdMutex::new(None),
                refresh_lock: Mutex::new(()),
                last_refresh_ms: AtomicI64::new(0),
                metrics,
            }),
            stop: CancellationToken::new(),
            refresh_task: StdMutex::new(None),
        }
    }

    pub fn last_refresh_ms(&self) -> i64 {
        self.engine.last_refresh_ms.load(Ordering::Relaxed)
    }

    pub fn protocol_version(&self) -> String {
        self.engine.catalog.protocol_version()
    }

    pub fn schema_hash(&self) -> String {
        self.engine.catalog.schema_hash()
    }

    pub fn list_tools(&self) -> Vec<ToolDefinition> {
        self.engine.catalog.tools()
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.engine.catalog.has_capability(capability)
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.engine.catalog.capabilities()
    }

    /// Initial refresh plus the periodic refresh task (when configured).
    pub async fn start(&self) -> Result<()> {
        self.engine.refresh_catalog().await?;

        let interval_ms = self.engine.settings.refresh_interval_ms;
        if interval_ms > 0 {
            let engine = self.engine.clone();
            let stop = self.stop.clone();
            let task = tokio::spawn(refresh_loop(engine, stop, Duration::from_millis(interval_ms)));
            *self.refresh_task.lock().expect("refresh task lock poisoned") = Some(task);
        }
        Ok(())
    }

    pub async fn stop(&self) {
        self.stop.cancel();
        let task = self
            .refresh_task
            .lock()
            .expect("refresh task lock poisoned")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    pub async fn refresh_catalog(&self) -> Result<()> {
        self.engine.refresh_catalog().await
    }

    /// Call one downstream tool, retrying transient failures and
    /// `retriable: true` tool errors up to the configured attempt limit.
    /// Retries use `-r2`, `-r3`, ... request-id suffixes so the peer logs
    /// each attempt distinctly.
    pub async fn call_tool(&self, call: ToolCall) -> Result<ToolCallResult> {
        self.engine.call_tool(call).await
    }

    /// Call one tool while pumping its correlated events to `on_event`.
    ///
    /// The call runs without retry (event streams must not interleave
    /// attempts); remaining events are drained after completion and the
    /// subscription is closed on every exit path.
    pub async fn call_tool_stream<F, Fut>(
        &self,
        call: ToolCall,
        mut on_event: F,
        poll_interval: Duration,
    ) -> Result<ToolCallResult>
    where
        F: FnMut(NormalizedEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        if poll_interval.is_zero() {
            return Err(BridgeError::Argument("poll_interval must be > 0".into()));
        }

        let request_id = call
            .request_id
            .clone()
            .unwrap_or_else(|| format!("req-{}", uuid::Uuid::new_v4().simple()));
        let mut subscription = self
            .engine
            .events
            .subscribe(Some(&request_id), DEFAULT_SUBSCRIPTION_QUEUE);

        let task = {
            let engine = self.engine.clone();
            let mut call = call;
            call.request_id = Some(request_id);
            call.allow_retry = false;
            tokio::spawn(async move { engine.call_tool(call).await })
        };

        while !task.is_finished() {
            if let Some(event) = subscription.recv(Some(poll_interval)).await {
                on_event(event).await;
            }
        }
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(BridgeError::Connection(format!(
                "Tool call task failed: {join_error}"
            ))),
        };

        while let Some(event) = subscription.try_recv() {
            on_event(event).await;
        }
        subscription.close();
        outcome
    }
}

impl std::fmt::Debug for PassThroughService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassThroughService")
            .field("tools", &self.engine.catalog.tool_count())
            .field("last_refresh_ms", &self.last_refresh_ms())
            .finish()
    }
}

/// Periodic refresh. A guard violation with `fail_on_schema_change` ends
/// the loop; any other failure is logged and the loop keeps going.
async fn refresh_loop(engine: Arc<Engine>, stop: CancellationToken, interval: Duration) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        if stop.is_cancelled() {
            return;
        }

        match engine.refresh_catalog().await {
            Ok(()) => {}
            Err(BridgeError::CatalogGuard(message)) => {
                error!(%message, "Tool catalog guard failed");
                if engine.settings.fail_on_schema_change {
                    return;
                }
            }
            Err(refresh_error) => {
                error!(error = %refresh_error, "Tool catalog refresh failed");
            }
        }
    }
}

/// What the virtual-tool orchestrators need from the pass-through layer.
#[async_trait]
pub trait ToolGateway: Send + Sync {
    async fn call_tool(&self, call: ToolCall) -> Result<ToolCallResult>;
    fn list_tools(&self) -> Vec<ToolDefinition>;
    fn has_capability(&self, capability: &str) -> bool;
    fn capabilities(&self) -> Vec<String>;
}

#[async_trait]
impl ToolGateway for PassThroughService {
    async fn call_tool(&self, call: ToolCall) -> Result<ToolCallResult> {
        PassThroughService::call_tool(self, call).await
    }

    fn list_tools(&self) -> Vec<ToolDefinition> {
        PassThroughService::list_tools(self)
    }

    fn has_capability(&self, capability: &str) -> bool {
        PassThroughService::has_capability(self, capability)
    }

    fn capabilities(&self) -> Vec<String> {
        PassThroughService::capabilities(self)
    }
}
