use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use uemcp_core::retry::next_backoff_delay;
use uemcp_core::{BridgeError, Result, RuntimeMetrics, UeResponse, parse_json_message};
use uemcp_endpoint::wsl;

use crate::broker::{RequestBroker, ToolRequest};
use crate::events::EventRouter;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Connection settings plus the optional peer identity to validate during
/// the `mcp.transport.connected` handshake.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub ws_url: String,
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub expected_instance_id: Option<String>,
    pub expected_process_id: Option<u32>,
    pub expected_project_dir: Option<String>,
}

impl TransportOptions {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            connect_timeout_ms: 10_000,
            ping_interval_ms: 10_000,
            reconnect_initial_delay_ms: 500,
            reconnect_max_delay_ms: 10_000,
            expected_instance_id: None,
            expected_process_id: None,
            expected_project_dir: None,
        }
    }
}

struct TransportInner {
    options: TransportOptions,
    require_handshake: bool,
    broker: Arc<RequestBroker>,
    events: Arc<EventRouter>,
    metrics: Option<Arc<RuntimeMetrics>>,
    candidates: StdMutex<Vec<String>>,
    sink: Mutex<Option<WsSink>>,
    connected: watch::Sender<bool>,
    handshake_valid: watch::Sender<bool>,
}

/// Owns the single WebSocket to the tool host.
///
/// `start` spawns a connect loop that keeps exactly one connection alive,
/// reconnecting with doubling backoff. On every disconnect all pending
/// broker requests fail immediately with a connection error.
pub struct UeWsTransport {
    inner: Arc<TransportInner>,
    stop: StdMutex<CancellationToken>,
    run_task: StdMutex<Option<JoinHandle<()>>>,
}

impl UeWsTransport {
    pub fn new(
        options: TransportOptions,
        broker: Arc<RequestBroker>,
        events: Arc<EventRouter>,
        metrics: Option<Arc<RuntimeMetrics>>,
    ) -> Self {
        let mut options = options;
        options.expected_instance_id = options
            .expected_instance_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        options.expected_process_id = options.expected_process_id.filter(|pid| *pid > 0);
        options.expected_project_dir = options
            .expected_project_dir
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(normalize_project_dir);

        let require_handshake = options.expected_instance_id.is_some()
            || options.expected_process_id.is_some()
            || options.expected_project_dir.is_some();

        let candidates = build_ws_url_candidates(&options.ws_url);
        let (connected, _) = watch::channel(false);
        let (handshake_valid, _) = watch::channel(false);

        Self {
            inner: Arc::new(TransportInner {
                options,
                require_handshake,
                broker,
                events,
                metrics,
                candidates: StdMutex::new(candidates),
                sink: Mutex::new(None),
                connected,
                handshake_valid,
            }),
            stop: StdMutex::new(CancellationToken::new()),
            run_task: StdMutex::new(None),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn ws_url_candidates(&self) -> Vec<String> {
        self.inner
            .candidates
            .lock()
            .expect("candidates lock poisoned")
            .clone()
    }

    /// Spawn the connect loop. Idempotent while the loop is running.
    pub fn start(&self) {
        let mut run_task = self.run_task.lock().expect("run task lock poisoned");
        if let Some(task) = run_task.as_ref() {
            if !task.is_finished() {
                return;
            }
        }

        let stop = CancellationToken::new();
        *self.stop.lock().expect("stop lock poisoned") = stop.clone();
        if let Some(metrics) = &self.inner.metrics {
            metrics.inc("ue_transport.start_called");
        }
        let inner = self.inner.clone();
        *run_task = Some(tokio::spawn(run_forever(inner, stop)));
    }

    /// Stop the connect loop and close the socket.
    pub async fn stop(&self) {
        self.stop.lock().expect("stop lock poisoned").cancel();

        if let Some(mut sink) = self.inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }

        let task = self.run_task.lock().expect("run task lock poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Some(metrics) = &self.inner.metrics {
            metrics.inc("ue_transport.stop_called");
            metrics.set_gauge("ue_transport.connected", 0.0);
        }
    }

    pub async fn wait_until_connected(&self, timeout: Option<Duration>) -> Result<()> {
        self.wait_for_flag(&self.inner.connected, timeout).await
    }

    /// Send one tool request and await its response.
    ///
    /// Blocks until the transport is connected (and, when peer expectations
    /// are configured, until the handshake validated) within the connect
    /// timeout, then hands the request to the broker.
    pub async fn request(&self, request: ToolRequest) -> Result<UeResponse> {
        let connect_timeout = Duration::from_millis(self.inner.options.connect_timeout_ms);
        self.wait_until_connected(Some(connect_timeout)).await?;
        if self.inner.require_handshake {
            self.wait_for_flag(&self.inner.handshake_valid, Some(connect_timeout))
                .await?;
        }

        self.inner
            .broker
            .send_request(|message| self.send_owned(message), request)
            .await
    }

    /// Serialize and send one JSON frame. The send mutex keeps frames whole.
    pub async fn send_json(&self, message: &Value) -> Result<()> {
        let payload = serde_json::to_string(message)
            .map_err(|e| BridgeError::MessageParse(format!("Failed to serialize frame: {e}")))?;

        let mut guard = self.inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(BridgeError::Connection(
                "UE WS transport is not connected.".into(),
            ));
        };
        sink.send(Message::Text(payload.into()))
            .await
            .map_err(|e| BridgeError::Connection(format!("UE WS send failed: {e}")))?;

        if let Some(metrics) = &self.inner.metrics {
            metrics.inc("ue_transport.message_out");
        }
        Ok(())
    }

    async fn send_owned(&self, message: Value) -> Result<()> {
        self.send_json(&message).await
    }

    async fn wait_for_flag(
        &self,
        flag: &watch::Sender<bool>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut receiver = flag.subscribe();
        let wait = async move {
            loop {
                if *receiver.borrow_and_update() {
                    return true;
                }
                if receiver.changed().await.is_err() {
                    return false;
                }
            }
        };

        let reached = match timeout {
            None => wait.await,
            Some(timeout_duration) => {
                match tokio::time::timeout(timeout_duration, wait).await {
                    Ok(reached) => reached,
                    Err(_elapsed) => {
                        return Err(BridgeError::ConnectTimeout {
                            url: self.inner.options.ws_url.clone(),
                            timeout_ms: timeout_duration.as_millis() as u64,
                        });
                    }
                }
            }
        };

        if reached {
            Ok(())
        } else {
            Err(BridgeError::Connection("Transport is shut down.".into()))
        }
    }
}

impl std::fmt::Debug for UeWsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UeWsTransport")
            .field("ws_url", &self.inner.options.ws_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

async fn run_forever(inner: Arc<TransportInner>, stop: CancellationToken) {
    let connect_timeout = Duration::from_millis(inner.options.connect_timeout_ms);
    let initial_delay = Duration::from_millis(inner.options.reconnect_initial_delay_ms);
    let max_delay = Duration::from_millis(inner.options.reconnect_max_delay_ms);
    let mut reconnect_delay = initial_delay;

    while !stop.is_cancelled() {
        let candidate_list = inner
            .candidates
            .lock()
            .expect("candidates lock poisoned")
            .clone();

        let mut connection: Option<(WsStream, String)> = None;
        for candidate_url in candidate_list {
            if stop.is_cancelled() {
                break;
            }
            if let Some(metrics) = &inner.metrics {
                metrics.inc("ue_transport.connect_attempt");
            }
            match tokio::time::timeout(connect_timeout, connect_async(candidate_url.as_str())).await
            {
                Ok(Ok((ws, _response))) => {
                    connection = Some((ws, candidate_url));
                    break;
                }
                Ok(Err(error)) => {
                    if !stop.is_cancelled() {
                        warn!(url = %candidate_url, %error, "UE WS connect failed");
                        if let Some(metrics) = &inner.metrics {
                            metrics.inc("ue_transport.connect_failure");
                        }
                    }
                }
                Err(_elapsed) => {
                    if !stop.is_cancelled() {
                        warn!(url = %candidate_url, "UE WS connect timed out");
                        if let Some(metrics) = &inner.metrics {
                            metrics.inc("ue_transport.connect_failure");
                        }
                    }
                }
            }
        }

        let Some((ws, connected_url)) = connection else {
            if let Some(metrics) = &inner.metrics {
                metrics.set_gauge("ue_transport.connected", 0.0);
                metrics.inc("ue_transport.disconnected");
            }
            if sleep_or_cancelled(&stop, reconnect_delay).await {
                break;
            }
            reconnect_delay = next_backoff_delay(reconnect_delay, max_delay);
            continue;
        };

        // Prefer the last known working endpoint for reconnect.
        {
            let mut candidates = inner.candidates.lock().expect("candidates lock poisoned");
            if candidates.first() != Some(&connected_url) {
                candidates.retain(|url| url != &connected_url);
                candidates.insert(0, connected_url.clone());
            }
        }

        let (sink, stream) = ws.split();
        *inner.sink.lock().await = Some(sink);
        let _ = inner.handshake_valid.send(false);
        let _ = inner.connected.send(true);
        reconnect_delay = initial_delay;
        info!(url = %connected_url, "Connected to UE WS transport");
        if let Some(metrics) = &inner.metrics {
            metrics.inc("ue_transport.connect_success");
            metrics.set_gauge("ue_transport.connected", 1.0);
        }

        let ping_task = tokio::spawn(ping_loop(inner.clone(), stop.clone()));
        let receive_result = receive_loop(&inner, stream, &stop).await;
        ping_task.abort();
        let _ = ping_task.await;

        let _ = inner.connected.send(false);
        let _ = inner.handshake_valid.send(false);
        if let Some(mut sink) = inner.sink.lock().await.take() {
            let _ = sink.close().await;
        }
        inner
            .broker
            .fail_all(BridgeError::Connection("UE WS transport disconnected.".into()));
        if let Some(metrics) = &inner.metrics {
            metrics.set_gauge("ue_transport.connected", 0.0);
            metrics.inc("ue_transport.disconnected");
        }
        if let Err(error) = receive_result {
            if !stop.is_cancelled() {
                warn!(%error, "UE WS transport disconnected");
            }
        }

        if stop.is_cancelled() {
            break;
        }
        if sleep_or_cancelled(&stop, reconnect_delay).await {
            break;
        }
        reconnect_delay = next_backoff_delay(reconnect_delay, max_delay);
    }
}

async fn sleep_or_cancelled(stop: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

async fn ping_loop(inner: Arc<TransportInner>, stop: CancellationToken) {
    let interval = Duration::from_millis(inner.options.ping_interval_ms);
    loop {
        if sleep_or_cancelled(&stop, interval).await {
            return;
        }
        if !*inner.connected.borrow() {
            return;
        }

        let ping = json!({"type": "ping"});
        let payload = ping.to_string();
        let mut guard = inner.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return;
        };
        if let Err(error) = sink.send(Message::Text(payload.into())).await {
            debug!(%error, "Ping loop stopped");
            return;
        }
        drop(guard);
        if let Some(metrics) = &inner.metrics {
            metrics.inc("ue_transport.ping_sent");
        }
    }
}

async fn receive_loop(
    inner: &Arc<TransportInner>,
    mut stream: WsSource,
    stop: &CancellationToken,
) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            frame = stream.next() => frame,
        };
        let Some(frame) = frame else {
            return Ok(());
        };

        match frame {
            Ok(Message::Text(text)) => {
                if let Some(metrics) = &inner.metrics {
                    metrics.inc("ue_transport.message_in_text");
                }
                handle_text_message(inner, text.as_str()).await?;
            }
            Ok(Message::Binary(bytes)) => {
                if let Some(metrics) = &inner.metrics {
                    metrics.inc("ue_transport.message_in_binary");
                }
                match std::str::from_utf8(&bytes) {
                    Ok(text) => handle_text_message(inner, text).await?,
                    Err(_) => {
                        warn!(
                            size = bytes.len(),
                            "Invalid binary WS message (utf-8 decode failed)"
                        );
                    }
                }
            }
            Ok(Message::Close(_)) => return Ok(()),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(error) => {
                return Err(BridgeError::Connection(format!(
                    "UE WS receive failed: {error}"
                )));
            }
        }
    }
}

async fn handle_text_message(inner: &Arc<TransportInner>, raw: &str) -> Result<()> {
    let message = match parse_json_message(raw) {
        Ok(message) => message,
        Err(error) => {
            warn!(%error, "Invalid WS JSON payload");
            return Ok(());
        }
    };

    match inner.broker.resolve_from_message(&message) {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(error) => {
            warn!(%error, "Invalid mcp.response payload");
            return Ok(());
        }
    }

    match message.get("type").and_then(Value::as_str) {
        Some("pong") => {
            debug!("Received UE pong.");
            if let Some(metrics) = &inner.metrics {
                metrics.inc("ue_transport.pong_received");
            }
        }
        Some("mcp.transport.connected") => {
            if let Some(reason) = handshake_mismatch_reason(&inner.options, &message) {
                if let Some(metrics) = &inner.metrics {
                    metrics.inc("ue_transport.handshake_mismatch");
                }
                return Err(BridgeError::Connection(reason));
            }
            if inner.require_handshake {
                let _ = inner.handshake_valid.send(true);
            }
            info!(handshake = %message, "UE transport handshake");
            if let Some(metrics) = &inner.metrics {
                metrics.inc("ue_transport.handshake");
            }
        }
        Some("mcp.transport.error") => {
            warn!(error = %message, "UE transport error");
            if let Some(metrics) = &inner.metrics {
                metrics.inc("ue_transport.transport_error");
            }
        }
        _ => {
            if message.get("event_type").is_some() {
                inner.events.publish(&message);
                if let Some(metrics) = &inner.metrics {
                    metrics.inc("ue_transport.event_forwarded");
                }
            } else {
                debug!(message = %message, "Unhandled WS message");
            }
        }
    }
    Ok(())
}

pub(crate) fn handshake_mismatch_reason(
    options: &TransportOptions,
    message: &Value,
) -> Option<String> {
    if let Some(expected) = &options.expected_instance_id {
        let actual = message.get("instance_id").and_then(Value::as_str);
        if actual != Some(expected.as_str()) {
            return Some(format!(
                "UE handshake instance mismatch: expected={expected} actual={}",
                actual.unwrap_or("-")
            ));
        }
    }

    if let Some(expected) = options.expected_process_id {
        let actual = message.get("process_id").and_then(|value| match value {
            Value::Number(number) => number.as_u64().and_then(|pid| u32::try_from(pid).ok()),
            Value::String(text) => text.trim().parse::<u32>().ok(),
            _ => None,
        });
        if actual != Some(expected) {
            return Some(format!(
                "UE handshake process mismatch: expected={expected} actual={}",
                actual.map(|pid| pid.to_string()).unwrap_or_else(|| "-".into())
            ));
        }
    }

    if let Some(expected) = &options.expected_project_dir {
        let actual = message
            .get("project_dir")
            .and_then(Value::as_str)
            .map(normalize_project_dir);
        if actual.as_deref() != Some(expected.as_str()) {
            return Some(format!(
                "UE handshake project_dir mismatch: expected={expected} actual={}",
                actual.as_deref().unwrap_or("-")
            ));
        }
    }

    None
}

/// Project directories arrive in both Windows and POSIX spellings; compare
/// them in one canonical lowercase form.
pub(crate) fn normalize_project_dir(raw: &str) -> String {
    let mut value = raw.trim().replace('\\', "/");
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let drive = bytes[0].to_ascii_lowercase() as char;
        let suffix = value[2..].trim_start_matches('/').to_string();
        value = format!("/mnt/{drive}/{suffix}");
    }
    value.trim_end_matches('/').to_lowercase()
}

/// Configured URL first; under WSL a loopback host also gets a
/// `ws://<default-gateway>:<port>` fallback for editors on the Windows side.
fn build_ws_url_candidates(ws_url: &str) -> Vec<String> {
    let mut candidates = vec![ws_url.to_string()];

    if !wsl::is_wsl() {
        return candidates;
    }
    let Ok(parsed) = Url::parse(ws_url) else {
        return candidates;
    };
    let host = parsed.host_str().unwrap_or("");
    if !matches!(host, "127.0.0.1" | "localhost") {
        return candidates;
    }
    let Some(gateway_ip) = wsl::default_gateway_ip() else {
        return candidates;
    };

    let port = parsed
        .port_or_known_default()
        .unwrap_or(if parsed.scheme() == "wss" { 443 } else { 80 });
    let mut fallback = format!("{}://{}:{}", parsed.scheme(), gateway_ip, port);
    if parsed.path() != "/" && !parsed.path().is_empty() {
        fallback.push_str(parsed.path());
    }
    if fallback != ws_url {
        info!(primary = %ws_url, %fallback, "WSL detected; adding Windows-host fallback endpoint");
        candidates.push(fallback);
    }
    candidates
}
