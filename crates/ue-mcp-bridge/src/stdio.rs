use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{Value, json};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use uemcp_core::{BridgeError, Result};

use crate::dispatch::{
    JSONRPC_INVALID_REQUEST, JSONRPC_PARSE_ERROR, RequestDispatcher, make_jsonrpc_error,
};

/// Framing detected from the first byte of a session: either one JSON object
/// per line, or `Content-Length`-prefixed blocks. Sticky per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingMode {
    Framed,
    JsonLines,
}

fn read_line_bytes<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let read = reader
        .read_until(b'\n', &mut line)
        .map_err(|e| BridgeError::MessageParse(format!("stdin read failed: {e}")))?;
    if read == 0 {
        return Ok(None);
    }
    while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

fn parse_json_payload(payload: &[u8], error_message: &str) -> Result<Value> {
    serde_json::from_slice(payload)
        .map_err(|e| BridgeError::MessageParse(format!("{error_message}: {e}")))
}

fn header_key_value(line: &[u8]) -> Result<(String, String)> {
    let colon = line
        .iter()
        .position(|byte| *byte == b':')
        .ok_or_else(|| BridgeError::MessageParse("Malformed header line.".into()))?;
    let (key, value) = line.split_at(colon);
    let key = std::str::from_utf8(key)
        .ok()
        .filter(|text| text.is_ascii())
        .ok_or_else(|| BridgeError::MessageParse("Malformed header line.".into()))?;
    let value = std::str::from_utf8(&value[1..])
        .ok()
        .filter(|text| text.is_ascii())
        .ok_or_else(|| BridgeError::MessageParse("Malformed header line.".into()))?;
    Ok((key.trim().to_lowercase(), value.trim().to_string()))
}

/// Read one message, detecting the framing mode from its first byte.
///
/// Returns `(None, _)` on EOF (including EOF inside a header block or a
/// short payload). Malformed headers and invalid JSON are errors.
pub fn read_stdio_message<R: BufRead>(reader: &mut R) -> Result<(Option<Value>, FramingMode)> {
    let first_line = loop {
        match read_line_bytes(reader)? {
            None => return Ok((None, FramingMode::Framed)),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    if first_line.first() == Some(&b'{') || first_line.first() == Some(&b'[') {
        let message = parse_json_payload(&first_line, "Invalid JSON line payload")?;
        return Ok((Some(message), FramingMode::JsonLines));
    }

    let mut content_length: Option<usize> = None;
    let mut line = first_line;
    loop {
        if line.is_empty() {
            break;
        }
        let (key, value) = header_key_value(&line)?;
        if key == "content-length" {
            let length: usize = value
                .parse()
                .map_err(|_| BridgeError::MessageParse("Invalid Content-Length header.".into()))?;
            content_length = Some(length);
        }
        match read_line_bytes(reader)? {
            None => return Ok((None, FramingMode::Framed)),
            Some(next_line) => line = next_line,
        }
    }

    let content_length = content_length
        .ok_or_else(|| BridgeError::MessageParse("Missing Content-Length header.".into()))?;

    let mut payload = vec![0u8; content_length];
    if reader.read_exact(&mut payload).is_err() {
        return Ok((None, FramingMode::Framed));
    }

    let message = parse_json_payload(&payload, "Invalid JSON payload")?;
    Ok((Some(message), FramingMode::Framed))
}

/// Write one message in the session's framing mode and flush.
pub fn write_stdio_message<W: Write>(
    writer: &mut W,
    message: &Value,
    mode: FramingMode,
) -> std::io::Result<()> {
    let payload = serde_json::to_vec(message)?;
    match mode {
        FramingMode::JsonLines => {
            writer.write_all(&payload)?;
            writer.write_all(b"\n")?;
        }
        FramingMode::Framed => {
            let header = format!("Content-Length: {}\r\n\r\n", payload.len());
            writer.write_all(header.as_bytes())?;
            writer.write_all(&payload)?;
        }
    }
    writer.flush()
}

/// JSON-RPC 2.0 server over stdin/stdout.
///
/// Requests with an id run on their own task so long tool calls never block
/// framing; a single write mutex keeps reply frames whole on stdout.
#[derive(Clone)]
pub struct McpStdioServer {
    dispatcher: Arc<RequestDispatcher>,
    output_mode: Arc<StdMutex<FramingMode>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl McpStdioServer {
    pub fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        Self {
            dispatcher,
            output_mode: Arc::new(StdMutex::new(FramingMode::Framed)),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub async fn run(&self) -> i32 {
        let mut pending_tasks: JoinSet<()> = JoinSet::new();

        loop {
            let read_outcome = tokio::task::spawn_blocking(|| {
                let stdin = std::io::stdin();
                let mut lock = stdin.lock();
                read_stdio_message(&mut lock)
            })
            .await;

            let (message, input_mode) = match read_outcome {
                Ok(Ok(pair)) => pair,
                Ok(Err(frame_error)) => {
                    warn!(error = %frame_error, "Invalid MCP frame received");
                    self.send(make_jsonrpc_error(
                        None,
                        JSONRPC_PARSE_ERROR,
                        "Invalid MCP frame.",
                        Some(json!(frame_error.to_string())),
                    ))
                    .await;
                    continue;
                }
                Err(join_error) => {
                    error!(error = %join_error, "stdin reader task failed");
                    pending_tasks.shutdown().await;
                    return 6;
                }
            };

            if input_mode == FramingMode::JsonLines {
                *self.output_mode.lock().expect("output mode lock poisoned") =
                    FramingMode::JsonLines;
            }

            let Some(message) = message else {
                // EOF: the client is gone.
                pending_tasks.shutdown().await;
                return 0;
            };

            if message.is_array() {
                self.send(make_jsonrpc_error(
                    None,
                    JSONRPC_INVALID_REQUEST,
                    "Batch request is not supported.",
                    None,
                ))
                .await;
                continue;
            }
            if !message.is_object() {
                self.send(make_jsonrpc_error(
                    None,
                    JSONRPC_INVALID_REQUEST,
                    "MCP payload must be a JSON object.",
                    None,
                ))
                .await;
                continue;
            }

            if message.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
                let request_id = message
                    .get("id")
                    .filter(|id| id.is_string() || id.is_number())
                    .cloned();
                self.send(make_jsonrpc_error(
                    request_id,
                    JSONRPC_INVALID_REQUEST,
                    "jsonrpc must be '2.0'.",
                    None,
                ))
                .await;
                continue;
            }

            if message.get("method").is_none() {
                debug!("Ignoring message without method.");
                continue;
            }

            if message.get("id").is_none() {
                self.dispatcher.handle_notification(&message);
                continue;
            }

            let server = self.clone();
            pending_tasks.spawn(async move {
                server.handle_request_message(message).await;
            });
        }
    }

    async fn handle_request_message(&self, message: Value) {
        let request_id = message.get("id").cloned();
        if !matches!(request_id, Some(ref id) if id.is_string() || id.is_number()) {
            self.send(make_jsonrpc_error(
                None,
                JSONRPC_INVALID_REQUEST,
                "Request id must be string or number.",
                None,
            ))
            .await;
            return;
        }

        let response = self.dispatcher.handle_request(&message).await;
        self.send(response).await;
    }

    async fn send(&self, message: Value) {
        let _guard = self.write_lock.lock().await;
        let mode = *self.output_mode.lock().expect("output mode lock poisoned");
        let outcome = tokio::task::spawn_blocking(move || {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            write_stdio_message(&mut lock, &message, mode)
        })
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(io_error)) => error!(error = %io_error, "Failed to write MCP reply"),
            Err(join_error) => error!(error = %join_error, "stdout writer task failed"),
        }
    }
}
