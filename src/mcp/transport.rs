use super::config::{ServerConfig, TransportConfig};
use super::error::McpError;
use super::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// Transport abstraction for MCP communication.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and receive the matching response.
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse>;
    /// Send a notification; no response is expected.
    async fn notify(&self, notification: &JsonRpcNotification) -> Result<()>;
    /// Gracefully shut down the transport.
    async fn shutdown(&self) -> Result<()>;
    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;
}

/// Build the channel for `config`. Connection-level failures surface as
/// [`McpError::ConnectFailure`].
pub async fn create_transport(
    config: &ServerConfig,
    timeout: Duration,
) -> Result<Box<dyn McpTransport>, McpError> {
    let transport: Box<dyn McpTransport> = match &config.transport {
        TransportConfig::Stdio { command, args, env } => Box::new(
            StdioTransport::spawn(&config.id, command, args, env)
                .map_err(|e| McpError::connect_failure(&config.id, format!("{e:#}")))?,
        ),
        TransportConfig::Http { url } => Box::new(
            HttpTransport::new(url, timeout)
                .map_err(|e| McpError::connect_failure(&config.id, format!("{e:#}")))?,
        ),
        TransportConfig::Sse { url } => Box::new(
            SseTransport::connect(&config.id, url, timeout)
                .await
                .map_err(|e| McpError::connect_failure(&config.id, format!("{e:#}")))?,
        ),
    };
    Ok(transport)
}

// ── Stdio Transport ─────────────────────────────────────────────

/// Longest stdout line accepted from a stdio server.
const MAX_STDIO_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Append one `\n`-terminated line to `buf`, failing once it exceeds `limit`.
/// Returns the number of bytes read; 0 means EOF.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from MCP stdout")?;
        if available.is_empty() {
            return Ok(total);
        }
        let (chunk, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (&available[..=pos], true),
            None => (available, false),
        };
        let len = chunk.len();
        if buf.len() + len > limit {
            bail!("MCP server sent a line longer than {limit} bytes");
        }
        buf.extend_from_slice(chunk);
        reader.consume(len);
        total += len;
        if complete {
            return Ok(total);
        }
    }
}

/// Stdio-based MCP transport: spawns a child process and communicates via stdin/stdout.
pub struct StdioTransport {
    /// Serialized access to stdin/stdout for request-response pairing.
    inner: Mutex<StdioInner>,
    alive: Arc<AtomicBool>,
}

struct StdioInner {
    child: Child,
    stdin: tokio::process::ChildStdin,
    reader: BufReader<tokio::process::ChildStdout>,
}

impl StdioTransport {
    /// Spawn the MCP server subprocess. `env` is layered over the host environment.
    pub fn spawn(
        server_id: &str,
        command: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn MCP server: {command}"))?;

        let stdin = child.stdin.take().context("No stdin on MCP child")?;
        let stdout = child.stdout.take().context("No stdout on MCP child")?;

        if let Some(stderr) = child.stderr.take() {
            let server = server_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, stderr = %line, "MCP server output");
                }
            });
        }

        tracing::debug!(server = %server_id, command = %command, "MCP server process spawned");

        Ok(Self {
            inner: Mutex::new(StdioInner {
                child,
                stdin,
                reader: BufReader::new(stdout),
            }),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn write_line(inner: &mut StdioInner, payload: &impl serde::Serialize) -> Result<()> {
        let mut line = serde_json::to_string(payload)?;
        line.push('\n');
        inner
            .stdin
            .write_all(line.as_bytes())
            .await
            .context("Failed to write to MCP stdin")?;
        inner
            .stdin
            .flush()
            .await
            .context("Failed to flush MCP stdin")
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let mut inner = self.inner.lock().await;
        if let Err(e) = Self::write_line(&mut inner, request).await {
            self.alive.store(false, Ordering::Relaxed);
            return Err(e);
        }

        // Skip blank lines, log output, notifications and stale responses.
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = match read_line_bounded(&mut inner.reader, &mut buf, MAX_STDIO_LINE_BYTES).await {
                Ok(n) => n,
                Err(e) => {
                    self.alive.store(false, Ordering::Relaxed);
                    return Err(e);
                }
            };
            if n == 0 {
                self.alive.store(false, Ordering::Relaxed);
                bail!("MCP server closed stdout (EOF)");
            }

            let line = String::from_utf8_lossy(&buf);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(trimmed) {
                if resp.is_response() && resp.id_u64() == Some(request.id) {
                    return Ok(resp);
                }
            }
        }
    }

    async fn notify(&self, notification: &JsonRpcNotification) -> Result<()> {
        let mut inner = self.inner.lock().await;
        Self::write_line(&mut inner, notification).await
    }

    async fn shutdown(&self) -> Result<()> {
        self.alive.store(false, Ordering::Relaxed);
        let mut inner = self.inner.lock().await;
        // Closing stdin signals EOF to well-behaved servers.
        drop(inner.stdin.shutdown().await);
        if tokio::time::timeout(Duration::from_secs(3), inner.child.wait())
            .await
            .is_err()
        {
            inner
                .child
                .kill()
                .await
                .context("Failed to kill MCP server process")?;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

// ── SSE framing ─────────────────────────────────────────────────

/// Splits a byte stream into lines, keeping blank lines (they delimit events).
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush whatever trails the last newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buffer);
        let text = String::from_utf8_lossy(&rest);
        Some(text.trim_end_matches('\r').to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental `text/event-stream` decoder.
#[derive(Debug, Default)]
pub struct SseDecoder {
    lines: SseLineBuffer,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let lines = self.lines.push(chunk);
        lines
            .iter()
            .filter_map(|line| self.feed_line(line))
            .collect()
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut out = Vec::new();
        if let Some(line) = self.lines.finish() {
            out.extend(self.feed_line(&line));
        }
        out.extend(self.dispatch());
        out
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("text/event-stream"))
}

fn matching_response(data: &str, id: u64) -> Option<JsonRpcResponse> {
    serde_json::from_str::<JsonRpcResponse>(data)
        .ok()
        .filter(|resp| resp.is_response() && resp.id_u64() == Some(id))
}

// ── Streamable HTTP Transport ───────────────────────────────────

const SESSION_HEADER: &str = "mcp-session-id";

/// Streamable HTTP transport: every message is a POST; the reply is either a
/// JSON body or an event stream carrying the response.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
    session_id: parking_lot::Mutex<Option<String>>,
    alive: AtomicBool,
}

impl HttpTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            url: url.to_string(),
            client,
            timeout,
            session_id: parking_lot::Mutex::new(None),
            alive: AtomicBool::new(true),
        })
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(body);
        if let Some(session) = self.session_id.lock().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let resp = request
            .send()
            .await
            .with_context(|| format!("HTTP transport: POST to {} failed", self.url))?;

        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock() = Some(session.to_string());
        }

        if !resp.status().is_success() {
            bail!("HTTP transport: HTTP {} from {}", resp.status(), self.url);
        }
        Ok(resp)
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        let resp = self.post(request).await?;

        if is_event_stream(&resp) {
            let mut stream = resp.bytes_stream();
            let mut decoder = SseDecoder::default();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("HTTP transport: event stream interrupted")?;
                for event in decoder.push(&chunk) {
                    if let Some(rpc) = matching_response(&event.data, request.id) {
                        return Ok(rpc);
                    }
                }
            }
            for event in decoder.finish() {
                if let Some(rpc) = matching_response(&event.data, request.id) {
                    return Ok(rpc);
                }
            }
            bail!("HTTP transport: event stream ended without a response");
        }

        let body = resp.text().await?;
        serde_json::from_str::<JsonRpcResponse>(&body)
            .context("HTTP transport: response body is not JSON-RPC")
    }

    async fn notify(&self, notification: &JsonRpcNotification) -> Result<()> {
        self.post(notification).await.map(|_| ())
    }

    async fn shutdown(&self) -> Result<()> {
        self.alive.store(false, Ordering::Relaxed);
        let session = self.session_id.lock().take();
        if let Some(session) = session {
            // Servers may not support explicit termination.
            let _ = self
                .client
                .delete(&self.url)
                .header(SESSION_HEADER, session)
                .timeout(self.timeout)
                .send()
                .await;
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

// ── SSE Transport ───────────────────────────────────────────────

type PendingMap = Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// SSE-based MCP transport: receives server messages over a long-lived
/// event stream and sends requests as HTTP POSTs to the advertised endpoint.
pub struct SseTransport {
    endpoint: String,
    client: reqwest::Client,
    pending: PendingMap,
    reader: parking_lot::Mutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

/// Drops the pending slot if the waiting request is cancelled or times out.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(server_id: &str, url: &str, timeout: Duration) -> Result<Self> {
        let base = reqwest::Url::parse(url).with_context(|| format!("Invalid SSE url: {url}"))?;
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let resp = client
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("SSE transport: GET {url} failed"))?;
        if !resp.status().is_success() {
            bail!("SSE transport: HTTP {} from {url}", resp.status());
        }
        if !is_event_stream(&resp) {
            bail!("SSE transport: {url} did not answer with text/event-stream");
        }

        let pending: PendingMap = Arc::new(parking_lot::Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();

        let reader = tokio::spawn(read_events(
            server_id.to_string(),
            resp,
            Arc::clone(&pending),
            Arc::clone(&alive),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(timeout, endpoint_rx).await {
            Ok(Ok(path)) => base
                .join(&path)
                .with_context(|| format!("SSE transport: bad endpoint '{path}'"))?,
            Ok(Err(_)) => {
                reader.abort();
                bail!("SSE transport: stream closed before the endpoint event");
            }
            Err(_) => {
                reader.abort();
                bail!("SSE transport: no endpoint event within {}s", timeout.as_secs());
            }
        };

        tracing::debug!(server = %server_id, endpoint = %endpoint, "SSE endpoint received");

        Ok(Self {
            endpoint: endpoint.to_string(),
            client,
            pending,
            reader: parking_lot::Mutex::new(Some(reader)),
            alive,
        })
    }
}

async fn read_events(
    server_id: String,
    resp: reqwest::Response,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = resp.bytes_stream();
    let mut decoder = SseDecoder::default();

    let mut route = |event: SseEvent| match event.event.as_str() {
        "endpoint" => {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(event.data);
            }
        }
        "message" => match serde_json::from_str::<JsonRpcResponse>(&event.data) {
            Ok(rpc) if rpc.is_response() => {
                let waiter = rpc.id_u64().and_then(|id| pending.lock().remove(&id));
                if let Some(tx) = waiter {
                    let _ = tx.send(rpc);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(server = %server_id, error = %e, "Ignoring malformed SSE message"),
        },
        _ => {}
    };

    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => decoder.push(&chunk).into_iter().for_each(&mut route),
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "SSE stream error");
                break;
            }
        }
    }
    decoder.finish().into_iter().for_each(&mut route);

    alive.store(false, Ordering::Relaxed);
    // Dropping the senders fails every outstanding request.
    pending.lock().clear();
    tracing::debug!(server = %server_id, "SSE stream closed");
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn send(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse> {
        if !self.is_alive() {
            bail!("SSE transport: stream is closed");
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request.id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id: request.id,
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .context("SSE transport: POST failed")?;
        if !resp.status().is_success() {
            bail!("SSE transport: HTTP {} from {}", resp.status(), self.endpoint);
        }

        // Some servers answer inline instead of over the stream.
        let body = resp.text().await.unwrap_or_default();
        if let Some(rpc) = matching_response(body.trim(), request.id) {
            return Ok(rpc);
        }

        rx.await
            .map_err(|_| anyhow::anyhow!("SSE transport: stream closed before the response"))
    }

    async fn notify(&self, notification: &JsonRpcNotification) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await
            .context("SSE transport: POST failed")?;
        if !resp.status().is_success() {
            bail!("SSE transport: HTTP {} from {}", resp.status(), self.endpoint);
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.alive.store(false, Ordering::Relaxed);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.pending.lock().clear();
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::{RawQuery, State};
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};

    async fn serve_local(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Streamable HTTP endpoint: JSON reply to `initialize` with a session
    /// header, event-stream replies to everything else, a DELETE that never answers.
    #[derive(Default)]
    struct HttpServer {
        sessions: parking_lot::Mutex<Vec<Option<String>>>,
        deleted: parking_lot::Mutex<Option<String>>,
    }

    fn session_of(headers: &HeaderMap) -> Option<String> {
        headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    async fn http_post(
        State(server): State<Arc<HttpServer>>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Response {
        server.sessions.lock().push(session_of(&headers));
        let Some(id) = body.get("id").cloned() else {
            return StatusCode::ACCEPTED.into_response();
        };
        if body["method"] == "initialize" {
            let result = json!({"protocolVersion": "2024-11-05", "capabilities": {}});
            return (
                [(SESSION_HEADER, "sess-1")],
                Json(json!({"jsonrpc": "2.0", "id": id, "result": result})),
            )
                .into_response();
        }
        let events = format!(
            "event: message\ndata: {}\n\ndata: {}\n\n",
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
            json!({"jsonrpc": "2.0", "id": id, "result": {"tools": []}}),
        );
        ([(header::CONTENT_TYPE, "text/event-stream")], events).into_response()
    }

    async fn http_delete(State(server): State<Arc<HttpServer>>, headers: HeaderMap) -> StatusCode {
        *server.deleted.lock() = session_of(&headers);
        std::future::pending::<()>().await;
        StatusCode::OK
    }

    #[tokio::test]
    async fn http_transport_echoes_session_and_reads_event_stream_replies() {
        let server = Arc::new(HttpServer::default());
        let base = serve_local(
            Router::new()
                .route("/mcp", post(http_post).delete(http_delete))
                .with_state(Arc::clone(&server)),
        )
        .await;
        let transport = HttpTransport::new(&format!("{base}/mcp"), Duration::from_millis(500)).unwrap();

        let init = transport
            .send(&JsonRpcRequest::new(1, "initialize", Some(json!({}))))
            .await
            .unwrap();
        assert_eq!(init.id_u64(), Some(1));
        transport
            .notify(&JsonRpcNotification::new("notifications/initialized", None))
            .await
            .unwrap();
        let listed = transport
            .send(&JsonRpcRequest::new(2, "tools/list", None))
            .await
            .unwrap();
        assert_eq!(listed.id_u64(), Some(2));
        assert_eq!(listed.result, Some(json!({"tools": []})));

        assert_eq!(
            *server.sessions.lock(),
            vec![None, Some("sess-1".to_string()), Some("sess-1".to_string())]
        );

        tokio::time::timeout(Duration::from_secs(5), transport.shutdown())
            .await
            .expect("shutdown settled")
            .unwrap();
        assert_eq!(server.deleted.lock().as_deref(), Some("sess-1"));
        assert!(!transport.is_alive());
    }

    /// Legacy SSE endpoint: announces `/messages?session=abc`, answers the
    /// `inline` method in the POST body, closes the stream on `drop`, and
    /// pushes every other reply over the stream.
    #[derive(Default)]
    struct SseServer {
        stream: parking_lot::Mutex<Option<tokio::sync::mpsc::UnboundedSender<String>>>,
        queries: parking_lot::Mutex<Vec<Option<String>>>,
    }

    async fn sse_stream(State(server): State<Arc<SseServer>>) -> Response {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        let _ = tx.send("event: endpoint\ndata: /messages?session=abc\n\n".to_string());
        *server.stream.lock() = Some(tx);
        let body = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok::<_, std::io::Error>(chunk), rx))
        });
        (
            [(header::CONTENT_TYPE, "text/event-stream")],
            Body::from_stream(body),
        )
            .into_response()
    }

    async fn sse_message(
        State(server): State<Arc<SseServer>>,
        RawQuery(query): RawQuery,
        Json(body): Json<Value>,
    ) -> Response {
        server.queries.lock().push(query);
        let Some(id) = body.get("id").cloned() else {
            return StatusCode::ACCEPTED.into_response();
        };
        match body["method"].as_str() {
            Some("inline") => {
                Json(json!({"jsonrpc": "2.0", "id": id, "result": {"inline": true}})).into_response()
            }
            Some("drop") => {
                server.stream.lock().take();
                StatusCode::ACCEPTED.into_response()
            }
            _ => {
                let reply = json!({"jsonrpc": "2.0", "id": id, "result": {"via": "stream"}});
                if let Some(tx) = server.stream.lock().as_ref() {
                    let _ = tx.send(format!("data: {reply}\n\n"));
                }
                StatusCode::ACCEPTED.into_response()
            }
        }
    }

    #[tokio::test]
    async fn sse_transport_routes_replies_and_fails_pending_on_close() {
        let server = Arc::new(SseServer::default());
        let base = serve_local(
            Router::new()
                .route("/sse", get(sse_stream))
                .route("/messages", post(sse_message))
                .with_state(Arc::clone(&server)),
        )
        .await;

        let transport = SseTransport::connect("legacy", &format!("{base}/sse"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(transport.endpoint, format!("{base}/messages?session=abc"));

        let streamed = transport
            .send(&JsonRpcRequest::new(1, "tools/list", None))
            .await
            .unwrap();
        assert_eq!(streamed.result, Some(json!({"via": "stream"})));
        let inline = transport
            .send(&JsonRpcRequest::new(2, "inline", None))
            .await
            .unwrap();
        assert_eq!(inline.result, Some(json!({"inline": true})));
        assert!(transport.pending.lock().is_empty());
        assert_eq!(server.queries.lock()[0].as_deref(), Some("session=abc"));

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            transport.send(&JsonRpcRequest::new(3, "drop", None)),
        )
        .await
        .expect("pending request settled")
        .unwrap_err();
        assert!(format!("{err:#}").contains("stream closed"), "{err:#}");
        assert!(!transport.is_alive());
        assert!(transport
            .send(&JsonRpcRequest::new(4, "tools/list", None))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stdio_lines_are_bounded() {
        let mut reader = BufReader::new(&b"{\"id\":1}\nxxxxxxxxxxxxxxxxxxxx\n"[..]);
        let mut buf = Vec::new();
        assert_eq!(read_line_bounded(&mut reader, &mut buf, 16).await.unwrap(), 9);
        assert_eq!(buf, b"{\"id\":1}\n");

        buf.clear();
        let err = read_line_bounded(&mut reader, &mut buf, 16).await.unwrap_err();
        assert!(err.to_string().contains("longer than 16 bytes"));

        let mut empty = BufReader::new(&b""[..]);
        assert_eq!(read_line_bounded(&mut empty, &mut buf, 16).await.unwrap(), 0);
    }

    #[test]
    fn line_buffer_handles_partial_chunks_and_crlf() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: one").is_empty());
        assert_eq!(buffer.push(b"\r\n\r\n"), vec!["data: one", ""]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn decoder_joins_multiline_data_and_names_events() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b"event: endpoint\ndata: /messages?session=1\n\n: keepalive\n\ndata: a\ndata: b\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "endpoint".into(),
                    data: "/messages?session=1".into()
                },
                SseEvent {
                    event: "message".into(),
                    data: "a\nb".into()
                },
            ]
        );
    }

    #[test]
    fn decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"id\":1}").is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"id\":1}");
    }

    #[test]
    fn matching_response_filters_by_id() {
        let data = r#"{"jsonrpc":"2.0","id":4,"result":{}}"#;
        assert!(matching_response(data, 4).is_some());
        assert!(matching_response(data, 5).is_none());
        assert!(matching_response("not json", 4).is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_connect_failure() {
        let config = ServerConfig::stdio("ghost", "Ghost", "/definitely/not/a/real/binary");
        let err = create_transport(&config, Duration::from_secs(1))
            .await
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, McpError::ConnectFailure { ref server, .. } if server == "ghost"));
    }
}
