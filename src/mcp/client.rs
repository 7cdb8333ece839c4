use super::config::ServerConfig;
use super::error::McpError;
use super::protocol::{
    GetPromptResult, InitializeResult, JsonRpcNotification, JsonRpcRequest, ListPage,
    McpPromptDef, McpResourceDef, McpToolDef, ResourceContents, ResourceReadResult,
    ToolCallResult, PROTOCOL_VERSION,
};
use super::transport::{create_transport, McpTransport};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Upper bound on `nextCursor` pages fetched by one list call.
const MAX_LIST_PAGES: usize = 64;

/// A live, initialized protocol session with one tool server.
#[async_trait]
pub trait McpSession: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError>;
    async fn list_prompts(&self) -> Result<Vec<McpPromptDef>, McpError>;
    async fn list_resources(&self) -> Result<Vec<McpResourceDef>, McpError>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError>;
    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<GetPromptResult, McpError>;
    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError>;
    /// Tear down the channel (and child process, if any).
    async fn close(&self) -> Result<(), McpError>;
    fn is_alive(&self) -> bool {
        true
    }
}

/// Client for a single MCP server.
pub struct McpClient {
    pub server_id: String,
    transport: Box<dyn McpTransport>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl McpClient {
    /// Create a new client wrapping the given transport.
    pub fn new(server_id: String, transport: Box<dyn McpTransport>, timeout: Duration) -> Self {
        Self {
            server_id,
            transport,
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Build the transport for `config` and run the handshake.
    pub async fn connect(config: &ServerConfig, timeout: Duration) -> Result<Self, McpError> {
        let transport = create_transport(config, timeout).await?;
        let client = Self::new(config.id.clone(), transport, timeout);

        match client.initialize().await {
            Ok(init) => {
                tracing::debug!(
                    server = %config.id,
                    protocol = %init.protocol_version,
                    remote = init.server_info.as_ref().map(|i| i.name.as_str()).unwrap_or("unknown"),
                    "MCP handshake complete"
                );
                Ok(client)
            }
            Err(e) => {
                let _ = client.transport.shutdown().await;
                Err(match e {
                    McpError::Timeout { .. } => e,
                    other => McpError::connect_failure(&config.id, other.to_string()),
                })
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Perform the MCP `initialize` handshake.
    pub async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let result = self
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION")
                    }
                })),
            )
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;

        let notif = JsonRpcNotification::new("notifications/initialized", None);
        match tokio::time::timeout(Duration::from_secs(2), self.transport.notify(&notif)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(server = %self.server_id, error = %e, "initialized notification failed")
            }
            Err(_) => tracing::debug!(server = %self.server_id, "initialized notification timed out"),
        }

        Ok(init)
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let req = JsonRpcRequest::new(self.next_id(), method, params);

        let resp = tokio::time::timeout(self.timeout, self.transport.send(&req))
            .await
            .map_err(|_| McpError::timeout(method, self.timeout.as_secs()))?
            .map_err(|e| McpError::Transport(format!("{method}: {e:#}")))?;

        if let Some(err) = resp.error {
            return Err(McpError::Protocol {
                code: err.code,
                message: err.message,
            });
        }

        resp.result
            .ok_or_else(|| McpError::Transport(format!("{method}: empty result")))
    }

    /// Follow `nextCursor` until the server stops returning one.
    async fn list_paged<T: DeserializeOwned>(&self, method: &str) -> Result<Vec<T>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page: ListPage<T> = serde_json::from_value(self.request(method, params).await?)?;
            items.extend(page.items);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(items),
            }
        }

        tracing::warn!(server = %self.server_id, method, "MCP list pagination truncated");
        Ok(items)
    }
}

#[async_trait]
impl McpSession for McpClient {
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        self.list_paged("tools/list").await
    }

    async fn list_prompts(&self) -> Result<Vec<McpPromptDef>, McpError> {
        self.list_paged("prompts/list").await
    }

    async fn list_resources(&self) -> Result<Vec<McpResourceDef>, McpError> {
        self.list_paged("resources/list").await
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        let result = self
            .request(
                "tools/call",
                Some(json!({
                    "name": name,
                    "arguments": arguments,
                })),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<GetPromptResult, McpError> {
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = Value::Object(arguments);
        }
        let result = self.request("prompts/get", Some(params)).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        let result = self
            .request("resources/read", Some(json!({ "uri": uri })))
            .await?;
        let read: ResourceReadResult = serde_json::from_value(result)?;
        Ok(read.contents)
    }

    async fn close(&self) -> Result<(), McpError> {
        self.transport.shutdown().await.map_err(McpError::from)
    }

    fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }
}
