use super::client::McpSession;
use super::error::McpError;
use super::protocol::{
    GetPromptResult, McpPromptDef, McpResourceDef, McpToolDef, ResourceContents, ToolCallResult,
};
use super::registry::{ConnectionRegistry, ConnectionStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

/// Uniform `{success, data?, error?}` envelope for capability calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> McpResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match (self.success, self.data) {
            (true, Some(data)) => Ok(data),
            (_, _) => Err(self.error.unwrap_or_else(|| "unknown error".to_string())),
        }
    }
}

impl<T> From<Result<T, McpError>> for McpResponse<T> {
    fn from(result: Result<T, McpError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::failed(e),
        }
    }
}

/// Capability operations against connected servers. Single attempt, no
/// implicit connect.
#[derive(Clone)]
pub struct CapabilityFacade {
    registry: Arc<ConnectionRegistry>,
}

impl CapabilityFacade {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    async fn run<T, F, Fut>(&self, server_id: &str, operation: &str, op: F) -> McpResponse<T>
    where
        F: FnOnce(Arc<dyn McpSession>) -> Fut,
        Fut: Future<Output = Result<T, McpError>>,
    {
        let result = self.registry.with_session(server_id, op).await;
        if let Err(e) = &result {
            tracing::debug!(server = %server_id, operation, error = %e, "MCP capability call failed");
        }
        result.into()
    }

    pub async fn list_tools(&self, server_id: &str) -> McpResponse<Vec<McpToolDef>> {
        self.run(server_id, "tools/list", |s| async move {
            let tools = s.list_tools().await?;
            Ok(tools.into_iter().map(normalize_tool).collect())
        })
        .await
    }

    pub async fn list_prompts(&self, server_id: &str) -> McpResponse<Vec<McpPromptDef>> {
        self.run(server_id, "prompts/list", |s| async move {
            s.list_prompts().await
        })
        .await
    }

    pub async fn list_resources(&self, server_id: &str) -> McpResponse<Vec<McpResourceDef>> {
        self.run(server_id, "resources/list", |s| async move {
            s.list_resources().await
        })
        .await
    }

    /// Missing arguments are sent as an empty object.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> McpResponse<ToolCallResult> {
        let arguments = match arguments {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(args) => args,
        };
        self.run(server_id, "tools/call", |s| async move {
            s.call_tool(tool_name, arguments).await
        })
        .await
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        prompt_name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> McpResponse<GetPromptResult> {
        self.run(server_id, "prompts/get", |s| async move {
            s.get_prompt(prompt_name, arguments).await
        })
        .await
    }

    pub async fn read_resource(&self, server_id: &str, uri: &str) -> McpResponse<Vec<ResourceContents>> {
        self.run(server_id, "resources/read", |s| async move {
            s.read_resource(uri).await
        })
        .await
    }

    /// Ids and display names of every `connected` entry.
    pub fn connected_servers(&self) -> Vec<(String, String)> {
        self.registry
            .servers()
            .into_iter()
            .filter(|s| s.status == ConnectionStatus::Connected)
            .map(|s| (s.id, s.name))
            .collect()
    }
}

/// Reduce a tool descriptor to `{name, description, inputSchema}` with an
/// object schema always present.
fn normalize_tool(tool: McpToolDef) -> McpToolDef {
    let input_schema = match tool.input_schema {
        Some(schema @ Value::Object(_)) => schema,
        _ => serde_json::json!({ "type": "object", "properties": {} }),
    };
    McpToolDef {
        name: tool.name,
        description: tool.description.filter(|d| !d.trim().is_empty()),
        input_schema: Some(input_schema),
    }
}
