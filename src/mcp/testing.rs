//! In-memory sessions and connectors shared by the unit tests.

use super::client::McpSession;
use super::config::ServerConfig;
use super::error::McpError;
use super::protocol::{
    GetPromptResult, McpContent, McpPromptDef, McpResourceDef, McpToolDef, PromptMessage,
    ResourceContents, ToolCallResult,
};
use super::registry::Connector;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub fn tool(name: &str) -> McpToolDef {
    McpToolDef {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: Some(json!({
            "type": "object",
            "properties": {"query": {"type": "string", "description": "what to look up"}},
            "required": ["query"]
        })),
    }
}

/// A session whose tools answer with `"{server}:{tool}"`.
pub struct FakeSession {
    pub server: String,
    pub generation: usize,
    pub tools: Vec<McpToolDef>,
    pub fail_list: bool,
    pub call_delay: Option<Duration>,
    pub close_delay: Option<Duration>,
    pub closed: AtomicBool,
    pub calls: AtomicUsize,
    events: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl McpSession for FakeSession {
    async fn list_tools(&self) -> Result<Vec<McpToolDef>, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_list {
            return Err(McpError::Transport("tools/list: broken pipe".into()));
        }
        Ok(self.tools.clone())
    }

    async fn list_prompts(&self) -> Result<Vec<McpPromptDef>, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![McpPromptDef {
            name: "summarize".into(),
            description: None,
            arguments: Vec::new(),
        }])
    }

    async fn list_resources(&self) -> Result<Vec<McpResourceDef>, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![McpResourceDef {
            uri: format!("mem://{}/readme", self.server),
            name: "readme".into(),
            description: None,
            mime_type: Some("text/plain".into()),
        }])
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        if !self.tools.iter().any(|t| t.name == name) {
            return Err(McpError::Protocol {
                code: -32602,
                message: format!("unknown tool {name}"),
            });
        }
        Ok(ToolCallResult {
            content: vec![McpContent {
                content_type: "text".into(),
                text: Some(format!("{}:{name}:{arguments}", self.server)),
                data: None,
                mime_type: None,
            }],
            is_error: false,
        })
    }

    async fn get_prompt(
        &self,
        name: &str,
        _arguments: Option<Map<String, Value>>,
    ) -> Result<GetPromptResult, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GetPromptResult {
            description: None,
            messages: vec![PromptMessage {
                role: "user".into(),
                content: json!({"type": "text", "text": name}),
            }],
        })
    }

    async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![ResourceContents {
            uri: uri.to_string(),
            mime_type: None,
            text: Some("contents".into()),
            blob: None,
        }])
    }

    async fn close(&self) -> Result<(), McpError> {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.closed.store(true, Ordering::SeqCst);
        self.events
            .lock()
            .push(format!("close:{}#{}", self.server, self.generation));
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct ServerBehaviour {
    pub tools: Vec<McpToolDef>,
    pub fail_connect: bool,
    pub fail_list: bool,
    pub connect_delay: Option<Duration>,
    pub call_delay: Option<Duration>,
    pub close_delay: Option<Duration>,
}

/// Hands out [`FakeSession`]s and keeps every one it opened.
#[derive(Default)]
pub struct FakeConnector {
    behaviours: Mutex<HashMap<String, ServerBehaviour>>,
    pub opened: Mutex<Vec<Arc<FakeSession>>>,
    pub events: Arc<Mutex<Vec<String>>>,
}

impl FakeConnector {
    pub fn with(self, id: &str, behaviour: ServerBehaviour) -> Self {
        self.behaviours.lock().insert(id.to_string(), behaviour);
        self
    }

    pub fn sessions_for(&self, id: &str) -> Vec<Arc<FakeSession>> {
        self.opened
            .lock()
            .iter()
            .filter(|s| s.server == id)
            .cloned()
            .collect()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, config: &ServerConfig) -> Result<Arc<dyn McpSession>, McpError> {
        let behaviour = self
            .behaviours
            .lock()
            .get(&config.id)
            .cloned()
            .unwrap_or_default();

        if let Some(delay) = behaviour.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if behaviour.fail_connect {
            return Err(McpError::connect_failure(&config.id, "connection refused"));
        }

        let generation = self.sessions_for(&config.id).len() + 1;
        let session = Arc::new(FakeSession {
            server: config.id.clone(),
            generation,
            tools: behaviour.tools,
            fail_list: behaviour.fail_list,
            call_delay: behaviour.call_delay,
            close_delay: behaviour.close_delay,
            closed: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            events: Arc::clone(&self.events),
        });
        self.events
            .lock()
            .push(format!("open:{}#{generation}", config.id));
        self.opened.lock().push(Arc::clone(&session));
        Ok(session)
    }
}
