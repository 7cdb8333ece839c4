//! Aggregates tools across connected servers into one flat, namespaced set
//! of function declarations.

use super::model::FunctionDeclaration;
use crate::mcp::{CapabilityFacade, McpError};
use crate::mcp::protocol::McpToolDef;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// Separator between server id and tool name in a declaration name.
pub const NAMESPACE_SEPARATOR: &str = "__";

const BASE_INSTRUCTION: &str = "You are a helpful assistant. Answer clearly and concisely.";

/// Tools discovered on one connected server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTools {
    pub server_id: String,
    pub server_name: String,
    pub tools: Vec<McpToolDef>,
}

/// List tools on every connected server concurrently. Servers whose list
/// call fails are skipped.
pub async fn aggregate_tools(facade: &CapabilityFacade) -> Vec<ServerTools> {
    let servers = facade.connected_servers();
    let listings = futures::future::join_all(
        servers
            .iter()
            .map(|(id, _)| facade.list_tools(id)),
    )
    .await;

    servers
        .into_iter()
        .zip(listings)
        .filter_map(|((server_id, server_name), listing)| match listing.into_result() {
            Ok(tools) => Some(ServerTools {
                server_id,
                server_name,
                tools,
            }),
            Err(e) => {
                tracing::warn!(server = %server_id, error = %e, "Skipping MCP server during tool aggregation");
                None
            }
        })
        .collect()
}

pub fn namespaced_name(server_id: &str, tool_name: &str) -> String {
    format!("{server_id}{NAMESPACE_SEPARATOR}{tool_name}")
}

/// Where a declared function really lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespacedTool {
    pub server_id: String,
    pub server_name: String,
    pub tool_name: String,
}

/// Declarations for one chat turn plus the reverse map used to route calls.
#[derive(Debug, Default)]
pub struct ToolIndex {
    routes: HashMap<String, NamespacedTool>,
    declarations: Vec<FunctionDeclaration>,
}

impl ToolIndex {
    pub fn build(servers: &[ServerTools]) -> Self {
        let mut index = Self::default();
        for server in servers {
            for tool in &server.tools {
                let name = namespaced_name(&server.server_id, &tool.name);
                if index.routes.contains_key(&name) {
                    tracing::warn!(function = %name, "Duplicate MCP tool declaration ignored");
                    continue;
                }
                let description = format!(
                    "[{}] {}",
                    server.server_name,
                    tool.description.as_deref().unwrap_or(&tool.name)
                );
                index.declarations.push(FunctionDeclaration {
                    name: name.clone(),
                    description,
                    parameters: schema_to_parameters(tool.input_schema.as_ref()),
                });
                index.routes.insert(
                    name,
                    NamespacedTool {
                        server_id: server.server_id.clone(),
                        server_name: server.server_name.clone(),
                        tool_name: tool.name.clone(),
                    },
                );
            }
        }
        index
    }

    /// Exact lookup; names are never split on the separator.
    pub fn resolve(&self, function_name: &str) -> Result<&NamespacedTool, McpError> {
        self.routes
            .get(function_name)
            .ok_or_else(|| McpError::UnknownFunctionName(function_name.to_string()))
    }

    pub fn declarations(&self) -> &[FunctionDeclaration] {
        &self.declarations
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    pub fn system_instruction(&self) -> String {
        if self.is_empty() {
            return BASE_INSTRUCTION.to_string();
        }
        let listing: Vec<String> = self
            .declarations
            .iter()
            .map(|d| format!("- {}: {}", d.name, d.description))
            .collect();
        format!(
            "{BASE_INSTRUCTION}\n\nYou have access to the following tools:\n{}\n\n\
             When a request can be answered with one of these tools, call the tool instead of guessing. \
             Prefer tool results over assumptions, and say so when a tool reports an error.",
            listing.join("\n")
        )
    }
}

/// Model-side type enum for a JSON-schema `type`. Missing or unknown types map to `STRING`.
fn model_type(schema_type: Option<&Value>) -> &'static str {
    let ty = match schema_type {
        Some(Value::String(s)) => Some(s.as_str()),
        // `["string", "null"]` style unions: first non-null member
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .find(|t| *t != "null"),
        _ => None,
    };
    match ty {
        Some("number") => "NUMBER",
        Some("integer") => "INTEGER",
        Some("boolean") => "BOOLEAN",
        Some("array") => "ARRAY",
        Some("object") => "OBJECT",
        _ => "STRING",
    }
}

fn property_schema(schema: &Value) -> Value {
    let ty = model_type(schema.get("type"));
    let mut out = Map::new();
    out.insert("type".into(), json!(ty));
    if let Some(description) = schema.get("description").and_then(Value::as_str) {
        out.insert("description".into(), json!(description));
    }
    if ty == "ARRAY" {
        let items = schema.get("items").cloned().unwrap_or(Value::Null);
        out.insert("items".into(), json!({ "type": model_type(items.get("type")) }));
    }
    if let Some(values) = schema.get("enum").and_then(Value::as_array) {
        if ty == "STRING" {
            out.insert("enum".into(), Value::Array(values.clone()));
        }
    }
    Value::Object(out)
}

/// Convert a tool's input schema into the model's parameter object.
pub fn schema_to_parameters(schema: Option<&Value>) -> Value {
    let properties: Map<String, Value> = schema
        .and_then(|s| s.get("properties"))
        .and_then(Value::as_object)
        .map(|props| {
            props
                .iter()
                .map(|(name, prop)| (name.clone(), property_schema(prop)))
                .collect()
        })
        .unwrap_or_default();

    let required: Vec<Value> = schema
        .and_then(|s| s.get("required"))
        .and_then(Value::as_array)
        .map(|req| {
            req.iter()
                .filter(|r| r.as_str().is_some_and(|name| properties.contains_key(name)))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    let mut params = json!({ "type": "OBJECT", "properties": properties });
    if !required.is_empty() {
        params["required"] = Value::Array(required);
    }
    params
}
