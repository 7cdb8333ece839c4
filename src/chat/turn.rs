use super::model::{
    ChatMessage, ChatModel, Content, Conversation, FunctionCall, FunctionResponse, Part, Role,
};
use super::tools::{aggregate_tools, ToolIndex};
use crate::mcp::facade::McpResponse;
use crate::mcp::protocol::ToolCallResult;
use crate::mcp::CapabilityFacade;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Hard cap on model round-trips per chat turn.
pub const DEFAULT_MAX_ROUNDS: usize = 5;
/// Bound on a single serialized tool result fed back to the model.
pub const DEFAULT_MAX_TOOL_RESULT_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct TurnSettings {
    pub max_rounds: usize,
    pub max_tool_result_bytes: usize,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            max_tool_result_bytes: DEFAULT_MAX_TOOL_RESULT_BYTES,
        }
    }
}

/// Audit entry for one executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub server_name: String,
    pub tool_name: String,
    pub arguments: Value,
    pub result: McpResponse<ToolCallResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub final_text: String,
    pub tool_calls: Vec<ToolCallRecord>,
}

/// Drives the function-calling loop for one chat turn at a time. Turns for
/// different conversations may run concurrently on the same runner.
pub struct ChatTurnRunner {
    facade: CapabilityFacade,
    model: Arc<dyn ChatModel>,
    settings: TurnSettings,
}

impl ChatTurnRunner {
    pub fn new(facade: CapabilityFacade, model: Arc<dyn ChatModel>, settings: TurnSettings) -> Self {
        Self {
            facade,
            model,
            settings,
        }
    }

    pub async fn run(&self, history: &[ChatMessage]) -> Result<ChatTurn> {
        let servers = aggregate_tools(&self.facade).await;
        let index = ToolIndex::build(&servers);

        let mut conversation = Conversation {
            system_instruction: index.system_instruction(),
            contents: history.iter().map(Content::from).collect(),
        };
        let mut final_text = String::new();
        let mut records = Vec::new();

        for round in 1..=self.settings.max_rounds {
            let reply = self
                .model
                .generate(&conversation, index.declarations())
                .await
                .with_context(|| format!("model request failed in round {round}"))?;

            if reply.function_calls.is_empty() {
                return Ok(ChatTurn {
                    final_text: reply.text,
                    tool_calls: records,
                });
            }
            // Narration from a tool-calling round only answers a capped turn.
            if !reply.text.is_empty() {
                final_text = reply.text.clone();
            }

            tracing::debug!(round, calls = reply.function_calls.len(), "Model requested tool calls");

            // Dispatched concurrently; join_all keeps request order.
            let executed = futures::future::join_all(
                reply
                    .function_calls
                    .iter()
                    .map(|call| self.execute(&index, call)),
            )
            .await;

            let mut model_parts = Vec::with_capacity(reply.function_calls.len() + 1);
            if !reply.text.is_empty() {
                model_parts.push(Part::Text(reply.text.clone()));
            }
            model_parts.extend(reply.function_calls.iter().cloned().map(Part::FunctionCall));

            let mut response_parts = Vec::with_capacity(executed.len());
            for (call, record) in reply.function_calls.iter().zip(executed) {
                response_parts.push(Part::FunctionResponse(FunctionResponse {
                    name: call.name.clone(),
                    response: self.response_payload(&record.result),
                }));
                records.push(record);
            }

            conversation.contents.push(Content {
                role: Role::Model,
                parts: model_parts,
            });
            conversation.contents.push(Content {
                role: Role::Function,
                parts: response_parts,
            });
        }

        tracing::warn!(
            max_rounds = self.settings.max_rounds,
            "Function-calling round cap reached without a final answer"
        );
        Ok(ChatTurn {
            final_text,
            tool_calls: records,
        })
    }

    async fn execute(&self, index: &ToolIndex, call: &FunctionCall) -> ToolCallRecord {
        match index.resolve(&call.name) {
            Ok(target) => {
                let result = self
                    .facade
                    .call_tool(&target.server_id, &target.tool_name, Some(call.args.clone()))
                    .await;
                ToolCallRecord {
                    server_name: target.server_name.clone(),
                    tool_name: target.tool_name.clone(),
                    arguments: call.args.clone(),
                    result,
                }
            }
            Err(e) => {
                tracing::warn!(function = %call.name, "Model requested an unknown function");
                ToolCallRecord {
                    server_name: String::new(),
                    tool_name: call.name.clone(),
                    arguments: call.args.clone(),
                    result: McpResponse::failed(e),
                }
            }
        }
    }

    /// Function-response body: the serialized result, bounded in size.
    fn response_payload(&self, result: &McpResponse<ToolCallResult>) -> Value {
        match (result.success, &result.data) {
            (true, Some(data)) => {
                let key = if data.is_error { "error" } else { "result" };
                json!({ key: truncate(data.text(), self.settings.max_tool_result_bytes) })
            }
            _ => json!({
                "error": result.error.clone().unwrap_or_else(|| "tool call failed".into())
            }),
        }
    }
}

/// Cut `text` to at most `max` bytes on a char boundary, noting what was dropped.
pub fn truncate(text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    let dropped = text.len() - end;
    format!("{}…[truncated {dropped} bytes]", &text[..end])
}
