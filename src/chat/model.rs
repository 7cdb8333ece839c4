use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored a message in the caller's chat history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One message of the history handed to a chat turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

// ── Model-facing conversation ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Function,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Value,
}

/// `{"text": ..}`, `{"functionCall": ..}` or `{"functionResponse": ..}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl From<&ChatMessage> for Content {
    fn from(message: &ChatMessage) -> Self {
        let role = match message.role {
            ChatRole::User => Role::User,
            ChatRole::Assistant => Role::Model,
        };
        Self {
            role,
            parts: vec![Part::Text(message.content.clone())],
        }
    }
}

/// System instruction plus the running message list sent on every round.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub system_instruction: String,
    pub contents: Vec<Content>,
}

/// A callable function as declared to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One model response: its text and any function calls it requested.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReply {
    pub text: String,
    pub function_calls: Vec<FunctionCall>,
}

impl ModelReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            function_calls: Vec::new(),
        }
    }
}

/// A generative model with function calling.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(
        &self,
        conversation: &Conversation,
        tools: &[FunctionDeclaration],
    ) -> anyhow::Result<ModelReply>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parts_serialize_in_wire_shape() {
        let content = Content {
            role: Role::Model,
            parts: vec![
                Part::Text("checking".into()),
                Part::FunctionCall(FunctionCall {
                    name: "a__search".into(),
                    args: json!({"q": "x"}),
                }),
            ],
        };
        assert_eq!(
            serde_json::to_value(&content).unwrap(),
            json!({
                "role": "model",
                "parts": [
                    {"text": "checking"},
                    {"functionCall": {"name": "a__search", "args": {"q": "x"}}}
                ]
            })
        );
    }

    #[test]
    fn history_maps_assistant_to_model_role() {
        let content = Content::from(&ChatMessage::assistant("hi"));
        assert_eq!(content.role, Role::Model);
        assert_eq!(content.parts, vec![Part::Text("hi".into())]);
    }
}
