use super::model::{ChatModel, Content, Conversation, FunctionCall, FunctionDeclaration, ModelReply};
use crate::config::ModelConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Generative Language API client (`models/{model}:generateContent`).
pub struct GeminiModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    temperature: Option<f32>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: SystemInstruction<'a>,
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolBlock<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolBlock<'a> {
    function_declarations: &'a [FunctionDeclaration],
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

/// Response parts may carry extra fields (e.g. thought signatures) next to
/// the payload, so they are read leniently rather than as [`super::model::Part`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    function_call: Option<FunctionCall>,
    #[serde(default)]
    thought: bool,
}

impl GeminiModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let api_key = config
            .resolved_api_key()
            .context("No model API key configured (set [model].api_key or GEMINI_API_KEY)")?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }
}

fn build_request<'a>(
    conversation: &'a Conversation,
    tools: &'a [FunctionDeclaration],
    temperature: Option<f32>,
) -> GenerateRequest<'a> {
    GenerateRequest {
        system_instruction: SystemInstruction {
            parts: [TextPart {
                text: &conversation.system_instruction,
            }],
        },
        contents: &conversation.contents,
        tools: if tools.is_empty() {
            Vec::new()
        } else {
            vec![ToolBlock {
                function_declarations: tools,
            }]
        },
        generation_config: temperature.map(|temperature| GenerationConfig { temperature }),
    }
}

fn parse_reply(response: GenerateResponse) -> Result<ModelReply> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        bail!("model returned no candidates");
    };

    let mut reply = ModelReply::default();
    let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
    if parts.is_empty() {
        if let Some(reason) = candidate.finish_reason.filter(|r| r != "STOP") {
            tracing::warn!(finish_reason = %reason, "Model returned an empty candidate");
        }
    }

    for part in parts.into_iter().filter(|p| !p.thought) {
        if let Some(text) = part.text {
            reply.text.push_str(&text);
        }
        if let Some(call) = part.function_call {
            reply.function_calls.push(call);
        }
    }
    Ok(reply)
}

#[async_trait]
impl ChatModel for GeminiModel {
    async fn generate(
        &self,
        conversation: &Conversation,
        tools: &[FunctionDeclaration],
    ) -> Result<ModelReply> {
        let body = build_request(conversation, tools, self.temperature);
        let resp = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("model request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "model API returned HTTP {status}: {}",
                text.chars().take(500).collect::<String>()
            );
        }

        let parsed: GenerateResponse = resp.json().await.context("malformed model response")?;
        parse_reply(parsed)
    }
}
