//! Anthropic Messages API oracle: plain-text completion plus a
//! schema-constrained variant built on the same tool-forcing trick the
//! streaming client used to drive tool calls.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::oracle::{Oracle, OracleError, OracleResult};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicOracle {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicOracle {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
        }
    }

    async fn send(&self, body: &AnthropicRequest) -> OracleResult<AnthropicResponse> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(OracleError::RequestFailed(format!("{status}: {text}")));
        }

        response
            .json::<AnthropicResponse>()
            .await
            .map_err(OracleError::Network)
    }
}

#[async_trait]
impl Oracle for AnthropicOracle {
    async fn query(
        &self,
        system_prompt: &str,
        user_prompt: Option<&str>,
        model: &str,
        temperature: f64,
    ) -> OracleResult<String> {
        let body = AnthropicRequest {
            model: model.to_string(),
            system: Some(system_prompt.to_string()),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: user_prompt.unwrap_or("Proceed.").to_string(),
            }],
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature,
            tools: None,
            tool_choice: None,
        };
        let response = self.send(&body).await?;
        let text = response
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::ToolUse { .. } => None,
            })
            .ok_or_else(|| OracleError::SchemaMismatch("no text block in response".to_string()))?;
        Ok(text)
    }

    async fn query_structured(
        &self,
        system_prompt: &str,
        user_prompt: Option<&str>,
        model: &str,
        temperature: f64,
        schema_name: &str,
        schema: &serde_json::Value,
    ) -> OracleResult<serde_json::Value> {
        let tool = AnthropicTool {
            name: schema_name.to_string(),
            description: format!("Emit a single {schema_name} object matching the schema."),
            input_schema: schema.clone(),
        };
        let body = AnthropicRequest {
            model: model.to_string(),
            system: Some(system_prompt.to_string()),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: user_prompt.unwrap_or("Proceed.").to_string(),
            }],
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature,
            tools: Some(vec![tool]),
            tool_choice: Some(AnthropicToolChoice {
                choice_type: "tool".to_string(),
                name: Some(schema_name.to_string()),
            }),
        };
        let response = self.send(&body).await?;
        response
            .content
            .into_iter()
            .find_map(|block| match block {
                ContentBlock::ToolUse { input, .. } => Some(input),
                ContentBlock::Text { .. } => None,
            })
            .ok_or_else(|| {
                OracleError::SchemaMismatch(format!("no tool_use block for {schema_name}"))
            })
    }
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<AnthropicToolChoice>,
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Serialize)]
struct AnthropicToolChoice {
    #[serde(rename = "type")]
    choice_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[allow(dead_code)]
        name: String,
        input: serde_json::Value,
    },
}
