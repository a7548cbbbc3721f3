// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// OpenAI LLM Provider Adapter
//
// Anti-Corruption Layer for the OpenAI chat completions API with function
// tools. Also works with OpenAI-compatible APIs (LM Studio, vLLM, etc.)

use crate::domain::config::LLMConfig;
use crate::domain::llm::{LLMError, LLMProvider, ModelRequest, ModelResponse, ToolCall};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub struct OpenAIAdapter {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAITool<'a>>,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OpenAITool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAIFunction<'a>,
}

#[derive(Serialize)]
struct OpenAIFunction<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAIToolCall>,
}

#[derive(Deserialize)]
struct OpenAIToolCall {
    function: OpenAIFunctionCall,
}

#[derive(Deserialize)]
struct OpenAIFunctionCall {
    name: String,
    /// JSON-encoded object.
    arguments: String,
}

/// Resolve `env:VAR_NAME` references; anything else is taken literally.
pub fn resolve_api_key(value: Option<&str>) -> anyhow::Result<String> {
    match value {
        None => Ok(String::new()),
        Some(value) => match value.strip_prefix("env:") {
            Some(var) => std::env::var(var)
                .map_err(|_| anyhow::anyhow!("Environment variable '{}' for llm.api_key is not set", var)),
            None => Ok(value.to_string()),
        },
    }
}

impl OpenAIAdapter {
    pub fn new(endpoint: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            model,
        }
    }

    pub fn from_config(config: &LLMConfig) -> anyhow::Result<Self> {
        let api_key = resolve_api_key(config.api_key.as_deref())?;
        Ok(Self::new(config.endpoint.clone(), api_key, config.model.clone()))
    }
}

#[async_trait]
impl LLMProvider for OpenAIAdapter {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, LLMError> {
        // Translate our domain types to OpenAI's types
        let mut messages = Vec::with_capacity(2);
        if !request.system.is_empty() {
            messages.push(OpenAIMessage {
                role: "system",
                content: request.system.clone(),
            });
        }
        messages.push(OpenAIMessage {
            role: "user",
            content: request.prompt.clone(),
        });

        let body = OpenAIRequest {
            model: &self.model,
            messages,
            tools: request
                .tools
                .iter()
                .map(|tool| OpenAITool {
                    kind: "function",
                    function: OpenAIFunction {
                        name: &tool.name,
                        description: &tool.description,
                        parameters: &tool.parameters,
                    },
                })
                .collect(),
        };

        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));

        let mut builder = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            return Err(if status == 401 || status == 403 {
                LLMError::Authentication(error_text)
            } else if status == 429 {
                LLMError::RateLimit
            } else if status == 404 {
                LLMError::ModelNotFound(self.model.clone())
            } else {
                LLMError::Provider(format!("HTTP {}: {}", status, error_text))
            });
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Provider(format!("Failed to parse response: {}", e)))?;

        // Translate OpenAI's response to our domain types
        let choice = openai_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::Provider("No response from model".into()))?;

        let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
        for call in choice.message.tool_calls {
            let arguments = serde_json::from_str(&call.function.arguments).map_err(|e| {
                LLMError::Provider(format!(
                    "Invalid arguments for tool '{}': {}",
                    call.function.name, e
                ))
            })?;
            tool_calls.push(ToolCall::new(call.function.name, arguments));
        }

        Ok(ModelResponse {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }
}
