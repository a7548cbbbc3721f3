// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Llm
//!
//! Language-model interface consumed by the agents.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Anti-corruption layer between the agents and any model vendor

// The orchestrator treats the model as a black box: it only reasons about
// when it is called and how many times. Implementations live in
// infrastructure/llm/.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

/// Why the model is being called. Used for logging and by test doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPurpose {
    InstrumentPlan,
    GapFill,
    SectionRefinement,
    Mixing,
}

/// Function-style tool the model may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    pub purpose: ModelPurpose,
    /// Instrument name, or `"coordinator"`.
    pub subject: String,
    pub system: String,
    pub prompt: String,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn into_chunks(self) -> Vec<ModelChunk> {
        let mut chunks = Vec::with_capacity(self.tool_calls.len() + 1);
        if !self.text.is_empty() {
            chunks.push(ModelChunk::Text(self.text));
        }
        chunks.extend(self.tool_calls.into_iter().map(ModelChunk::ToolCall));
        chunks
    }
}

/// Incremental fragment of a streamed completion.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelChunk {
    Text(String),
    ToolCall(ToolCall),
}

/// Domain interface for model providers
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, LLMError>;

    /// Streaming variant. The default adapts [`LLMProvider::complete`] into a
    /// single burst of chunks.
    fn complete_stream<'a>(
        &'a self,
        request: &'a ModelRequest,
    ) -> BoxStream<'a, Result<ModelChunk, LLMError>> {
        stream::once(self.complete(request))
            .flat_map(|result| {
                let chunks: Vec<Result<ModelChunk, LLMError>> = match result {
                    Ok(response) => response.into_chunks().into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(chunks)
            })
            .boxed()
    }
}

/// Collect a streamed completion, handing each text fragment to `on_text`.
pub async fn collect_stream(
    mut stream: BoxStream<'_, Result<ModelChunk, LLMError>>,
    mut on_text: impl FnMut(&str),
) -> Result<ModelResponse, LLMError> {
    let mut response = ModelResponse::default();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            ModelChunk::Text(text) => {
                on_text(&text);
                response.text.push_str(&text);
            }
            ModelChunk::ToolCall(call) => response.tool_calls.push(call),
        }
    }
    Ok(response)
}

/// Errors that can occur during model operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
