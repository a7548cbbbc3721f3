// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// HTTP Generator Client
//
// Anti-Corruption Layer for the external generation service:
//   POST {endpoint}/generate   GenerationRequest -> GenerateResponse
//   GET  {endpoint}/health     2xx = healthy
//
// Status mapping: 429 -> QueueFull, 503 -> ColdStart, other non-2xx ->
// Unavailable. Call timeouts are applied by the GatedGenerator.

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::generator::{GenerationOutput, GenerationRequest, GeneratorError, MusicGenerator};
use crate::domain::music::{ControlPoint, Note};

pub struct HttpGenerator {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    success: bool,
    #[serde(default)]
    notes: Vec<Note>,
    #[serde(default)]
    expression: Vec<ControlPoint>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpGenerator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl MusicGenerator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, GeneratorError> {
        let url = format!("{}/generate", self.endpoint);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GeneratorError::Timeout
                } else {
                    GeneratorError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                429 => GeneratorError::QueueFull,
                503 => GeneratorError::ColdStart,
                _ => GeneratorError::Unavailable(format!("HTTP {}: {}", status, error_text)),
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GeneratorError::InvalidResponse(format!("Failed to parse response: {}", e)))?;

        if !body.success {
            return Err(GeneratorError::InvalidResponse(
                body.error.unwrap_or_else(|| "generation reported failure".to_string()),
            ));
        }

        Ok(GenerationOutput {
            notes: body.notes,
            expression: body.expression,
        })
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.endpoint);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!(error = %e, "Generator health check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::generator::{CreativeParams, GenerationKind, StructuralParams};
    use serde_json::json;

    fn request() -> GenerationRequest {
        GenerationRequest {
            kind: GenerationKind::Part,
            structural: StructuralParams {
                instrument: "bass".to_string(),
                role: "low end".to_string(),
                tempo: 96,
                key: "E minor".to_string(),
                start_beat: 16.0,
                duration_beats: 16.0,
                bars: 4,
                beats_per_bar: 4.0,
            },
            creative: CreativeParams {
                prompt: "round and warm".to_string(),
                style: "neo soul".to_string(),
                character: Some("relaxed".to_string()),
                continuation: vec![],
                dependency: vec![Note::new(36, 0.0, 0.5, 100)],
            },
        }
    }

    #[tokio::test]
    async fn test_generate_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/generate")
            .match_body(mockito::Matcher::PartialJson(json!({
                "kind": "part",
                "structural": {"instrument": "bass", "start_beat": 16.0}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "success": true,
                    "notes": [{"pitch": 40, "start_beat": 0.0, "duration_beats": 1.0, "velocity": 90}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let generator = HttpGenerator::new(format!("{}/", server.url()));
        let output = generator.generate(&request()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(output.notes, vec![Note::new(40, 0.0, 1.0, 90)]);
        assert!(output.expression.is_empty());
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let generator = HttpGenerator::new(server.url());

        for (status, expected) in [
            (429, GeneratorError::QueueFull),
            (503, GeneratorError::ColdStart),
        ] {
            let mock = server
                .mock("POST", "/generate")
                .with_status(status)
                .create_async()
                .await;
            assert_eq!(generator.generate(&request()).await, Err(expected));
            mock.remove_async().await;
        }

        let _mock = server
            .mock("POST", "/generate")
            .with_status(500)
            .create_async()
            .await;
        assert!(matches!(
            generator.generate(&request()).await,
            Err(GeneratorError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_reported_failure_is_invalid_response() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/generate")
            .with_status(200)
            .with_body(json!({"success": false, "error": "empty sample"}).to_string())
            .create_async()
            .await;

        let generator = HttpGenerator::new(server.url());
        assert_eq!(
            generator.generate(&request()).await,
            Err(GeneratorError::InvalidResponse("empty sample".to_string()))
        );
    }

    #[tokio::test]
    async fn test_health_check() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("GET", "/health").with_status(200).create_async().await;
        assert!(HttpGenerator::new(server.url()).health_check().await);

        assert!(!HttpGenerator::new("http://127.0.0.1:1").health_check().await);
    }
}
