use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use retrieval::{CompletionModel, CompletionRequest, Embedder};
use serde::{Deserialize, Serialize};

use crate::config::OpenAiConfig;

/// Shared HTTP plumbing for the embeddings and chat completion endpoints.
#[derive(Clone)]
struct OpenAiClient {
    client: Client,
    api_key: String,
    api_base: String,
}

impl OpenAiClient {
    fn new(config: &OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build OpenAI client")?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let resp = self
            .client
            .post(format!("{}/{}", self.api_base, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("OpenAI {path} request failed"))?;
        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI {path} returned {status}: {error_text}");
        }
        resp.json()
            .await
            .with_context(|| format!("failed to decode OpenAI {path} response"))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

pub struct OpenAiEmbedder {
    client: OpenAiClient,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::new(config)?,
            model: config.embedding_model.clone(),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let response: EmbeddingResponse = self
            .client
            .post(
                "embeddings",
                &EmbeddingRequest {
                    model: &self.model,
                    input: text,
                },
            )
            .await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("OpenAI returned no embedding"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct OpenAiCompletion {
    client: OpenAiClient,
    model: String,
}

impl OpenAiCompletion {
    pub fn new(config: &OpenAiConfig) -> Result<Self> {
        Ok(Self {
            client: OpenAiClient::new(config)?,
            model: config.completion_model.clone(),
        })
    }
}

#[async_trait]
impl CompletionModel for OpenAiCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response: ChatCompletionResponse = self
            .client
            .post(
                "chat/completions",
                &ChatCompletionRequest {
                    model: &self.model,
                    messages: vec![ChatMessage {
                        role: "user".to_string(),
                        content: request.prompt.clone(),
                    }],
                    temperature: request.temperature,
                },
            )
            .await?;
        response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("OpenAI returned no choices"))
    }
}
