//! OpenAI-compatible provider client
//! Works with any backend exposing `POST {endpoint}/chat/completions`
//! (OpenAI, Qwen, DeepSeek, GLM, vLLM and most self-hosted gateways)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::HeaderMap, header::HeaderValue, header::AUTHORIZATION, header::CONTENT_TYPE, Client};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::llm::traits::ModelProviderClient;
use crate::llm::{ModelProviderError, ModelRequest, ModelResult, ProviderReply};

/// Chat completion request body
#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Debug, Deserialize)]
struct ErrorDetails {
    message: String,
}

pub struct OpenAICompatibleClient {
    client: Client,
    provider_id: String,
    base_url: String,
    api_key: Option<String>,
    model_name: String,
    timeout: Duration,
}

impl OpenAICompatibleClient {
    pub fn new(
        provider_id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            provider_id: provider_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model_name: model_name.into(),
            timeout,
        }
    }

    fn build_headers(&self) -> ModelResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", key))
                    .map_err(|e| ModelProviderError::Internal(format!("Invalid API key format: {}", e)))?,
            );
        }
        Ok(headers)
    }

    fn convert_request(&self, request: &ModelRequest) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        ChatRequest {
            model: request
                .model_name
                .clone()
                .unwrap_or_else(|| self.model_name.clone()),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
        }
    }

    fn convert_response(&self, response: ChatResponse) -> ModelResult<ProviderReply> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ModelProviderError::InvalidResponse("response has no choices".to_string()))?;

        Ok(ProviderReply {
            content: choice.message.content,
            model_name: response.model.unwrap_or_else(|| self.model_name.clone()),
            prompt_tokens: response.usage.as_ref().map(|u| u.prompt_tokens),
            completion_tokens: response.usage.as_ref().map(|u| u.completion_tokens),
        })
    }

    /// Map an error response, preferring the structured message when present
    fn handle_error_response(&self, status_code: u16, error_text: &str) -> ModelProviderError {
        let message = serde_json::from_str::<ErrorBody>(error_text)
            .map(|body| body.error.message)
            .unwrap_or_else(|_| error_text.to_string());
        ModelProviderError::from_status(status_code, message)
    }
}

#[async_trait]
impl ModelProviderClient for OpenAICompatibleClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn default_model(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: &ModelRequest) -> ModelResult<ProviderReply> {
        let headers = self.build_headers()?;
        let body = self.convert_request(request);
        let request_url = format!("{}/chat/completions", self.base_url);

        debug!(provider_id = %self.provider_id, url = %request_url, model = %body.model, "Sending chat completion");

        let response = self
            .client
            .post(&request_url)
            .headers(headers)
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelProviderError::Timeout(e.to_string())
                } else {
                    ModelProviderError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            error!(provider_id = %self.provider_id, %status, "Provider returned error: {}", error_text);
            return Err(self.handle_error_response(status.as_u16(), &error_text));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| ModelProviderError::InvalidResponse(e.to_string()))?;

        self.convert_response(chat_response)
    }
}
