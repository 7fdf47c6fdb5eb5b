//! OpenAI-backed vision and image-generation collaborators.
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::OpenAiConfig;
use crate::error::ExternalError;
use crate::pipeline::VISION_PROMPT;
use crate::services::{ImageGenerator, VisionDescriber};

#[derive(Clone, Debug)]
pub struct OpenAiClient {
    http: Client,
    api_key: String,
    config: OpenAiConfig,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    url: Option<String>,
}

impl OpenAiClient {
    pub fn new(api_key: impl Into<String>, config: OpenAiConfig) -> Self {
        Self {
            http: Client::new(),
            api_key: api_key.into(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    async fn post_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, ExternalError> {
        let response = self
            .http
            .post(self.endpoint(path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| {
                ExternalError::Transient(format!("decoding response: {e}"))
            })
    }
}

/// 429 is the provider's quota signal; everything else is worth a quick
/// retry.
async fn check_status(response: Response) -> Result<Response, ExternalError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = format!("{status}: {}", body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS {
        Err(ExternalError::Throttled(message))
    } else {
        Err(ExternalError::Transient(message))
    }
}

fn transport_error(e: reqwest::Error) -> ExternalError {
    ExternalError::Transient(format!("request failed: {e}"))
}

#[async_trait]
impl VisionDescriber for OpenAiClient {
    async fn describe(&self, image_ref: &str) -> Result<String, ExternalError> {
        let body = json!({
            "model": self.config.vision_model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": VISION_PROMPT },
                    { "type": "image_url", "image_url": { "url": image_ref } },
                ],
            }],
            "max_tokens": self.config.max_tokens,
        });

        let response: ChatResponse =
            self.post_json("chat/completions", body).await?;
        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_owned())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ExternalError::Transient("empty description".into())
            })?;

        debug!(chars = text.len(), "vision description received");
        Ok(text)
    }
}

#[async_trait]
impl ImageGenerator for OpenAiClient {
    async fn generate(&self, prompt: &str) -> Result<String, ExternalError> {
        let body = json!({
            "model": self.config.image_model,
            "prompt": prompt,
            "n": 1,
            "size": self.config.image_size,
            "response_format": "url",
        });

        let response: ImagesResponse =
            self.post_json("images/generations", body).await?;
        response
            .data
            .into_iter()
            .find_map(|d| d.url)
            .ok_or_else(|| {
                ExternalError::Transient("no image in response".into())
            })
    }

    async fn download(&self, image_ref: &str) -> Result<Bytes, ExternalError> {
        let response = self
            .http
            .get(image_ref)
            .send()
            .await
            .map_err(transport_error)?;

        check_status(response)
            .await?
            .bytes()
            .await
            .map_err(transport_error)
    }
}
