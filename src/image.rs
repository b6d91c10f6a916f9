//! Image generation models.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::config::ProviderConfig;
use crate::error::{LLMError, map_http_error};
use crate::http::{DynHttpTransport, post_json_with_headers};
use crate::provider::{GeneratedImage, ImageModel, ImageRequest, ImageResponse};

/// OpenAI `/v1/images/generations` model.
pub struct OpenAiImageModel {
    transport: DynHttpTransport,
    config: ProviderConfig,
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageEntry>,
}

#[derive(Debug, Deserialize)]
struct ImageEntry {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    b64_json: Option<String>,
    #[serde(default)]
    revised_prompt: Option<String>,
}

impl OpenAiImageModel {
    pub fn new(transport: DynHttpTransport, config: ProviderConfig) -> Self {
        Self { transport, config }
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com")
            .trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/images/generations")
        } else {
            format!("{base}/v1/images/generations")
        }
    }
}

#[async_trait]
impl ImageModel for OpenAiImageModel {
    async fn generate_image(&self, request: ImageRequest) -> Result<ImageResponse, LLMError> {
        let api_key = self
            .config
            .resolve_api_key("OPENAI_API_KEY")
            .ok_or_else(|| LLMError::Auth {
                message: "missing API key for openai images".to_string(),
            })?;
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), format!("Bearer {api_key}"));
        headers.insert("Content-Type".to_string(), "application/json".to_string());

        let mut body = Map::new();
        body.insert(
            "model".to_string(),
            Value::String(
                request
                    .model
                    .clone()
                    .or_else(|| self.config.model.clone())
                    .unwrap_or_else(|| "gpt-image-1".to_string()),
            ),
        );
        body.insert("prompt".to_string(), Value::String(request.prompt.clone()));
        if let Some(size) = &request.size {
            body.insert("size".to_string(), Value::String(size.clone()));
        }
        if let Some(count) = request.count {
            body.insert("n".to_string(), json!(count));
        }

        let response = post_json_with_headers(
            self.transport.as_ref(),
            self.endpoint(),
            headers,
            &Value::Object(body),
            self.config.timeout,
            request.cancel.clone(),
        )
        .await?;
        let status = response.status;
        if !(200..300).contains(&status) {
            let headers = response.headers.clone();
            let text = response.into_string().unwrap_or_default();
            return Err(map_http_error(status, &headers, &text));
        }
        let text = response.into_string()?;
        let parsed: ImagesResponse = serde_json::from_str(&text)
            .map_err(|err| LLMError::other(format!("failed to parse images response: {err}")))?;

        Ok(ImageResponse {
            images: parsed
                .data
                .into_iter()
                .map(|entry| GeneratedImage {
                    url: entry.url,
                    b64_data: entry.b64_json,
                    revised_prompt: entry.revised_prompt,
                })
                .collect(),
        })
    }

    fn provider_id(&self) -> &str {
        "openai"
    }
}
