//! DALL-E adapter: the OpenAI image generation endpoint.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;

use crate::config::{ChatGptConfig, DalleConfig};
use crate::conversation::ConversationState;
use crate::dispatch::{ChatAdapter, ChunkSink};
use crate::error::BotError;
use crate::request::Request;

const IMAGES_URL: &str = "https://api.openai.com/v1/images/generations";

pub struct DalleAdapter {
    api_key: String,
    image_size: String,
    images_count: u8,
    timeout_seconds: u64,
}

#[derive(Deserialize)]
struct ImagesResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    b64_json: String,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorBody,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
    #[serde(default)]
    code: Option<String>,
}

impl DalleAdapter {
    pub fn new(chatgpt: &ChatGptConfig, config: &DalleConfig) -> Self {
        // DALL-E shares the OpenAI account; an explicit key wins over
        // the ChatGPT one.
        let api_key = if config.api_key.is_empty() {
            chatgpt.api_key.clone()
        } else {
            config.api_key.clone()
        };
        Self {
            api_key,
            image_size: config.image_size.clone(),
            images_count: config.images_count.max(1),
            timeout_seconds: config.timeout_seconds,
        }
    }
}

#[async_trait]
impl ChatAdapter for DalleAdapter {
    fn name(&self) -> &'static str {
        "dalle"
    }

    async fn send(
        &self,
        request: &Request,
        _state: Option<ConversationState>,
        sink: &ChunkSink<'_>,
    ) -> Result<Option<ConversationState>, BotError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_seconds))
            .build()?;

        let response = client
            .post(IMAGES_URL)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "prompt": request.prompt,
                "n": self.images_count,
                "size": self.image_size,
                "response_format": "b64_json",
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            if let Ok(api_error) = response.json::<ApiErrorResponse>().await {
                let flagged = api_error
                    .error
                    .code
                    .as_deref()
                    .map(|code| code.contains("content_policy"))
                    .unwrap_or(false)
                    || api_error.error.message.to_lowercase().contains("content policy");
                if flagged {
                    return Err(BotError::ContentPolicy(api_error.error.message));
                }
                return Err(BotError::BackendHttp(api_error.error.message));
            }
            return Err(BotError::BackendHttp(format!("status {}", status)));
        }

        let images: ImagesResponse = response.json().await?;
        if images.data.is_empty() {
            return Err(anyhow!("Server returned no images").into());
        }
        for image in images.data {
            let bytes = BASE64
                .decode(image.b64_json.as_bytes())
                .map_err(|err| anyhow!("Invalid image payload: {}", err))?;
            sink.image(bytes).await;
        }

        // Image generation has no conversation continuity.
        Ok(None)
    }
}
