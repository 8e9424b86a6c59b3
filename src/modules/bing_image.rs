//! Bing Image Creator adapter. The gateway returns image URLs; each
//! one is downloaded and forwarded as raw bytes.

use std::sync::Arc;

use serde::Deserialize;

use super::proxied_client;
use crate::config::GatewayConfig;
use crate::conversation::ConversationState;
use crate::dispatch::{ChatAdapter, ChunkSink};
use crate::error::BotError;
use crate::proxy::ProxyPool;
use crate::request::Request;

pub struct BingImageAdapter {
    config: GatewayConfig,
    proxy_pool: Arc<ProxyPool>,
}

#[derive(Debug, Deserialize)]
struct ImageGenResponse {
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    error: Option<String>,
}

impl BingImageAdapter {
    pub fn new(config: GatewayConfig, proxy_pool: Arc<ProxyPool>) -> Self {
        Self { config, proxy_pool }
    }
}

#[async_trait]
impl ChatAdapter for BingImageAdapter {
    fn name(&self) -> &'static str {
        "bing_imagegen"
    }

    async fn send(
        &self,
        request: &Request,
        _state: Option<ConversationState>,
        sink: &ChunkSink<'_>,
    ) -> Result<Option<ConversationState>, BotError> {
        let client = proxied_client(
            &self.config.proxy,
            &self.proxy_pool,
            self.config.timeout_seconds,
        )?;

        let response = client
            .post(&self.config.endpoint)
            .json(&serde_json::json!({ "prompt": request.prompt }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::BackendHttp(format!(
                "status {}",
                response.status()
            )));
        }

        let reply: ImageGenResponse = response.json().await?;
        if reply.blocked {
            return Err(BotError::ContentPolicy(
                reply.error.unwrap_or_else(|| "prompt was blocked".to_owned()),
            ));
        }
        if let Some(error) = reply.error {
            return Err(BotError::BackendHttp(error));
        }
        if reply.images.is_empty() {
            return Err(anyhow!("Server returned no images").into());
        }

        for url in reply.images {
            let bytes = client
                .get(&url)
                .send()
                .await?
                .error_for_status()
                .map_err(|err| BotError::BackendHttp(err.to_string()))?
                .bytes()
                .await?;
            sink.image(bytes.to_vec()).await;
        }

        Ok(None)
    }
}
