//! Bard adapter: single-shot JSON exchange with its gateway.

use std::sync::Arc;

use serde::Deserialize;

use super::proxied_client;
use crate::config::GatewayConfig;
use crate::conversation::ConversationState;
use crate::dispatch::{ChatAdapter, ChunkSink};
use crate::error::BotError;
use crate::proxy::ProxyPool;
use crate::request::Request;

pub struct BardAdapter {
    config: GatewayConfig,
    proxy_pool: Arc<ProxyPool>,
}

#[derive(Debug, Deserialize)]
struct BardResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    response_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl BardAdapter {
    pub fn new(config: GatewayConfig, proxy_pool: Arc<ProxyPool>) -> Self {
        Self { config, proxy_pool }
    }
}

#[async_trait]
impl ChatAdapter for BardAdapter {
    fn name(&self) -> &'static str {
        "bard"
    }

    async fn send(
        &self,
        request: &Request,
        state: Option<ConversationState>,
        sink: &ChunkSink<'_>,
    ) -> Result<Option<ConversationState>, BotError> {
        let client = proxied_client(
            &self.config.proxy,
            &self.proxy_pool,
            self.config.timeout_seconds,
        )?;

        let prior = state.unwrap_or_else(|| ConversationState::new(None, None));
        let response = client
            .post(&self.config.endpoint)
            .json(&serde_json::json!({
                "prompt": request.prompt,
                "conversation_id": prior.conversation_id,
                "parent_id": prior.parent_id,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::BackendHttp(format!(
                "status {}",
                response.status()
            )));
        }

        let reply: BardResponse = response.json().await?;
        if let Some(error) = reply.error {
            return Err(BotError::BackendHttp(error));
        }
        if reply.text.is_empty() {
            return Err(anyhow!("Server returned an empty response").into());
        }
        sink.text(reply.text).await;

        Ok(Some(ConversationState::new(
            reply.conversation_id.or(prior.conversation_id),
            reply.response_id,
        )))
    }
}
