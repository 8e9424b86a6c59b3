//! EdgeGPT (Bing chat) adapter.
//!
//! Talks to a local gateway that wraps the unofficial Bing protocol.
//! The gateway streams line-delimited JSON; each line carries the
//! response text accumulated so far plus the conversation ids, which
//! lets the bot edit its reply message as generation progresses.
//! Photo attachments are passed through base64-encoded for Bing's
//! image-input feature.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use serde::Deserialize;

use super::{drain_lines, proxied_client};
use crate::config::GatewayConfig;
use crate::conversation::ConversationState;
use crate::dispatch::{ChatAdapter, ChunkSink};
use crate::error::BotError;
use crate::proxy::ProxyPool;
use crate::request::Request;

pub struct EdgeGptAdapter {
    config: GatewayConfig,
    proxy_pool: Arc<ProxyPool>,
}

/// One streamed gateway line.
#[derive(Debug, Deserialize)]
struct GatewayLine {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    parent_id: Option<String>,
    /// Set when the upstream refused the prompt.
    #[serde(default)]
    blocked: bool,
    #[serde(default)]
    error: Option<String>,
}

impl EdgeGptAdapter {
    pub fn new(config: GatewayConfig, proxy_pool: Arc<ProxyPool>) -> Self {
        Self { config, proxy_pool }
    }
}

#[async_trait]
impl ChatAdapter for EdgeGptAdapter {
    fn name(&self) -> &'static str {
        "edgegpt"
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
                "image": request.attachment.as_ref().map(|bytes| BASE64.encode(bytes)),
                "conversation_id": prior.conversation_id,
                "parent_id": prior.parent_id,
                "style": request.style,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BotError::BackendHttp(format!(
                "status {}",
                response.status()
            )));
        }

        let mut conversation_id = prior.conversation_id;
        let mut parent_id = prior.parent_id;
        let mut last_text = String::new();

        let mut body = response.bytes_stream();
        let mut buffer = Vec::new();
        while let Some(part) = body.next().await {
            buffer.extend_from_slice(&part?);
            for line in drain_lines(&mut buffer) {
                let parsed: GatewayLine = serde_json::from_str(&line)
                    .map_err(|err| anyhow!("Malformed gateway line: {}", err))?;
                if parsed.blocked {
                    return Err(BotError::ContentPolicy(
                        parsed.error.unwrap_or_else(|| "prompt was blocked".to_owned()),
                    ));
                }
                if let Some(error) = parsed.error {
                    return Err(BotError::BackendHttp(error));
                }
                if let Some(id) = parsed.conversation_id {
                    conversation_id = Some(id);
                }
                if let Some(id) = parsed.parent_id {
                    parent_id = Some(id);
                }
                if let Some(text) = parsed.text {
                    if text != last_text {
                        last_text = text;
                        sink.text(last_text.clone()).await;
                    }
                }
            }
        }

        if last_text.is_empty() {
            return Err(anyhow!("Server returned an empty response").into());
        }
        Ok(Some(ConversationState::new(conversation_id, parent_id)))
    }
}
