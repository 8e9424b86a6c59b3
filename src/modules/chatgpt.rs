//! ChatGPT adapter: streaming chat completions through the official
//! OpenAI API.

use async_openai::error::OpenAIError;
use async_openai::types::{ChatCompletionRequestMessageArgs, CreateChatCompletionRequestArgs, Role};
use async_openai::Client as OpenAIClient;
use futures::StreamExt;
use uuid::Uuid;

use crate::config::ChatGptConfig;
use crate::conversation::ConversationState;
use crate::dispatch::{ChatAdapter, ChunkSink};
use crate::error::BotError;
use crate::request::Request;

pub struct ChatGptAdapter {
    client: OpenAIClient,
    model: String,
    max_tokens: Option<u16>,
}

impl ChatGptAdapter {
    pub fn new(config: &ChatGptConfig) -> Self {
        Self {
            client: OpenAIClient::new().with_api_key(&config.api_key),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

/// Some stream chunks omit the message id; the last one seen wins.
fn latest_message_id(current: Option<String>, incoming: Option<&String>) -> Option<String> {
    incoming.cloned().or(current)
}

pub(crate) fn map_openai_error(err: OpenAIError) -> BotError {
    let description = err.to_string();
    if description.to_lowercase().contains("content policy")
        || description.to_lowercase().contains("safety system")
    {
        BotError::ContentPolicy(description)
    } else {
        BotError::BackendHttp(description)
    }
}

#[async_trait]
impl ChatAdapter for ChatGptAdapter {
    fn name(&self) -> &'static str {
        "chatgpt"
    }

    async fn send(
        &self,
        request: &Request,
        state: Option<ConversationState>,
        sink: &ChunkSink<'_>,
    ) -> Result<Option<ConversationState>, BotError> {
        let user_msg = ChatCompletionRequestMessageArgs::default()
            .role(Role::User)
            .content(request.prompt.clone())
            .build()
            .map_err(map_openai_error)?;

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.model).messages(vec![user_msg]);
        if let Some(max_tokens) = self.max_tokens {
            args.max_tokens(max_tokens);
        }
        let req = args.build().map_err(map_openai_error)?;

        let mut stream = self
            .client
            .chat()
            .create_stream(req)
            .await
            .map_err(map_openai_error)?;

        let mut accumulated = String::new();
        let mut last_message_id = None;
        while let Some(item) = stream.next().await {
            let response = item.map_err(map_openai_error)?;
            last_message_id = latest_message_id(last_message_id, response.id.as_ref());
            if let Some(delta) = response
                .choices
                .get(0)
                .and_then(|choice| choice.delta.content.as_deref())
            {
                if !delta.is_empty() {
                    accumulated.push_str(delta);
                    sink.text(accumulated.clone()).await;
                }
            }
        }

        if accumulated.is_empty() {
            return Err(anyhow!("Server returned an empty response").into());
        }

        let conversation_id = state
            .and_then(|s| s.conversation_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Some(ConversationState::new(
            Some(conversation_id),
            last_message_id,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_tracking_survives_chunks_without_ids() {
        let id = latest_message_id(None, Some(&"chatcmpl-1".to_owned()));
        assert_eq!(id.as_deref(), Some("chatcmpl-1"));
        // Chunks without an id keep the one already seen.
        let id = latest_message_id(id, None);
        assert_eq!(id.as_deref(), Some("chatcmpl-1"));
        let id = latest_message_id(id, Some(&"chatcmpl-2".to_owned()));
        assert_eq!(id.as_deref(), Some("chatcmpl-2"));
    }
}
