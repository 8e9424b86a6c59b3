//! Module dispatch: resolves a request's backend, feeds it the prior
//! conversation state and forwards every response chunk upstream as it
//! arrives, so the front-end can edit its message incrementally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::conversation::{ConversationState, ConversationStore};
use crate::error::BotError;
use crate::request::{Chunk, ModuleKind, Request, RequestStatus};

/// Consumer of response chunks, implemented by the Telegram sender
/// (and by recording stubs in tests).
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn deliver(&self, request: &Request, chunk: Chunk);
    /// Terminal notification; no chunk for `request` follows it.
    async fn completed(&self, request: &Request, status: RequestStatus);
}

/// What a completed exchange produced, for stats and data collecting.
#[derive(Debug, Default, Clone)]
pub struct ResponseSummary {
    pub text: String,
    pub images: Vec<Vec<u8>>,
}

/// Chunk outlet handed to adapters. Forwards each chunk to the sink
/// immediately and keeps a copy for the response summary.
pub struct ChunkSink<'a> {
    request: &'a Request,
    sink: &'a dyn ResponseSink,
    summary: Mutex<ResponseSummary>,
}

impl<'a> ChunkSink<'a> {
    fn new(request: &'a Request, sink: &'a dyn ResponseSink) -> Self {
        Self {
            request,
            sink,
            summary: Mutex::new(ResponseSummary::default()),
        }
    }

    /// Publishes the response text accumulated so far.
    pub async fn text(&self, accumulated: String) {
        self.summary.lock().unwrap().text = accumulated.clone();
        self.sink.deliver(self.request, Chunk::Text(accumulated)).await;
    }

    pub async fn image(&self, bytes: Vec<u8>) {
        self.summary.lock().unwrap().images.push(bytes.clone());
        self.sink.deliver(self.request, Chunk::Image(bytes)).await;
    }

    fn into_summary(self) -> ResponseSummary {
        self.summary.into_inner().unwrap()
    }
}

/// The uniform capability wrapping one external AI backend.
#[async_trait]
pub trait ChatAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Processes one prompt. Chunks go through `sink` as they arrive;
    /// the returned state (if any) is persisted by the dispatcher
    /// after the stream completes.
    async fn send(
        &self,
        request: &Request,
        state: Option<ConversationState>,
        sink: &ChunkSink<'_>,
    ) -> Result<Option<ConversationState>, BotError>;

    /// Drops whatever per-backend state the adapter keeps. Called by
    /// the admin restart command.
    async fn reset(&self) -> Result<(), BotError> {
        Ok(())
    }
}

pub struct ModuleDispatcher {
    adapters: HashMap<ModuleKind, Arc<dyn ChatAdapter>>,
    conversations: Arc<ConversationStore>,
}

impl ModuleDispatcher {
    pub fn new(
        adapters: HashMap<ModuleKind, Arc<dyn ChatAdapter>>,
        conversations: Arc<ConversationStore>,
    ) -> Self {
        Self {
            adapters,
            conversations,
        }
    }

    /// Runs one request to completion. Chunks are forwarded through
    /// `sink` as the adapter produces them; on success the new
    /// conversation state is persisted and a summary of the exchange
    /// is returned.
    pub async fn handle(
        &self,
        request: &Request,
        sink: &dyn ResponseSink,
    ) -> Result<ResponseSummary, BotError> {
        let adapter = self
            .adapters
            .get(&request.module)
            .ok_or_else(|| anyhow!("Module {} is not enabled", request.module))?;

        let prior = self.conversations.load(request.chat_id, request.module);
        let chunk_sink = ChunkSink::new(request, sink);
        let new_state = adapter.send(request, prior, &chunk_sink).await?;

        if let Some(state) = new_state {
            // A write failure must not fail the already-delivered
            // response; the next turn simply starts a fresh thread.
            if let Err(err) = self
                .conversations
                .save(request.chat_id, request.module, state)
            {
                error!(
                    "Failed to save conversation state for chat {}: {}",
                    request.chat_id, err
                );
            }
        }

        Ok(chunk_sink.into_summary())
    }

    pub fn clear_conversation(&self, chat_id: i64, module: ModuleKind) -> Result<(), BotError> {
        self.conversations.clear(chat_id, module)
    }

    pub async fn reset_all(&self) {
        for (kind, adapter) in &self.adapters {
            if let Err(err) = adapter.reset().await {
                error!("Failed to reset module {}: {}", kind, err);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::time::SystemTime;
    use tokio::sync::Mutex as AsyncMutex;

    /// Sink that records everything it sees.
    #[derive(Default)]
    pub struct RecordingSink {
        pub chunks: AsyncMutex<Vec<(u64, Chunk)>>,
        pub completions: AsyncMutex<Vec<(u64, RequestStatus)>>,
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn deliver(&self, request: &Request, chunk: Chunk) {
            self.chunks.lock().await.push((request.id, chunk));
        }

        async fn completed(&self, request: &Request, status: RequestStatus) {
            self.completions.lock().await.push((request.id, status));
        }
    }

    /// Adapter that answers with its own tag and tracks a per-chat
    /// conversation id.
    pub struct TagAdapter {
        pub tag: &'static str,
    }

    #[async_trait]
    impl ChatAdapter for TagAdapter {
        fn name(&self) -> &'static str {
            self.tag
        }

        async fn send(
            &self,
            request: &Request,
            state: Option<ConversationState>,
            sink: &ChunkSink<'_>,
        ) -> Result<Option<ConversationState>, BotError> {
            sink.text(format!("{}:{}", self.tag, request.prompt)).await;
            let conversation_id = state
                .and_then(|s| s.conversation_id)
                .unwrap_or_else(|| format!("conv-{}", request.chat_id));
            Ok(Some(ConversationState::new(
                Some(conversation_id),
                Some(format!("msg-{}", request.id)),
            )))
        }
    }

    pub fn make_request(id: u64, chat_id: i64, module: ModuleKind, prompt: &str) -> Request {
        Request {
            id,
            chat_id,
            user_id: 100 + id,
            module,
            prompt: prompt.to_owned(),
            attachment: None,
            reply_message_id: 1,
            style: None,
            enqueued_at: SystemTime::now(),
            generation: 0,
            status: RequestStatus::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::TempDir;

    fn dispatcher_with(
        adapters: Vec<(ModuleKind, Arc<dyn ChatAdapter>)>,
    ) -> (TempDir, ModuleDispatcher) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ConversationStore::new(dir.path()).unwrap());
        (dir, ModuleDispatcher::new(adapters.into_iter().collect(), store))
    }

    #[tokio::test]
    async fn forwards_chunks_and_persists_state() {
        let (_dir, dispatcher) = dispatcher_with(vec![(
            ModuleKind::ChatGpt,
            Arc::new(TagAdapter { tag: "gpt" }) as Arc<dyn ChatAdapter>,
        )]);
        let sink = RecordingSink::default();
        let request = make_request(1, 42, ModuleKind::ChatGpt, "hello");

        let summary = dispatcher.handle(&request, &sink).await.unwrap();
        assert_eq!(summary.text, "gpt:hello");

        let chunks = sink.chunks.lock().await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].1, Chunk::Text("gpt:hello".to_owned()));

        let state = dispatcher
            .conversations
            .load(42, ModuleKind::ChatGpt)
            .unwrap();
        assert_eq!(state.conversation_id.as_deref(), Some("conv-42"));
        assert_eq!(state.parent_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn chats_do_not_share_conversations() {
        let (_dir, dispatcher) = dispatcher_with(vec![(
            ModuleKind::Bard,
            Arc::new(TagAdapter { tag: "bard" }) as Arc<dyn ChatAdapter>,
        )]);
        let sink = RecordingSink::default();

        dispatcher
            .handle(&make_request(1, 10, ModuleKind::Bard, "a"), &sink)
            .await
            .unwrap();
        dispatcher
            .handle(&make_request(2, 20, ModuleKind::Bard, "b"), &sink)
            .await
            .unwrap();

        let first = dispatcher.conversations.load(10, ModuleKind::Bard).unwrap();
        let second = dispatcher.conversations.load(20, ModuleKind::Bard).unwrap();
        assert_eq!(first.conversation_id.as_deref(), Some("conv-10"));
        assert_eq!(second.conversation_id.as_deref(), Some("conv-20"));
    }

    #[tokio::test]
    async fn unknown_module_is_an_error() {
        let (_dir, dispatcher) = dispatcher_with(vec![]);
        let sink = RecordingSink::default();
        let request = make_request(1, 1, ModuleKind::Dalle, "draw");
        assert!(dispatcher.handle(&request, &sink).await.is_err());
        assert!(sink.chunks.lock().await.is_empty());
    }

    #[tokio::test]
    async fn clear_conversation_forgets_state() {
        let (_dir, dispatcher) = dispatcher_with(vec![(
            ModuleKind::ChatGpt,
            Arc::new(TagAdapter { tag: "gpt" }) as Arc<dyn ChatAdapter>,
        )]);
        let sink = RecordingSink::default();
        dispatcher
            .handle(&make_request(1, 5, ModuleKind::ChatGpt, "hi"), &sink)
            .await
            .unwrap();

        dispatcher
            .clear_conversation(5, ModuleKind::ChatGpt)
            .unwrap();
        assert!(dispatcher.conversations.load(5, ModuleKind::ChatGpt).is_none());
    }
}
