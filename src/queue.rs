//! The bounded FIFO request queue and its single draining worker.
//!
//! Requests enter from any number of concurrent Telegram handlers and
//! leave strictly in arrival order through exactly one worker, which
//! keeps conversation turns ordered per chat and bounds the load on
//! the rate-limited backends. One bad request never stops the loop.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use tokio::sync::Notify;

use crate::collector::DataCollector;
use crate::config::SharedConfig;
use crate::dispatch::{ModuleDispatcher, ResponseSink};
use crate::error::BotError;
use crate::request::{Chunk, ModuleKind, Request, RequestStatus};
use crate::users::UserStore;

/// What a handler submits; the queue assigns id, timestamps and
/// generation.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub chat_id: i64,
    pub user_id: u64,
    pub module: ModuleKind,
    pub prompt: String,
    pub attachment: Option<Vec<u8>>,
    pub reply_message_id: i32,
    pub style: Option<String>,
}

/// Pending-queue line item for the admin `/queue` command.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: u64,
    pub user_id: u64,
    pub module: ModuleKind,
}

pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    max_size: usize,
    users: Arc<UserStore>,
}

struct QueueInner {
    pending: VecDeque<Request>,
    next_id: u64,
    generation: u64,
}

impl RequestQueue {
    pub fn new(max_size: usize, users: Arc<UserStore>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                next_id: 1,
                generation: 0,
            }),
            notify: Notify::new(),
            max_size,
            users,
        }
    }

    /// Adds a request to the tail of the queue and returns its
    /// 1-based position. Fails with [`BotError::UserBanned`] before
    /// touching the queue, and with [`BotError::QueueFull`] once the
    /// configured maximum is reached.
    pub fn enqueue(&self, new_request: NewRequest) -> Result<usize, BotError> {
        if self.users.is_banned(new_request.user_id) {
            return Err(BotError::UserBanned(new_request.user_id));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.pending.len() >= self.max_size {
            return Err(BotError::QueueFull);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let generation = inner.generation;
        inner.pending.push_back(Request {
            id,
            chat_id: new_request.chat_id,
            user_id: new_request.user_id,
            module: new_request.module,
            prompt: new_request.prompt,
            attachment: new_request.attachment,
            reply_message_id: new_request.reply_message_id,
            style: new_request.style,
            enqueued_at: SystemTime::now(),
            generation,
            status: RequestStatus::Pending,
        });
        let position = inner.pending.len();
        drop(inner);

        self.notify.notify_one();
        Ok(position)
    }

    /// Takes the oldest pending request, waiting until one arrives.
    pub async fn dequeue(&self) -> Request {
        loop {
            // Register interest before the emptiness check so a
            // concurrent enqueue cannot slip between them unnoticed.
            let notified = self.notify.notified();
            if let Some(request) = self.inner.lock().unwrap().pending.pop_front() {
                return request;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }

    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.inner
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|r| QueueEntry {
                id: r.id,
                user_id: r.user_id,
                module: r.module,
            })
            .collect()
    }

    /// Discards every pending request and bumps the generation so the
    /// output of the in-flight request (if any) is abandoned. Returns
    /// the number of discarded requests.
    pub fn purge(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let discarded = inner.pending.len();
        inner.pending.clear();
        inner.generation += 1;
        discarded
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().unwrap().generation
    }
}

/// Sink wrapper that drops output of requests enqueued before the
/// last purge. The user asked for a restart; stale responses would
/// only confuse the chat.
struct GenerationSink<'a> {
    inner: &'a dyn ResponseSink,
    queue: &'a RequestQueue,
    generation: u64,
}

impl GenerationSink<'_> {
    fn is_current(&self) -> bool {
        self.queue.generation() == self.generation
    }
}

#[async_trait]
impl ResponseSink for GenerationSink<'_> {
    async fn deliver(&self, request: &Request, chunk: Chunk) {
        if self.is_current() {
            self.inner.deliver(request, chunk).await;
        }
    }

    async fn completed(&self, request: &Request, status: RequestStatus) {
        if self.is_current() {
            self.inner.completed(request, status).await;
        }
    }
}

pub struct QueueWorker<S> {
    queue: Arc<RequestQueue>,
    dispatcher: Arc<ModuleDispatcher>,
    sink: Arc<S>,
    users: Arc<UserStore>,
    collector: Arc<DataCollector>,
    config: SharedConfig,
    shutdown: Arc<Notify>,
}

impl<S> QueueWorker<S>
where
    S: ResponseSink + 'static,
{
    pub fn new(
        queue: Arc<RequestQueue>,
        dispatcher: Arc<ModuleDispatcher>,
        sink: Arc<S>,
        users: Arc<UserStore>,
        collector: Arc<DataCollector>,
        config: SharedConfig,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            sink,
            users,
            collector,
            config,
            shutdown,
        }
    }

    pub async fn run(self) {
        info!("Queue worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => break,
                mut request = self.queue.dequeue() => {
                    self.process(&mut request).await;
                }
            }
        }
        info!("Queue worker finished");
    }

    async fn process(&self, request: &mut Request) {
        request.status = RequestStatus::InProgress;
        let user_name = self
            .users
            .get(request.user_id)
            .map(|r| r.user_name)
            .unwrap_or_default();
        info!(
            "Processing request {} from user {} ({}) with module {}",
            request.id, user_name, request.user_id, request.module
        );
        self.collector.log_request(request, &user_name);

        let timeout_seconds = self.config.timeout_for(request.module);
        let sink = GenerationSink {
            inner: self.sink.as_ref(),
            queue: &self.queue,
            generation: request.generation,
        };

        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_seconds),
            AssertUnwindSafe(self.dispatcher.handle(request, &sink)).catch_unwind(),
        )
        .await;

        match outcome {
            Ok(Ok(Ok(summary))) => {
                request.status = RequestStatus::Done;
                if let Err(err) = self.users.count_request(request.user_id) {
                    error!("Failed to update request counter: {}", err);
                }
                self.collector.log_response(request, &user_name, &summary);
                sink.completed(request, RequestStatus::Done).await;
            }
            Ok(Ok(Err(err))) => {
                self.fail(request, &sink, err).await;
            }
            // A panicking adapter fails its request like any other
            // error; it must not take the worker down with it.
            Ok(Err(_panic)) => {
                self.fail(
                    request,
                    &sink,
                    BotError::Other(anyhow!("module {} panicked", request.module)),
                )
                .await;
            }
            Err(_elapsed) => {
                self.fail(request, &sink, BotError::BackendTimeout(timeout_seconds))
                    .await;
            }
        }
    }

    /// Marks the request failed and reports it to the user with a
    /// single terminal error chunk. The worker itself carries on.
    async fn fail(&self, request: &mut Request, sink: &GenerationSink<'_>, err: BotError) {
        request.status = RequestStatus::Failed;
        warn!(
            "Request {} from user {} failed: {}",
            request.id, request.user_id, err
        );
        let message = err.user_message(&self.config.i18n);
        sink.deliver(request, Chunk::Error(message)).await;
        sink.completed(request, RequestStatus::Failed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationState, ConversationStore};
    use crate::dispatch::testing::{RecordingSink, TagAdapter};
    use crate::dispatch::{ChatAdapter, ChunkSink};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn test_config(overrides: serde_json::Value) -> SharedConfig {
        let mut base = serde_json::json!({ "telegram": { "bot_token": "123:abc" } });
        if let (Some(base_map), Some(extra)) = (base.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base_map.insert(k.clone(), v.clone());
            }
        }
        SharedConfig::new(serde_json::from_value(base).unwrap())
    }

    struct TestEnv {
        _dirs: (TempDir, TempDir),
        queue: Arc<RequestQueue>,
        users: Arc<UserStore>,
        dispatcher: Arc<ModuleDispatcher>,
        sink: Arc<RecordingSink>,
        config: SharedConfig,
    }

    fn env_with(
        max_size: usize,
        adapters: Vec<(ModuleKind, Arc<dyn ChatAdapter>)>,
        config: SharedConfig,
    ) -> TestEnv {
        let conv_dir = TempDir::new().unwrap();
        let users_dir = TempDir::new().unwrap();
        let users = Arc::new(
            UserStore::new(users_dir.path().join("users.json"), Default::default(), false)
                .unwrap(),
        );
        let conversations = Arc::new(ConversationStore::new(conv_dir.path()).unwrap());
        let dispatcher = Arc::new(ModuleDispatcher::new(
            adapters.into_iter().collect(),
            conversations,
        ));
        TestEnv {
            _dirs: (conv_dir, users_dir),
            queue: Arc::new(RequestQueue::new(max_size, Arc::clone(&users))),
            users,
            dispatcher,
            sink: Arc::new(RecordingSink::default()),
            config,
        }
    }

    fn new_request(user_id: u64, module: ModuleKind, prompt: &str) -> NewRequest {
        NewRequest {
            chat_id: user_id as i64,
            user_id,
            module,
            prompt: prompt.to_owned(),
            attachment: None,
            reply_message_id: 1,
            style: None,
        }
    }

    fn spawn_worker(env: &TestEnv) -> Arc<Notify> {
        let shutdown = Arc::new(Notify::new());
        let worker = QueueWorker::new(
            Arc::clone(&env.queue),
            Arc::clone(&env.dispatcher),
            Arc::clone(&env.sink),
            Arc::clone(&env.users),
            Arc::new(DataCollector::disabled()),
            env.config.clone(),
            Arc::clone(&shutdown),
        );
        tokio::spawn(worker.run());
        shutdown
    }

    async fn wait_for_completions(sink: &RecordingSink, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if sink.completions.lock().await.len() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("worker did not complete the expected requests in time");
    }

    #[tokio::test]
    async fn rejects_when_full_and_never_overflows() {
        let env = env_with(2, vec![], test_config(serde_json::json!({})));

        assert_eq!(env.queue.enqueue(new_request(1, ModuleKind::ChatGpt, "a")).unwrap(), 1);
        assert_eq!(env.queue.enqueue(new_request(2, ModuleKind::ChatGpt, "b")).unwrap(), 2);
        for _ in 0..5 {
            let err = env
                .queue
                .enqueue(new_request(3, ModuleKind::ChatGpt, "c"))
                .unwrap_err();
            assert!(matches!(err, BotError::QueueFull));
            assert_eq!(env.queue.len(), 2);
        }
    }

    #[tokio::test]
    async fn banned_user_never_enters_the_queue() {
        let env = env_with(5, vec![], test_config(serde_json::json!({})));
        env.users.get_or_create(9, "troll").unwrap();
        env.users.ban(9, None).unwrap();

        let err = env
            .queue
            .enqueue(new_request(9, ModuleKind::ChatGpt, "hi"))
            .unwrap_err();
        assert!(matches!(err, BotError::UserBanned(9)));
        assert_eq!(env.queue.len(), 0);
    }

    #[tokio::test]
    async fn requests_are_processed_in_fifo_order() {
        let adapters: Vec<(ModuleKind, Arc<dyn ChatAdapter>)> = vec![
            (ModuleKind::ChatGpt, Arc::new(TagAdapter { tag: "gpt" })),
            (ModuleKind::Bard, Arc::new(TagAdapter { tag: "bard" })),
        ];
        let env = env_with(10, adapters, test_config(serde_json::json!({})));

        for (i, module) in [
            ModuleKind::ChatGpt,
            ModuleKind::Bard,
            ModuleKind::ChatGpt,
            ModuleKind::Bard,
        ]
        .iter()
        .enumerate()
        {
            env.queue
                .enqueue(new_request(i as u64 + 1, *module, &format!("p{}", i)))
                .unwrap();
        }

        let shutdown = spawn_worker(&env);
        wait_for_completions(&env.sink, 4).await;
        shutdown.notify_one();

        let chunks = env.sink.chunks.lock().await;
        let texts: Vec<&str> = chunks
            .iter()
            .filter_map(|(_, c)| match c {
                Chunk::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["gpt:p0", "bard:p1", "gpt:p2", "bard:p3"]);

        let completions = env.sink.completions.lock().await;
        let ids: Vec<u64> = completions.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(completions.iter().all(|(_, s)| *s == RequestStatus::Done));
    }

    /// Adapter that never answers; used to exercise the timeout path.
    struct StuckAdapter;

    #[async_trait]
    impl ChatAdapter for StuckAdapter {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn send(
            &self,
            _request: &Request,
            _state: Option<ConversationState>,
            _sink: &ChunkSink<'_>,
        ) -> Result<Option<ConversationState>, BotError> {
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    #[tokio::test]
    async fn timeout_fails_the_request_and_the_worker_moves_on() {
        let adapters: Vec<(ModuleKind, Arc<dyn ChatAdapter>)> = vec![
            (ModuleKind::ChatGpt, Arc::new(StuckAdapter)),
            (ModuleKind::Bard, Arc::new(TagAdapter { tag: "bard" })),
        ];
        let config = test_config(serde_json::json!({
            "chatgpt": { "timeout_seconds": 1 }
        }));
        let env = env_with(10, adapters, config);

        env.queue
            .enqueue(new_request(42, ModuleKind::ChatGpt, "X"))
            .unwrap();
        env.queue
            .enqueue(new_request(43, ModuleKind::Bard, "Y"))
            .unwrap();

        let shutdown = spawn_worker(&env);
        wait_for_completions(&env.sink, 2).await;
        shutdown.notify_one();

        let completions = env.sink.completions.lock().await;
        assert_eq!(completions[0], (1, RequestStatus::Failed));
        assert_eq!(completions[1], (2, RequestStatus::Done));

        let chunks = env.sink.chunks.lock().await;
        // Exactly one terminal error chunk for the stuck request.
        let errors: Vec<&(u64, Chunk)> = chunks
            .iter()
            .filter(|(id, c)| *id == 1 && matches!(c, Chunk::Error(_)))
            .collect();
        assert_eq!(errors.len(), 1);
        // The follow-up request still produced its answer.
        assert!(chunks
            .iter()
            .any(|(id, c)| *id == 2 && *c == Chunk::Text("bard:Y".to_owned())));
    }

    /// Adapter that panics mid-request.
    struct ExplodingAdapter;

    #[async_trait]
    impl ChatAdapter for ExplodingAdapter {
        fn name(&self) -> &'static str {
            "exploding"
        }

        async fn send(
            &self,
            _request: &Request,
            _state: Option<ConversationState>,
            _sink: &ChunkSink<'_>,
        ) -> Result<Option<ConversationState>, BotError> {
            panic!("adapter blew up")
        }
    }

    #[tokio::test]
    async fn a_panicking_adapter_does_not_stop_the_worker() {
        let adapters: Vec<(ModuleKind, Arc<dyn ChatAdapter>)> = vec![
            (ModuleKind::ChatGpt, Arc::new(ExplodingAdapter)),
            (ModuleKind::Bard, Arc::new(TagAdapter { tag: "bard" })),
        ];
        let env = env_with(10, adapters, test_config(serde_json::json!({})));

        env.queue
            .enqueue(new_request(42, ModuleKind::ChatGpt, "boom"))
            .unwrap();
        env.queue
            .enqueue(new_request(43, ModuleKind::Bard, "Y"))
            .unwrap();

        let shutdown = spawn_worker(&env);
        wait_for_completions(&env.sink, 2).await;
        shutdown.notify_one();

        let completions = env.sink.completions.lock().await;
        assert_eq!(completions[0], (1, RequestStatus::Failed));
        assert_eq!(completions[1], (2, RequestStatus::Done));

        let chunks = env.sink.chunks.lock().await;
        assert!(chunks
            .iter()
            .any(|(id, c)| *id == 1 && matches!(c, Chunk::Error(_))));
        assert!(chunks
            .iter()
            .any(|(id, c)| *id == 2 && *c == Chunk::Text("bard:Y".to_owned())));
    }

    #[tokio::test]
    async fn attachments_ride_along_with_their_request() {
        let env = env_with(5, vec![], test_config(serde_json::json!({})));

        let mut submission = new_request(1, ModuleKind::EdgeGpt, "what is this");
        submission.attachment = Some(vec![0xFF, 0xD8, 0xFF]);
        env.queue.enqueue(submission).unwrap();

        let queued = env.queue.dequeue().await;
        assert_eq!(queued.attachment.as_deref(), Some(&[0xFF, 0xD8, 0xFF][..]));
    }

    #[tokio::test]
    async fn purge_discards_pending_and_abandons_stale_output() {
        let env = env_with(10, vec![], test_config(serde_json::json!({})));
        env.queue.enqueue(new_request(1, ModuleKind::ChatGpt, "a")).unwrap();
        env.queue.enqueue(new_request(2, ModuleKind::ChatGpt, "b")).unwrap();

        let generation_before = env.queue.generation();
        assert_eq!(env.queue.purge(), 2);
        assert_eq!(env.queue.len(), 0);
        assert_eq!(env.queue.generation(), generation_before + 1);

        // A sink guarding the old generation drops everything.
        let request = crate::dispatch::testing::make_request(1, 1, ModuleKind::ChatGpt, "a");
        let recording = RecordingSink::default();
        let stale = GenerationSink {
            inner: &recording,
            queue: &env.queue,
            generation: generation_before,
        };
        stale
            .deliver(&request, Chunk::Text("late".to_owned()))
            .await;
        stale.completed(&request, RequestStatus::Done).await;
        assert!(recording.chunks.lock().await.is_empty());
        assert!(recording.completions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_enqueues_respect_the_limit() {
        let env = env_with(8, vec![], test_config(serde_json::json!({})));
        let queue = Arc::clone(&env.queue);

        let mut handles = Vec::new();
        for i in 0..32u64 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                queue.enqueue(new_request(i, ModuleKind::ChatGpt, "x")).is_ok()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 8);
        assert_eq!(env.queue.len(), 8);
    }

    #[allow(dead_code)]
    fn assert_traits() {
        fn is_send_sync<T: Send + Sync>() {}
        is_send_sync::<RequestQueue>();
        let _ = HashMap::<ModuleKind, Arc<dyn ChatAdapter>>::new();
    }
}
