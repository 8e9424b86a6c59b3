//! Outgoing side of the Telegram front-end.
//!
//! Response chunks arrive much faster than Telegram allows message
//! edits, so delivery goes through an unbounded channel drained by a
//! single task that batches events with [`throttle_buffer`] and keeps
//! only the latest text per request. The first chunk of a request
//! becomes a reply message; later text chunks edit it in place.
//!
//! [`throttle_buffer`]: crate::utils::StreamExt::throttle_buffer

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as FuturesStreamExt;
use teloxide::payloads::{SendMessageSetters, SendPhotoSetters};
use teloxide::prelude::*;
use teloxide::types::{InputFile, MessageId};
use teloxide::{ApiError, RequestError};
use tokio::sync::mpsc;

use crate::config::SharedConfig;
use crate::dispatch::ResponseSink;
use crate::request::{Chunk, Request, RequestStatus};
use crate::utils::StreamExt;

enum SinkEvent {
    Chunk {
        request_id: u64,
        chat_id: ChatId,
        reply_to: MessageId,
        chunk: Chunk,
    },
    Completed {
        request_id: u64,
    },
}

pub(crate) struct TelegramSink {
    events: mpsc::UnboundedSender<SinkEvent>,
}

impl TelegramSink {
    /// Starts the delivery task and returns the sink feeding it.
    pub(crate) fn spawn(bot: Bot, config: SharedConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let interval = Duration::from_millis(config.telegram.edit_interval_ms);
        tokio::spawn(deliver_loop(bot, rx, interval));
        Arc::new(Self { events: tx })
    }

    fn push(&self, event: SinkEvent) {
        if self.events.send(event).is_err() {
            warn!("Telegram delivery task is gone, dropping a response event");
        }
    }
}

#[async_trait]
impl ResponseSink for TelegramSink {
    async fn deliver(&self, request: &Request, chunk: Chunk) {
        self.push(SinkEvent::Chunk {
            request_id: request.id,
            chat_id: ChatId(request.chat_id),
            reply_to: MessageId(request.reply_message_id),
            chunk,
        });
    }

    async fn completed(&self, request: &Request, _status: RequestStatus) {
        self.push(SinkEvent::Completed {
            request_id: request.id,
        });
    }
}

async fn deliver_loop(bot: Bot, rx: mpsc::UnboundedReceiver<SinkEvent>, interval: Duration) {
    // Message already sent for each in-flight request; later text
    // chunks edit it instead of sending a new one.
    let mut sent: HashMap<u64, MessageId> = HashMap::new();

    let events = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    });
    let batches = events.throttle_buffer::<Vec<_>>(interval);
    tokio::pin!(batches);

    while let Some(batch) = batches.next().await {
        for event in coalesce(batch) {
            handle_event(&bot, &mut sent, event).await;
        }
    }
}

/// Within one batch, only the last text chunk of each request matters:
/// texts are cumulative and would each trigger a message edit.
fn coalesce(batch: Vec<SinkEvent>) -> Vec<SinkEvent> {
    let mut last_text: HashMap<u64, usize> = HashMap::new();
    for (index, event) in batch.iter().enumerate() {
        if let SinkEvent::Chunk {
            request_id,
            chunk: Chunk::Text(_) | Chunk::Error(_),
            ..
        } = event
        {
            last_text.insert(*request_id, index);
        }
    }

    batch
        .into_iter()
        .enumerate()
        .filter(|(index, event)| match event {
            SinkEvent::Chunk {
                request_id,
                chunk: Chunk::Text(_) | Chunk::Error(_),
                ..
            } => last_text[request_id] == *index,
            _ => true,
        })
        .map(|(_, event)| event)
        .collect()
}

async fn handle_event(bot: &Bot, sent: &mut HashMap<u64, MessageId>, event: SinkEvent) {
    match event {
        SinkEvent::Chunk {
            request_id,
            chat_id,
            reply_to,
            chunk,
        } => match chunk {
            Chunk::Text(body) | Chunk::Error(body) => {
                let result = match sent.get(&request_id) {
                    Some(message_id) => bot
                        .edit_message_text(chat_id, *message_id, body)
                        .await
                        .map(|_| None),
                    None => bot
                        .send_message(chat_id, body)
                        .reply_to_message_id(reply_to)
                        .await
                        .map(|message| Some(message.id)),
                };
                match result {
                    Ok(Some(message_id)) => {
                        sent.insert(request_id, message_id);
                    }
                    Ok(None) => {}
                    // An edit with unchanged text is not an error
                    // worth reporting.
                    Err(RequestError::Api(ApiError::MessageNotModified)) => {}
                    Err(err) => warn!("Failed to deliver a response chunk: {}", err),
                }
            }
            Chunk::Image(bytes) => {
                if let Err(err) = bot
                    .send_photo(chat_id, InputFile::memory(bytes))
                    .reply_to_message_id(reply_to)
                    .await
                {
                    warn!("Failed to send a generated image: {}", err);
                }
            }
        },
        SinkEvent::Completed { request_id } => {
            sent.remove(&request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_event(request_id: u64, body: &str) -> SinkEvent {
        SinkEvent::Chunk {
            request_id,
            chat_id: ChatId(1),
            reply_to: MessageId(1),
            chunk: Chunk::Text(body.to_owned()),
        }
    }

    #[test]
    fn coalesce_keeps_only_the_latest_text_per_request() {
        let batch = vec![
            text_event(1, "a"),
            text_event(2, "x"),
            text_event(1, "ab"),
            text_event(1, "abc"),
            text_event(2, "xy"),
        ];

        let kept = coalesce(batch);
        let texts: Vec<(u64, &str)> = kept
            .iter()
            .filter_map(|event| match event {
                SinkEvent::Chunk {
                    request_id,
                    chunk: Chunk::Text(body),
                    ..
                } => Some((*request_id, body.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec![(1, "abc"), (2, "xy")]);
    }

    #[test]
    fn coalesce_never_drops_images_or_completions() {
        let batch = vec![
            SinkEvent::Chunk {
                request_id: 1,
                chat_id: ChatId(1),
                reply_to: MessageId(1),
                chunk: Chunk::Image(vec![1, 2, 3]),
            },
            SinkEvent::Chunk {
                request_id: 1,
                chat_id: ChatId(1),
                reply_to: MessageId(1),
                chunk: Chunk::Image(vec![4, 5, 6]),
            },
            SinkEvent::Completed { request_id: 1 },
        ];

        let kept = coalesce(batch);
        assert_eq!(kept.len(), 3);
        assert!(matches!(kept[2], SinkEvent::Completed { request_id: 1 }));
    }
}
