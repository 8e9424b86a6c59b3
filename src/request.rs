use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// The backend a request is routed to.
///
/// Adding a backend means adding one variant here plus one adapter in
/// the [`crate::modules`] tree; everything else (queue, dispatcher,
/// conversation store) is generic over this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    #[serde(rename = "chatgpt")]
    ChatGpt,
    #[serde(rename = "dalle")]
    Dalle,
    #[serde(rename = "edgegpt")]
    EdgeGpt,
    #[serde(rename = "bard")]
    Bard,
    #[serde(rename = "bing_imagegen")]
    BingImageGen,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 5] = [
        ModuleKind::ChatGpt,
        ModuleKind::Dalle,
        ModuleKind::EdgeGpt,
        ModuleKind::Bard,
        ModuleKind::BingImageGen,
    ];

    /// Stable name used in config sections, conversation files and
    /// bot commands.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::ChatGpt => "chatgpt",
            ModuleKind::Dalle => "dalle",
            ModuleKind::EdgeGpt => "edgegpt",
            ModuleKind::Bard => "bard",
            ModuleKind::BingImageGen => "bing_imagegen",
        }
    }
}

impl Default for ModuleKind {
    fn default() -> Self {
        ModuleKind::ChatGpt
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chatgpt" | "gpt" => Ok(ModuleKind::ChatGpt),
            "dalle" | "dall-e" => Ok(ModuleKind::Dalle),
            "edgegpt" | "bing" => Ok(ModuleKind::EdgeGpt),
            "bard" => Ok(ModuleKind::Bard),
            "bing_imagegen" | "bingimage" => Ok(ModuleKind::BingImageGen),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Pending => "pending",
            RequestStatus::InProgress => "in progress",
            RequestStatus::Done => "done",
            RequestStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One queued prompt. Immutable once enqueued, except for `status`
/// which is owned by the queue worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub chat_id: i64,
    pub user_id: u64,
    pub module: ModuleKind,
    pub prompt: String,
    pub attachment: Option<Vec<u8>>,
    /// Message to reply to when the first response chunk is sent.
    pub reply_message_id: i32,
    /// Response style passthrough for backends that support it
    /// (EdgeGPT conversation styles).
    pub style: Option<String>,
    pub enqueued_at: SystemTime,
    /// Queue generation at enqueue time. Output of requests from an
    /// older generation is discarded after a restart.
    pub generation: u64,
    pub status: RequestStatus,
}

/// One incremental unit of a streamed response.
///
/// `Text` carries the whole response accumulated so far, not a delta,
/// so the front-end can always replace the message body with it.
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    Image(Vec<u8>),
    /// Terminal error chunk. Nothing follows it.
    Error(String),
}
