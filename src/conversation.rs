//! Per-chat conversation state, one JSON file per chat.
//!
//! Only the queue worker ever mutates these files, so no locking is
//! needed beyond write-to-temp-then-rename, which keeps a crash from
//! leaving a truncated record behind. Reads may happen concurrently
//! from command handlers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Error;
use serde::{Deserialize, Serialize};

use crate::error::BotError;
use crate::request::ModuleKind;

/// Conversation continuity identifiers for one (chat, module) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Unix timestamp (seconds) of the last completed exchange.
    #[serde(default)]
    pub last_updated: u64,
}

impl ConversationState {
    pub fn new(conversation_id: Option<String>, parent_id: Option<String>) -> Self {
        Self {
            conversation_id,
            parent_id,
            last_updated: unix_now(),
        }
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct ConversationStore {
    dir: PathBuf,
}

impl ConversationStore {
    pub fn new<P>(dir: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_owned(),
        })
    }

    /// Loads the stored state for `(chat_id, module)`. Unreadable or
    /// corrupt records degrade to "no prior conversation".
    pub fn load(&self, chat_id: i64, module: ModuleKind) -> Option<ConversationState> {
        self.read_chat(chat_id).remove(module.as_str())
    }

    pub fn save(
        &self,
        chat_id: i64,
        module: ModuleKind,
        state: ConversationState,
    ) -> Result<(), BotError> {
        let mut records = self.read_chat(chat_id);
        records.insert(module.as_str().to_owned(), state);
        self.write_chat(chat_id, &records)
    }

    /// Forgets the conversation for `(chat_id, module)`. Clearing a
    /// chat that has no record is a no-op.
    pub fn clear(&self, chat_id: i64, module: ModuleKind) -> Result<(), BotError> {
        let mut records = self.read_chat(chat_id);
        if records.remove(module.as_str()).is_none() {
            return Ok(());
        }
        if records.is_empty() {
            fs::remove_file(self.chat_path(chat_id)).map_err(BotError::Persistence)?;
            return Ok(());
        }
        self.write_chat(chat_id, &records)
    }

    fn chat_path(&self, chat_id: i64) -> PathBuf {
        self.dir.join(format!("chat_{}.json", chat_id))
    }

    fn read_chat(&self, chat_id: i64) -> HashMap<String, ConversationState> {
        let path = self.chat_path(chat_id);
        if !path.exists() {
            return HashMap::new();
        }
        match fs::read_to_string(&path)
            .map_err(Error::from)
            .and_then(|raw| Ok(serde_json::from_str(&raw)?))
        {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    "Failed to read conversation file {}: {}",
                    path.display(),
                    err
                );
                HashMap::new()
            }
        }
    }

    fn write_chat(
        &self,
        chat_id: i64,
        records: &HashMap<String, ConversationState>,
    ) -> Result<(), BotError> {
        let path = self.chat_path(chat_id);
        let tmp_path = path.with_extension("json.tmp");
        let serialized =
            serde_json::to_vec_pretty(records).map_err(|err| BotError::Other(err.into()))?;
        fs::write(&tmp_path, serialized).map_err(BotError::Persistence)?;
        fs::rename(&tmp_path, &path).map_err(BotError::Persistence)?;
        Ok(())
    }
}
