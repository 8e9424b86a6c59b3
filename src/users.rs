//! The JSON-file backed user registry.
//!
//! A single file holds every [`UserRecord`]; it is loaded once at
//! startup and rewritten atomically after each mutation. Ban state is
//! consulted before a request is allowed into the queue.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use crate::error::BotError;
use crate::request::ModuleKind;

const DEFAULT_USER_NAME: &str = "-";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: u64,
    #[serde(default = "default_user_name")]
    pub user_name: String,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub banned: bool,
    #[serde(default)]
    pub ban_reason: Option<String>,
    /// Default backend for plain (non-command) messages.
    #[serde(default)]
    pub module: ModuleKind,
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Response style for backends that support it.
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub requests_total: u64,
}

fn default_user_name() -> String {
    DEFAULT_USER_NAME.to_owned()
}

fn default_lang() -> String {
    "eng".to_owned()
}

pub struct UserStore {
    path: PathBuf,
    admin_ids: std::collections::HashSet<u64>,
    ban_by_default: bool,
    users: Mutex<HashMap<u64, UserRecord>>,
}

impl UserStore {
    pub fn new<P>(
        path: P,
        admin_ids: std::collections::HashSet<u64>,
        ban_by_default: bool,
    ) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref().to_owned();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut users = HashMap::new();
        if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read users database {}", path.display()))?;
            let records: Vec<UserRecord> = serde_json::from_str(&raw)
                .with_context(|| format!("Users database {} is not valid JSON", path.display()))?;
            for record in records {
                users.insert(record.user_id, record);
            }
            info!("Loaded {} users from {}", users.len(), path.display());
        }

        Ok(Self {
            path,
            admin_ids,
            ban_by_default,
            users: Mutex::new(users),
        })
    }

    pub fn get(&self, user_id: u64) -> Option<UserRecord> {
        self.users.lock().unwrap().get(&user_id).cloned()
    }

    /// Finds the record for `user_id`, creating it with the default
    /// policy (admin/ban flags from config) when the user is new.
    pub fn get_or_create(&self, user_id: u64, user_name: &str) -> Result<UserRecord, BotError> {
        let mut users = self.users.lock().unwrap();
        if let Some(record) = users.get_mut(&user_id) {
            if !user_name.is_empty() && record.user_name != user_name {
                record.user_name = user_name.to_owned();
                let record = record.clone();
                self.persist(&users)?;
                return Ok(record);
            }
            return Ok(record.clone());
        }

        let admin = self.admin_ids.contains(&user_id);
        let record = UserRecord {
            user_id,
            user_name: if user_name.is_empty() {
                DEFAULT_USER_NAME.to_owned()
            } else {
                user_name.to_owned()
            },
            admin,
            banned: !admin && self.ban_by_default,
            ban_reason: None,
            module: ModuleKind::default(),
            lang: default_lang(),
            style: None,
            requests_total: 0,
        };
        info!("Creating a new user {}", user_id);
        users.insert(user_id, record.clone());
        self.persist(&users)?;
        Ok(record)
    }

    /// Ban check used by the queue. Unknown users fall back to the
    /// `ban_by_default` policy without creating a record.
    pub fn is_banned(&self, user_id: u64) -> bool {
        let users = self.users.lock().unwrap();
        match users.get(&user_id) {
            Some(record) => record.banned,
            None => !self.admin_ids.contains(&user_id) && self.ban_by_default,
        }
    }

    pub fn is_admin(&self, user_id: u64) -> bool {
        if self.admin_ids.contains(&user_id) {
            return true;
        }
        self.users
            .lock()
            .unwrap()
            .get(&user_id)
            .map(|r| r.admin)
            .unwrap_or(false)
    }

    pub fn ban(&self, user_id: u64, reason: Option<String>) -> Result<(), BotError> {
        self.update(user_id, |record| {
            record.banned = true;
            record.ban_reason = reason;
        })
    }

    pub fn unban(&self, user_id: u64) -> Result<(), BotError> {
        self.update(user_id, |record| {
            record.banned = false;
            record.ban_reason = None;
        })
    }

    pub fn set_module(&self, user_id: u64, module: ModuleKind) -> Result<(), BotError> {
        self.update(user_id, |record| record.module = module)
    }

    pub fn set_lang(&self, user_id: u64, lang: String) -> Result<(), BotError> {
        self.update(user_id, |record| record.lang = lang)
    }

    pub fn set_style(&self, user_id: u64, style: Option<String>) -> Result<(), BotError> {
        self.update(user_id, |record| record.style = style)
    }

    pub fn count_request(&self, user_id: u64) -> Result<(), BotError> {
        self.update(user_id, |record| record.requests_total += 1)
    }

    /// All records, ordered by user id (for the `/users` command).
    pub fn all(&self) -> Vec<UserRecord> {
        let users = self.users.lock().unwrap();
        let mut records: Vec<UserRecord> = users.values().cloned().collect();
        records.sort_by_key(|r| r.user_id);
        records
    }

    fn update<F>(&self, user_id: u64, f: F) -> Result<(), BotError>
    where
        F: FnOnce(&mut UserRecord),
    {
        let mut users = self.users.lock().unwrap();
        let record = users.entry(user_id).or_insert_with(|| UserRecord {
            user_id,
            user_name: DEFAULT_USER_NAME.to_owned(),
            admin: self.admin_ids.contains(&user_id),
            banned: false,
            ban_reason: None,
            module: ModuleKind::default(),
            lang: default_lang(),
            style: None,
            requests_total: 0,
        });
        f(record);
        self.persist(&users)
    }

    fn persist(&self, users: &HashMap<u64, UserRecord>) -> Result<(), BotError> {
        let mut records: Vec<&UserRecord> = users.values().collect();
        records.sort_by_key(|r| r.user_id);
        let serialized =
            serde_json::to_vec_pretty(&records).map_err(|err| BotError::Other(err.into()))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized).map_err(BotError::Persistence)?;
        fs::rename(&tmp_path, &self.path).map_err(BotError::Persistence)?;
        Ok(())
    }
}
