use thiserror::Error;

use crate::config::I18nStrings;

/// Error taxonomy for the request path.
///
/// Everything here is recoverable: a failed request is reported to the
/// user and the queue moves on. Only startup errors (unreadable config,
/// missing credentials) abort the process, and those go through
/// `anyhow` before the queue is running.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("request queue is full")]
    QueueFull,

    #[error("user {0} is banned")]
    UserBanned(u64),

    #[error("backend did not respond within {0} s")]
    BackendTimeout(u64),

    #[error("backend HTTP error: {0}")]
    BackendHttp(String),

    #[error("request rejected by content policy: {0}")]
    ContentPolicy(String),

    #[error("no working proxy available")]
    ProxyUnavailable,

    #[error("failed to persist state: {0}")]
    Persistence(#[source] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for BotError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest reports its own client-side timeout as an error;
            // surface it as the backend timeout class.
            BotError::BackendTimeout(0)
        } else {
            BotError::BackendHttp(err.to_string())
        }
    }
}

impl BotError {
    /// The message shown to the requesting user, picked from the
    /// configured i18n strings.
    pub fn user_message(&self, i18n: &I18nStrings) -> String {
        match self {
            BotError::QueueFull => i18n.queue_full_prompt.clone(),
            BotError::UserBanned(_) => i18n.banned_prompt.clone(),
            BotError::ProxyUnavailable => i18n.proxy_unavailable_prompt.clone(),
            other => i18n.error_prompt.replace("{}", &other.to_string()),
        }
    }
}
