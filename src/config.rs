//! Configuration-related types.
//!
//! The configuration is deserialized from a JSON settings file, for
//! example:
//!
//! ```json
//! {
//!   "telegram": {
//!     "bot_token": "8888888888:XXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXXX",
//!     "admin_ids": [123456789]
//!   },
//!   "queue": { "max_size": 10 },
//!   "chatgpt": { "api_key": "sk-xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx" },
//!   "edgegpt": { "enabled": true, "endpoint": "http://127.0.0.1:8090/bing", "proxy": "auto" },
//!   "files": { "conversations_dir": "./data/conversations" }
//! }
//! ```
//!
//! Every section except `telegram` is optional and falls back to the
//! defaults below. See [`Config`] for detailed descriptions.

use std::collections::HashSet;
use std::ops::Deref;
use std::sync::Arc;

use paste::paste;
use serde::Deserialize;

use crate::request::ModuleKind;

/// A thread-safe reference-counting object that represents
/// a [`Config`] instance.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    config: Arc<Config>,
}

impl SharedConfig {
    /// Constructs a new `SharedConfig`.
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl Deref for SharedConfig {
    type Target = Config;

    fn deref(&self) -> &Self::Target {
        self.config.as_ref()
    }
}

/// Top-level config type for the bot.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub chatgpt: ChatGptConfig,
    #[serde(default)]
    pub dalle: DalleConfig,
    /// EdgeGPT (Bing chat) gateway settings.
    #[serde(default)]
    pub edgegpt: GatewayConfig,
    /// Bard gateway settings.
    #[serde(default)]
    pub bard: GatewayConfig,
    /// Bing Image Creator gateway settings.
    #[serde(default)]
    pub bing_imagegen: GatewayConfig,
    #[serde(default)]
    pub proxy_automation: ProxyAutomationConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub data_collecting: DataCollectingConfig,
    #[serde(default)]
    pub i18n: I18nStrings,
}

impl Config {
    /// Per-request timeout for the given backend, in seconds.
    pub fn timeout_for(&self, module: ModuleKind) -> u64 {
        match module {
            ModuleKind::ChatGpt => self.chatgpt.timeout_seconds,
            ModuleKind::Dalle => self.dalle.timeout_seconds,
            ModuleKind::EdgeGpt => self.edgegpt.timeout_seconds,
            ModuleKind::Bard => self.bard.timeout_seconds,
            ModuleKind::BingImageGen => self.bing_imagegen.timeout_seconds,
        }
    }

    pub fn is_module_enabled(&self, module: ModuleKind) -> bool {
        match module {
            ModuleKind::ChatGpt => self.chatgpt.enabled,
            ModuleKind::Dalle => self.dalle.enabled,
            ModuleKind::EdgeGpt => self.edgegpt.enabled,
            ModuleKind::Bard => self.bard.enabled,
            ModuleKind::BingImageGen => self.bing_imagegen.enabled,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// The token of your Telegram bot.
    pub bot_token: String,
    /// User ids that may use admin commands. Admin users are never
    /// banned by default.
    #[serde(default)]
    pub admin_ids: HashSet<u64>,
    /// When `true`, newly seen users start banned and have to be
    /// unbanned explicitly.
    #[serde(default)]
    pub ban_by_default: bool,
    /// The throttle interval (in milliseconds) for editing streamed
    /// response messages.
    #[serde(default = "default_edit_interval_ms")]
    pub edit_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of pending requests. Submissions beyond this are
    /// rejected with a user-visible notice, never dropped silently.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Reply with the queue position after a successful enqueue.
    #[serde(default = "default_notify_position")]
    pub notify_position: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatGptConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// The API key of your OpenAI account.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_gpt_model")]
    pub model: String,
    /// The maximum number of tokens allowed for the generated answer.
    #[serde(default)]
    pub max_tokens: Option<u16>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DalleConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// OpenAI API key; falls back to `chatgpt.api_key` when empty.
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
    #[serde(default = "default_images_count")]
    pub images_count: u8,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Settings for backends reached through a local gateway process
/// (EdgeGPT, Bard, Bing Image Creator). The gateways wrap the
/// unofficial upstream protocols; this bot only speaks plain HTTP
/// to them.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Gateway URL, e.g. `http://127.0.0.1:8090/bing`.
    #[serde(default)]
    pub endpoint: String,
    /// `""` for a direct connection, `"auto"` to take the current
    /// proxy from the rotation pool, anything else is used as a fixed
    /// proxy URL.
    #[serde(default)]
    pub proxy: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyAutomationConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Public proxy list page to scrape.
    #[serde(default = "default_proxy_list_url")]
    pub list_url: String,
    /// URL fetched through each candidate to decide whether it works.
    #[serde(default = "default_proxy_check_url")]
    pub check_url: String,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_check_timeout_seconds")]
    pub check_timeout_seconds: u64,
    /// Number of concurrent health checkers.
    #[serde(default = "default_max_checkers")]
    pub max_checkers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesConfig {
    /// Directory for per-chat conversation state files.
    #[serde(default = "default_conversations_dir")]
    pub conversations_dir: String,
    /// JSON file holding all user records.
    #[serde(default = "default_users_database")]
    pub users_database: String,
    /// Directory for request/response logs when data collecting is on.
    #[serde(default = "default_data_collecting_dir")]
    pub data_collecting_dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataCollectingConfig {
    #[serde(default)]
    pub enabled: bool,
    /// A new log file is started once the current one grows past this
    /// many bytes.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

/// Strings for I18N. `{}` is substituted where noted.
#[derive(Debug, Clone, Deserialize)]
pub struct I18nStrings {
    /// Sent after a successful enqueue; `{}` is the queue position.
    #[serde(default = "default_queued_prompt")]
    pub queued_prompt: String,
    #[serde(default = "default_queue_full_prompt")]
    pub queue_full_prompt: String,
    /// Terse rejection for banned users.
    #[serde(default = "default_banned_prompt")]
    pub banned_prompt: String,
    /// Generic request failure; `{}` is the error description.
    #[serde(default = "default_error_prompt")]
    pub error_prompt: String,
    #[serde(default = "default_proxy_unavailable_prompt")]
    pub proxy_unavailable_prompt: String,
    /// Sent after `/clear`.
    #[serde(default = "default_cleared_prompt")]
    pub cleared_prompt: String,
}

macro_rules! define_defaults {
    ($ty_name:ident { $($name:ident: $ty:ty = $default:expr,)* }) => {
        define_defaults! { $($name: $ty = $default,)* }
        paste! {
            impl Default for $ty_name {
                fn default() -> Self {
                    Self {
                        $($name: [<default_ $name>](),)*
                    }
                }
            }
        }
    };
    ($($name:ident: $ty:ty = $default:expr,)*) => {
        paste! {
            $(
                fn [<default_ $name>]() -> $ty {
                    $default
                }
            )*
        }
    };
}

define_defaults! {
    enabled: bool = true,
    edit_interval_ms: u64 = 500,
    timeout_seconds: u64 = 120,
    gpt_model: String = "gpt-3.5-turbo".to_owned(),
}

define_defaults!(QueueConfig {
    max_size: usize = 10,
    notify_position: bool = true,
});

define_defaults! {
    proxy_list_url: String = "http://free-proxy-list.net/".to_owned(),
    proxy_check_url: String = "https://www.google.com/".to_owned(),
    check_interval_seconds: u64 = 300,
    check_timeout_seconds: u64 = 10,
    max_checkers: usize = 5,
}

define_defaults!(FilesConfig {
    conversations_dir: String = "./data/conversations".to_owned(),
    users_database: String = "./data/users.json".to_owned(),
    data_collecting_dir: String = "./data/collected".to_owned(),
});

define_defaults! {
    max_file_size: u64 = 32 * 1024 * 1024,
    image_size: String = "1024x1024".to_owned(),
    images_count: u8 = 1,
}

define_defaults!(I18nStrings {
    queued_prompt: String = "\u{2705} Added to the queue, position: {}".to_owned(),
    queue_full_prompt: String = "\u{26A0} The request queue is full, please try again later".to_owned(),
    banned_prompt: String = "You are not allowed to use this bot".to_owned(),
    error_prompt: String = "\u{26A0} Error processing your request: {}".to_owned(),
    proxy_unavailable_prompt: String = "\u{26A0} Service is temporarily unavailable, please try again later".to_owned(),
    cleared_prompt: String = "\u{2705} Conversation history cleared".to_owned(),
});

impl Default for ChatGptConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            api_key: String::new(),
            model: default_gpt_model(),
            max_tokens: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for DalleConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            api_key: String::new(),
            image_size: default_image_size(),
            images_count: default_images_count(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: String::new(),
            proxy: String::new(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl Default for DataCollectingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_file_size: default_max_file_size(),
        }
    }
}

impl Default for ProxyAutomationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            list_url: default_proxy_list_url(),
            check_url: default_proxy_check_url(),
            check_interval_seconds: default_check_interval_seconds(),
            check_timeout_seconds: default_check_timeout_seconds(),
            max_checkers: default_max_checkers(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_json::from_str(
            r#"{ "telegram": { "bot_token": "123:abc" } }"#,
        )
        .unwrap();

        assert_eq!(config.queue.max_size, 10);
        assert!(config.chatgpt.enabled);
        assert!(!config.edgegpt.enabled);
        assert!(!config.proxy_automation.enabled);
        assert_eq!(config.proxy_automation.max_checkers, 5);
        assert_eq!(config.timeout_for(ModuleKind::Bard), 120);
        assert!(config.i18n.queued_prompt.contains("{}"));
    }

    #[test]
    fn sections_override_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "telegram": { "bot_token": "123:abc", "admin_ids": [42], "ban_by_default": true },
                "queue": { "max_size": 3 },
                "edgegpt": { "enabled": true, "endpoint": "http://localhost:8090/bing", "proxy": "auto", "timeout_seconds": 60 }
            }"#,
        )
        .unwrap();

        assert!(config.telegram.admin_ids.contains(&42));
        assert!(config.telegram.ban_by_default);
        assert_eq!(config.queue.max_size, 3);
        assert!(config.is_module_enabled(ModuleKind::EdgeGpt));
        assert_eq!(config.timeout_for(ModuleKind::EdgeGpt), 60);
    }
}
