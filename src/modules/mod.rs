//! Backend adapters, one per [`ModuleKind`].
//!
//! ChatGPT and DALL-E talk to the official OpenAI API directly. The
//! remaining backends go through small local gateway processes that
//! wrap the unofficial upstream protocols; this crate only speaks
//! plain HTTP/JSON to them.

mod bard;
mod bing_image;
mod chatgpt;
mod dalle;
mod edgegpt;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SharedConfig;
use crate::dispatch::ChatAdapter;
use crate::error::BotError;
use crate::proxy::ProxyPool;
use crate::request::ModuleKind;

pub use bard::BardAdapter;
pub use bing_image::BingImageAdapter;
pub use chatgpt::ChatGptAdapter;
pub use dalle::DalleAdapter;
pub use edgegpt::EdgeGptAdapter;

/// Builds one adapter per enabled module.
pub fn build_adapters(
    config: &SharedConfig,
    proxy_pool: Arc<ProxyPool>,
) -> HashMap<ModuleKind, Arc<dyn ChatAdapter>> {
    let mut adapters: HashMap<ModuleKind, Arc<dyn ChatAdapter>> = HashMap::new();

    if config.chatgpt.enabled {
        adapters.insert(
            ModuleKind::ChatGpt,
            Arc::new(ChatGptAdapter::new(&config.chatgpt)),
        );
    }
    if config.dalle.enabled {
        adapters.insert(
            ModuleKind::Dalle,
            Arc::new(DalleAdapter::new(&config.chatgpt, &config.dalle)),
        );
    }
    if config.edgegpt.enabled {
        adapters.insert(
            ModuleKind::EdgeGpt,
            Arc::new(EdgeGptAdapter::new(
                config.edgegpt.clone(),
                Arc::clone(&proxy_pool),
            )),
        );
    }
    if config.bard.enabled {
        adapters.insert(
            ModuleKind::Bard,
            Arc::new(BardAdapter::new(
                config.bard.clone(),
                Arc::clone(&proxy_pool),
            )),
        );
    }
    if config.bing_imagegen.enabled {
        adapters.insert(
            ModuleKind::BingImageGen,
            Arc::new(BingImageAdapter::new(
                config.bing_imagegen.clone(),
                Arc::clone(&proxy_pool),
            )),
        );
    }

    let names: Vec<&str> = adapters.values().map(|a| a.name()).collect();
    info!("Enabled modules: {}", names.join(", "));
    adapters
}

/// HTTP client honoring a module's proxy setting: `""` is a direct
/// connection, `"auto"` takes the current proxy from the rotation
/// pool (failing fast when the pool is empty), anything else is used
/// as a fixed proxy URL.
pub(crate) fn proxied_client(
    proxy_setting: &str,
    pool: &ProxyPool,
    timeout_seconds: u64,
) -> Result<reqwest::Client, BotError> {
    let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(timeout_seconds));
    match proxy_setting.trim() {
        "" => {}
        "auto" => {
            let proxy = pool.current_proxy().ok_or(BotError::ProxyUnavailable)?;
            builder = builder.proxy(reqwest::Proxy::all(&proxy)?);
        }
        fixed => {
            builder = builder.proxy(reqwest::Proxy::all(fixed)?);
        }
    }
    Ok(builder.build()?)
}

/// Splits off full lines from a streaming byte buffer; used by the
/// gateway adapters that stream line-delimited JSON.
pub(crate) fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line[..line.len() - 1]);
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_owned());
        }
    }
    lines
}
