//! Application assembly: builds the stores, the module adapters, the
//! queue worker and the Telegram dispatcher, then runs until the bot
//! stops.

use std::sync::Arc;

use anyhow::{Context, Error};
use teloxide::prelude::*;
use teloxide::types::MenuButton;
use tokio::sync::Notify;

use crate::bot::{bot_commands, build_dispatcher, TelegramSink};
use crate::collector::DataCollector;
use crate::config::SharedConfig;
use crate::conversation::ConversationStore;
use crate::dispatch::ModuleDispatcher;
use crate::modules::build_adapters;
use crate::proxy::{ProxyAutomation, ProxyPool};
use crate::queue::{QueueWorker, RequestQueue};
use crate::users::UserStore;

/// Shared state reachable from every Telegram handler.
pub struct AppContext {
    pub config: SharedConfig,
    pub queue: Arc<RequestQueue>,
    pub users: Arc<UserStore>,
    pub dispatcher: Arc<ModuleDispatcher>,
    pub proxy_pool: Arc<ProxyPool>,
}

async fn init_bot(config: &SharedConfig) -> Result<Bot, Error> {
    let bot = Bot::new(&config.telegram.bot_token);
    bot.set_chat_menu_button()
        .menu_button(MenuButton::Commands)
        .await?;
    bot.set_my_commands(bot_commands()).await?;
    Ok(bot)
}

pub async fn run(config: SharedConfig) -> Result<(), Error> {
    debug!("Initializing stores...");
    let users = Arc::new(
        UserStore::new(
            &config.files.users_database,
            config.telegram.admin_ids.clone(),
            config.telegram.ban_by_default,
        )
        .context("Failed to load the users database")?,
    );
    let conversations = Arc::new(
        ConversationStore::new(&config.files.conversations_dir)
            .context("Failed to open the conversations directory")?,
    );
    let collector = Arc::new(DataCollector::new(&config.files, &config.data_collecting));

    debug!("Initializing modules...");
    let proxy_pool = Arc::new(ProxyPool::new());
    let adapters = build_adapters(&config, Arc::clone(&proxy_pool));
    if adapters.is_empty() {
        warn!("No modules are enabled; the bot will reject every prompt");
    }
    let dispatcher = Arc::new(ModuleDispatcher::new(adapters, conversations));
    let queue = Arc::new(RequestQueue::new(config.queue.max_size, Arc::clone(&users)));

    info!("Initializing bot...");
    let bot = init_bot(&config).await.context("Failed to init bot")?;

    let shutdown = Arc::new(Notify::new());
    let sink = TelegramSink::spawn(bot.clone(), config.clone());
    let worker = QueueWorker::new(
        Arc::clone(&queue),
        Arc::clone(&dispatcher),
        sink,
        Arc::clone(&users),
        collector,
        config.clone(),
        Arc::clone(&shutdown),
    );
    tokio::spawn(worker.run());

    let automation = ProxyAutomation::new(
        Arc::clone(&proxy_pool),
        config.clone(),
        Arc::clone(&shutdown),
    );
    tokio::spawn(automation.run());

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        queue,
        users,
        dispatcher,
        proxy_pool,
    });
    let mut telegram_dispatcher = build_dispatcher(bot, ctx);
    info!("Bot is started!");
    telegram_dispatcher.dispatch().await;

    shutdown.notify_waiters();
    Ok(())
}
