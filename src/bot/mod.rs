//! Telegram front-end: the dptree handler chain and the outgoing
//! message sender.

mod commands;
mod sender;

pub(crate) use sender::TelegramSink;

use std::error::Error;
use std::sync::Arc;

use teloxide::dispatching::DefaultKey;
use teloxide::prelude::*;
use teloxide::types::BotCommand;

use crate::app::AppContext;
use commands::{command_filter, CaptionText, MessageText};

pub(crate) type HandlerResult = Result<(), Box<dyn Error + Send + Sync>>;

async fn message_filter(msg: Message) -> bool {
    let from = msg
        .from()
        .map(|u| {
            let full_name = u.full_name();
            if full_name.is_empty() {
                u.id.to_string()
            } else {
                full_name
            }
        })
        .unwrap_or("<unknown>".to_owned());

    if let Some(text) = msg.text() {
        info!("{} sent a message: {}", from, text);
    } else {
        info!("{} sent a message: {:#?}", from, msg.kind);
    }

    true
}

async fn default_handler(msg: Message) -> HandlerResult {
    warn!("Message ({}) is not handled!", msg.id);
    Ok(())
}

/// Commands advertised in the Telegram command menu. Admin commands
/// are deliberately left out.
pub(crate) fn bot_commands() -> Vec<BotCommand> {
    vec![
        BotCommand::new("help", "Show usage"),
        BotCommand::new("chatgpt", "Ask ChatGPT"),
        BotCommand::new("dalle", "Generate an image with DALL-E"),
        BotCommand::new("bing", "Ask Bing chat"),
        BotCommand::new("bard", "Ask Bard"),
        BotCommand::new("bingimage", "Generate an image with Bing Image Creator"),
        BotCommand::new("module", "Show or set your default module"),
        BotCommand::new("clear", "Clear the conversation history"),
        BotCommand::new("style", "Set the response style"),
        BotCommand::new("lang", "Set your language"),
        BotCommand::new("chatid", "Show the id of this chat"),
    ]
}

pub(crate) fn build_dispatcher(
    bot: Bot,
    ctx: Arc<AppContext>,
) -> Dispatcher<Bot, Box<dyn Error + Send + Sync + 'static>, DefaultKey> {
    let handler = Update::filter_message()
        .chain(dptree::filter_async(message_filter))
        .branch(dptree::filter_map(command_filter("start")).endpoint(commands::help))
        .branch(dptree::filter_map(command_filter("help")).endpoint(commands::help))
        .branch(dptree::filter_map(command_filter("chatid")).endpoint(commands::chat_id))
        .branch(dptree::filter_map(command_filter("module")).endpoint(commands::module))
        .branch(dptree::filter_map(command_filter("lang")).endpoint(commands::lang))
        .branch(dptree::filter_map(command_filter("style")).endpoint(commands::style))
        .branch(dptree::filter_map(command_filter("clear")).endpoint(commands::clear))
        .branch(dptree::filter_map(command_filter("chatgpt")).endpoint(commands::chatgpt))
        .branch(dptree::filter_map(command_filter("dalle")).endpoint(commands::dalle))
        .branch(dptree::filter_map(command_filter("bing")).endpoint(commands::bing))
        .branch(dptree::filter_map(command_filter("bard")).endpoint(commands::bard))
        .branch(dptree::filter_map(command_filter("bingimage")).endpoint(commands::bing_image))
        .branch(dptree::filter_map(command_filter("queue")).endpoint(commands::queue))
        .branch(dptree::filter_map(command_filter("users")).endpoint(commands::users))
        .branch(dptree::filter_map(command_filter("ban")).endpoint(commands::ban))
        .branch(dptree::filter_map(command_filter("unban")).endpoint(commands::unban))
        .branch(dptree::filter_map(command_filter("broadcast")).endpoint(commands::broadcast))
        .branch(dptree::filter_map(command_filter("restart")).endpoint(commands::restart))
        .branch(
            // Photos with a caption become requests with an attachment.
            dptree::filter_map(|msg: Message| {
                msg.photo()?;
                msg.caption().map(|c| CaptionText(c.to_owned()))
            })
            .endpoint(commands::photo_message),
        )
        .branch(
            // Plain text goes to the user's default module.
            dptree::filter_map(|msg: Message| {
                msg.text()
                    .filter(|t| !t.starts_with('/'))
                    .map(|t| MessageText(t.to_owned()))
            })
            .endpoint(commands::plain_message),
        )
        .branch(dptree::endpoint(default_handler));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ctx])
        .enable_ctrlc_handler()
        .build()
}
