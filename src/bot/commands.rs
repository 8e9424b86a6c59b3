//! Command handlers for the Telegram front-end.

use std::str::FromStr;
use std::sync::Arc;

use futures::StreamExt;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::Me;

use super::HandlerResult;
use crate::app::AppContext;
use crate::queue::NewRequest;
use crate::request::ModuleKind;

const HELP_TEXT: &str = "\
I forward your prompts to several AI backends. Send me plain text to \
talk to your default module, or use a command:

/chatgpt <prompt> \u{2014} ask ChatGPT
/dalle <prompt> \u{2014} generate an image with DALL-E
/bing <prompt> \u{2014} ask Bing chat
/bard <prompt> \u{2014} ask Bard
/bingimage <prompt> \u{2014} generate an image with Bing Image Creator
/module [name] \u{2014} show or set your default module
/clear [name] \u{2014} clear the conversation history
/style <name> \u{2014} set the response style (Bing: precise/balanced/creative)
/lang <code> \u{2014} record your preferred language (replies use the \
bot-wide strings)
/chatid \u{2014} show the id of this chat";

/// Arguments following a command, with the command itself (and any
/// `@botname` mention) stripped.
#[derive(Debug, Clone)]
pub(super) struct CommandArgs(pub(super) String);

/// Text of a plain (non-command) message.
#[derive(Debug, Clone)]
pub(super) struct MessageText(pub(super) String);

/// Caption of a photo message. May itself start with a module command,
/// e.g. a photo captioned "/bing what is this?".
#[derive(Debug, Clone)]
pub(super) struct CaptionText(pub(super) String);

/// Builds a dptree predicate matching `/cmd`, `/cmd@botname` and their
/// argument-carrying forms, extracting the argument string.
pub(super) fn command_filter(cmd: &'static str) -> impl Fn(Message, Me) -> Option<CommandArgs> {
    move |msg: Message, me: Me| {
        let text = msg.text()?;
        let pat = format!("/{}", cmd);
        let rest = text.strip_prefix(&pat)?;

        // In groups a mention suffix may be attached to the command,
        // for example "/clear@xxxx_bot".
        let rest = if let Some(mentioned) = rest.strip_prefix('@') {
            let username = me.username();
            let after = mentioned.strip_prefix(username)?;
            after
        } else {
            rest
        };

        match rest.chars().next() {
            None => Some(CommandArgs(String::new())),
            Some(c) if c.is_whitespace() => Some(CommandArgs(rest.trim().to_owned())),
            // "/bingo" must not match "/bing".
            Some(_) => None,
        }
    }
}

macro_rules! require_admin {
    ($bot:expr, $msg:expr, $ctx:expr) => {
        match $msg.from() {
            Some(user) if $ctx.users.is_admin(user.id.0) => {}
            _ => {
                warn!(
                    "Non-admin user {} tried to execute admin commands",
                    $msg.from().map(|u| u.id.0).unwrap_or_default()
                );
                $bot.send_message(
                    $msg.chat.id,
                    "You don't have the right to execute admin commands!",
                )
                .await?;
                return Ok(());
            }
        }
    };
}

pub(super) async fn help(bot: Bot, msg: Message, _args: CommandArgs) -> HandlerResult {
    bot.send_message(msg.chat.id, HELP_TEXT).await?;
    Ok(())
}

pub(super) async fn chat_id(bot: Bot, msg: Message, _args: CommandArgs) -> HandlerResult {
    bot.send_message(msg.chat.id, format!("Chat id: {}", msg.chat.id.0))
        .await?;
    Ok(())
}

pub(super) async fn module(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    let Some(from) = msg.from() else {
        return Ok(());
    };

    if args.0.is_empty() {
        let record = ctx.users.get_or_create(from.id.0, &from.full_name())?;
        bot.send_message(
            msg.chat.id,
            format!("Your default module is {}", record.module),
        )
        .await?;
        return Ok(());
    }

    let Ok(module) = ModuleKind::from_str(&args.0) else {
        bot.send_message(
            msg.chat.id,
            "Unknown module, possible values are: chatgpt, dalle, edgegpt, bard, bing_imagegen",
        )
        .await?;
        return Ok(());
    };
    ctx.users.get_or_create(from.id.0, &from.full_name())?;
    ctx.users.set_module(from.id.0, module)?;
    bot.send_message(msg.chat.id, format!("Default module set to {}", module))
        .await?;
    Ok(())
}

pub(super) async fn lang(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    if args.0.is_empty() || args.0.contains(' ') {
        bot.send_message(msg.chat.id, "Usage: /lang <code>, for example /lang eng")
            .await?;
        return Ok(());
    }
    ctx.users.get_or_create(from.id.0, &from.full_name())?;
    ctx.users.set_lang(from.id.0, args.0.clone())?;
    bot.send_message(msg.chat.id, format!("Language set to {}", args.0))
        .await?;
    Ok(())
}

pub(super) async fn style(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    ctx.users.get_or_create(from.id.0, &from.full_name())?;
    if args.0.is_empty() {
        ctx.users.set_style(from.id.0, None)?;
        bot.send_message(msg.chat.id, "Response style reset to the default")
            .await?;
    } else {
        ctx.users.set_style(from.id.0, Some(args.0.clone()))?;
        bot.send_message(msg.chat.id, format!("Response style set to {}", args.0))
            .await?;
    }
    Ok(())
}

pub(super) async fn clear(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    let Some(from) = msg.from() else {
        return Ok(());
    };

    let module = if args.0.is_empty() {
        ctx.users.get_or_create(from.id.0, &from.full_name())?.module
    } else {
        match ModuleKind::from_str(&args.0) {
            Ok(module) => module,
            Err(_) => {
                bot.send_message(msg.chat.id, "Unknown module").await?;
                return Ok(());
            }
        }
    };

    ctx.dispatcher.clear_conversation(msg.chat.id.0, module)?;
    bot.send_message(msg.chat.id, &ctx.config.i18n.cleared_prompt)
        .await?;
    Ok(())
}

pub(super) async fn chatgpt(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    enqueue_prompt(bot, msg, ctx, ModuleKind::ChatGpt, args.0).await
}

pub(super) async fn dalle(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    enqueue_prompt(bot, msg, ctx, ModuleKind::Dalle, args.0).await
}

pub(super) async fn bing(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    enqueue_prompt(bot, msg, ctx, ModuleKind::EdgeGpt, args.0).await
}

pub(super) async fn bard(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    enqueue_prompt(bot, msg, ctx, ModuleKind::Bard, args.0).await
}

pub(super) async fn bing_image(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    enqueue_prompt(bot, msg, ctx, ModuleKind::BingImageGen, args.0).await
}

pub(super) async fn plain_message(
    bot: Bot,
    msg: Message,
    text: MessageText,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let module = ctx
        .users
        .get_or_create(from.id.0, &from.full_name())?
        .module;
    enqueue_prompt(bot, msg, ctx, module, text.0).await
}

/// Photo with a caption: the caption may name a module command, the
/// photo itself rides along as the request attachment.
pub(super) async fn photo_message(
    bot: Bot,
    msg: Message,
    caption: CaptionText,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    let Some(from) = msg.from() else {
        return Ok(());
    };

    let (explicit, prompt) = split_caption(&caption.0);
    let module = match explicit {
        Some(module) => module,
        None => ctx.users.get_or_create(from.id.0, &from.full_name())?.module,
    };

    let Some(attachment) = download_photo(&bot, &msg).await else {
        bot.send_message(msg.chat.id, "Failed to download the attached photo")
            .await?;
        return Ok(());
    };
    enqueue_request(bot, msg, ctx, module, prompt, Some(attachment)).await
}

/// Splits a photo caption into an explicit module command and the
/// prompt, e.g. "/bing what is this" -> (Some(EdgeGpt), "what is this").
/// Captions without a recognized command are plain prompts.
fn split_caption(caption: &str) -> (Option<ModuleKind>, String) {
    let Some(rest) = caption.strip_prefix('/') else {
        return (None, caption.trim().to_owned());
    };
    let (cmd, args) = match rest.split_once(char::is_whitespace) {
        Some((cmd, args)) => (cmd, args),
        None => (rest, ""),
    };
    let cmd = cmd.split('@').next().unwrap_or(cmd);
    match cmd.parse::<ModuleKind>() {
        Ok(module) => (Some(module), args.trim().to_owned()),
        Err(_) => (None, caption.trim().to_owned()),
    }
}

/// Fetches the largest size of the attached photo. Download failures
/// are logged and reported as a missing attachment.
async fn download_photo(bot: &Bot, msg: &Message) -> Option<Vec<u8>> {
    let photo = msg.photo()?.last()?;
    let file = match bot.get_file(&photo.file.id).await {
        Ok(file) => file,
        Err(err) => {
            warn!("Failed to resolve photo file: {}", err);
            return None;
        }
    };

    let mut stream = bot.download_file_stream(&file.path);
    let mut bytes = Vec::new();
    while let Some(part) = stream.next().await {
        match part {
            Ok(chunk) => bytes.extend_from_slice(&chunk),
            Err(err) => {
                warn!("Failed to download photo: {}", err);
                return None;
            }
        }
    }
    Some(bytes)
}

async fn enqueue_prompt(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
    module: ModuleKind,
    prompt: String,
) -> HandlerResult {
    enqueue_request(bot, msg, ctx, module, prompt, None).await
}

/// The single path every prompt goes through: resolve the user record,
/// submit to the queue and acknowledge (or report the rejection).
async fn enqueue_request(
    bot: Bot,
    msg: Message,
    ctx: Arc<AppContext>,
    module: ModuleKind,
    prompt: String,
    attachment: Option<Vec<u8>>,
) -> HandlerResult {
    let Some(from) = msg.from() else {
        return Ok(());
    };

    let prompt = prompt.trim().to_owned();
    if prompt.is_empty() {
        bot.send_message(msg.chat.id, "Please provide a prompt").await?;
        return Ok(());
    }
    if !ctx.config.is_module_enabled(module) {
        bot.send_message(msg.chat.id, format!("The {} module is disabled", module))
            .await?;
        return Ok(());
    }

    let record = ctx.users.get_or_create(from.id.0, &from.full_name())?;
    let submission = NewRequest {
        chat_id: msg.chat.id.0,
        user_id: from.id.0,
        module,
        prompt,
        attachment,
        reply_message_id: msg.id.0,
        style: record.style,
    };

    match ctx.queue.enqueue(submission) {
        Ok(position) => {
            if ctx.config.queue.notify_position {
                let reply = ctx
                    .config
                    .i18n
                    .queued_prompt
                    .replace("{}", &position.to_string());
                bot.send_message(msg.chat.id, reply).await?;
            }
        }
        Err(err) => {
            bot.send_message(msg.chat.id, err.user_message(&ctx.config.i18n))
                .await?;
        }
    }
    Ok(())
}

pub(super) async fn queue(
    bot: Bot,
    msg: Message,
    _args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    require_admin!(bot, msg, ctx);

    let entries = ctx.queue.snapshot();
    if entries.is_empty() {
        bot.send_message(msg.chat.id, "The queue is empty").await?;
        return Ok(());
    }
    let mut lines = vec![format!("{} pending request(s):", entries.len())];
    for entry in entries {
        lines.push(format!(
            "#{} user {} module {}",
            entry.id, entry.user_id, entry.module
        ));
    }
    bot.send_message(msg.chat.id, lines.join("\n")).await?;
    Ok(())
}

pub(super) async fn users(
    bot: Bot,
    msg: Message,
    _args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    require_admin!(bot, msg, ctx);

    let records = ctx.users.all();
    if records.is_empty() {
        bot.send_message(msg.chat.id, "No users yet").await?;
        return Ok(());
    }
    let lines: Vec<String> = records
        .iter()
        .map(|r| {
            format!(
                "{} {} requests={}{}{}",
                r.user_id,
                r.user_name,
                r.requests_total,
                if r.admin { " admin" } else { "" },
                if r.banned { " banned" } else { "" },
            )
        })
        .collect();
    bot.send_message(msg.chat.id, lines.join("\n")).await?;
    Ok(())
}

pub(super) async fn ban(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    require_admin!(bot, msg, ctx);

    let mut parts = args.0.splitn(2, ' ');
    let Some(Ok(user_id)) = parts.next().map(|p| p.parse::<u64>()) else {
        bot.send_message(msg.chat.id, "Usage: /ban <user_id> [reason]")
            .await?;
        return Ok(());
    };
    let reason = parts.next().map(|r| r.trim().to_owned());

    ctx.users.ban(user_id, reason)?;
    bot.send_message(msg.chat.id, format!("User {} banned", user_id))
        .await?;
    Ok(())
}

pub(super) async fn unban(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    require_admin!(bot, msg, ctx);

    let Ok(user_id) = args.0.parse::<u64>() else {
        bot.send_message(msg.chat.id, "Usage: /unban <user_id>").await?;
        return Ok(());
    };

    ctx.users.unban(user_id)?;
    bot.send_message(msg.chat.id, format!("User {} unbanned", user_id))
        .await?;
    Ok(())
}

pub(super) async fn broadcast(
    bot: Bot,
    msg: Message,
    args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    require_admin!(bot, msg, ctx);

    if args.0.is_empty() {
        bot.send_message(msg.chat.id, "Usage: /broadcast <message>")
            .await?;
        return Ok(());
    }

    let mut delivered = 0usize;
    let mut failed = 0usize;
    for record in ctx.users.all() {
        if Some(record.user_id) == msg.from().map(|u| u.id.0) {
            continue;
        }
        match bot
            .send_message(ChatId(record.user_id as i64), &args.0)
            .await
        {
            Ok(_) => delivered += 1,
            Err(err) => {
                warn!("Failed to broadcast to user {}: {}", record.user_id, err);
                failed += 1;
            }
        }
    }
    bot.send_message(
        msg.chat.id,
        format!("Broadcast delivered to {} user(s), {} failed", delivered, failed),
    )
    .await?;
    Ok(())
}

/// Drops the pending queue, abandons in-flight output, resets every
/// adapter and the proxy pool.
pub(super) async fn restart(
    bot: Bot,
    msg: Message,
    _args: CommandArgs,
    ctx: Arc<AppContext>,
) -> HandlerResult {
    require_admin!(bot, msg, ctx);

    let discarded = ctx.queue.purge();
    ctx.dispatcher.reset_all().await;
    ctx.proxy_pool.clear();
    info!(
        "Restart requested by {}: {} pending request(s) discarded",
        msg.from().map(|u| u.id.0).unwrap_or_default(),
        discarded
    );
    bot.send_message(
        msg.chat.id,
        format!("Restarted, {} pending request(s) discarded", discarded),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // `command_filter` takes teloxide types that are unwieldy to
    // construct by hand; the argument-splitting rules it relies on are
    // covered through a plain helper mirroring its core.
    fn match_command(cmd: &str, text: &str, me: &str) -> Option<String> {
        let pat = format!("/{}", cmd);
        let rest = text.strip_prefix(&pat)?;
        let rest = if let Some(mentioned) = rest.strip_prefix('@') {
            mentioned.strip_prefix(me)?
        } else {
            rest
        };
        match rest.chars().next() {
            None => Some(String::new()),
            Some(c) if c.is_whitespace() => Some(rest.trim().to_owned()),
            Some(_) => None,
        }
    }

    #[test]
    fn commands_are_matched_with_args_and_mentions() {
        assert_eq!(match_command("clear", "/clear", "bot"), Some(String::new()));
        assert_eq!(
            match_command("chatgpt", "/chatgpt hello there", "bot"),
            Some("hello there".to_owned())
        );
        assert_eq!(
            match_command("clear", "/clear@bot bard", "bot"),
            Some("bard".to_owned())
        );
        // A prefix of a longer command never matches.
        assert_eq!(match_command("bing", "/bingimage cat", "bot"), None);
        // A mention of some other bot is not for us.
        assert_eq!(match_command("clear", "/clear@other", "bot"), None);
    }

    #[test]
    fn captions_resolve_their_module_command() {
        assert_eq!(
            split_caption("/bing what is this"),
            (Some(ModuleKind::EdgeGpt), "what is this".to_owned())
        );
        assert_eq!(
            split_caption("/chatgpt@bot describe it"),
            (Some(ModuleKind::ChatGpt), "describe it".to_owned())
        );
        // No command: the whole caption is the prompt.
        assert_eq!(
            split_caption("a plain caption"),
            (None, "a plain caption".to_owned())
        );
        // Unrecognized commands are kept as prompt text.
        assert_eq!(
            split_caption("/weather tomorrow"),
            (None, "/weather tomorrow".to_owned())
        );
    }
}
