//! Update consumer: keeps the chat registry in step with what the bot sees.

use std::sync::Arc;

use teloxide::{
    dispatching::Dispatcher,
    dptree,
    prelude::*,
    types::{ChatMemberUpdated, Message},
};

use emb_core::{
    domain::{ChatId, MemberStatus, UserId},
    errors::Error,
    gateway::ChatGateway,
};

use crate::{chat_info, member_status};

#[derive(Clone)]
pub struct EventState {
    pub gateway: Arc<ChatGateway>,
}

/// What a membership update means for the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Membership {
    Joined,
    Departed,
    Changed,
}

pub(crate) fn membership_change(old: MemberStatus, new: MemberStatus) -> Membership {
    match (old.is_present(), new.is_present()) {
        (false, true) => Membership::Joined,
        (_, false) => Membership::Departed,
        (true, true) => Membership::Changed,
    }
}

/// Which cached listings a change in someone else's membership affects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AdminChange {
    /// The creator changed: chat listings and the admin list.
    Ownership,
    /// Only the admin list.
    Admins,
}

pub(crate) fn admin_change(old: MemberStatus, new: MemberStatus) -> Option<AdminChange> {
    if old == new || !(old.is_privileged() || new.is_privileged()) {
        return None;
    }
    if old == MemberStatus::Owner || new == MemberStatus::Owner {
        Some(AdminChange::Ownership)
    } else {
        Some(AdminChange::Admins)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Start,
    Register,
    Leave,
    Other,
}

pub(crate) fn parse_command(text: &str) -> Option<Command> {
    let first = text.trim().split_whitespace().next()?;
    let name = first.strip_prefix('/')?;
    // Telegram may send `/cmd@botname`.
    let name = name.split('@').next().unwrap_or("").to_lowercase();
    Some(match name.as_str() {
        "start" | "help" => Command::Start,
        "register" => Command::Register,
        "leave" => Command::Leave,
        _ => Command::Other,
    })
}

pub async fn run_polling(bot: Bot, gateway: Arc<ChatGateway>) -> anyhow::Result<()> {
    let state = Arc::new(EventState { gateway });

    let handler = dptree::entry()
        .branch(Update::filter_my_chat_member().endpoint(handle_my_chat_member))
        .branch(Update::filter_chat_member().endpoint(handle_chat_member))
        .branch(Update::filter_message().endpoint(handle_message));

    tracing::info!("update consumer started");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// The bot's own membership changed.
async fn handle_my_chat_member(
    upd: ChatMemberUpdated,
    state: Arc<EventState>,
) -> ResponseResult<()> {
    let info = chat_info(&upd.chat);
    let old = member_status(upd.old_chat_member.status());
    let new = member_status(upd.new_chat_member.status());

    let outcome = match membership_change(old, new) {
        Membership::Departed => {
            tracing::info!(chat_id = info.id.0, kind = info.kind.as_str(), "bot removed from chat");
            state.gateway.forget_chat(info.id).await.map(|_| ())
        }
        Membership::Joined => {
            tracing::info!(chat_id = info.id.0, kind = info.kind.as_str(), "bot added to chat");
            state.gateway.note_chat(&info).await
        }
        Membership::Changed => {
            tracing::debug!(chat_id = info.id.0, ?old, ?new, "bot status changed");
            if old.is_privileged() != new.is_privileged() {
                state.gateway.expire_listings(info.id);
            }
            state.gateway.note_chat(&info).await
        }
    };
    if let Err(e) = outcome {
        tracing::warn!(chat_id = info.id.0, error = %e, "failed to record membership change");
    }
    Ok(())
}

/// Someone else's membership changed; only privileged changes matter.
async fn handle_chat_member(
    upd: ChatMemberUpdated,
    state: Arc<EventState>,
) -> ResponseResult<()> {
    let chat = ChatId(upd.chat.id.0);
    let old = member_status(upd.old_chat_member.status());
    let new = member_status(upd.new_chat_member.status());

    match admin_change(old, new) {
        Some(AdminChange::Ownership) => {
            tracing::info!(chat_id = chat.0, "chat ownership changed");
            state.gateway.expire_listings(chat);
        }
        Some(AdminChange::Admins) => {
            tracing::debug!(chat_id = chat.0, ?old, ?new, "administrators changed");
            state.gateway.expire_members(chat);
        }
        None => {}
    }
    Ok(())
}

async fn reply(bot: &Bot, chat: teloxide::types::ChatId, text: impl Into<String>) {
    if let Err(e) = bot.send_message(chat, text).await {
        tracing::debug!(chat_id = chat.0, error = %e, "failed to send reply");
    }
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<EventState>) -> ResponseResult<()> {
    let info = chat_info(&msg.chat);
    let command = msg.text().and_then(parse_command);

    if info.kind.is_group() && command != Some(Command::Register) {
        match state.gateway.is_known(info.id).await {
            Ok(true) => {}
            Ok(false) => {
                if let Err(e) = state.gateway.note_chat(&info).await {
                    tracing::warn!(chat_id = info.id.0, error = %e, "failed to register chat");
                }
            }
            Err(e) => {
                tracing::warn!(chat_id = info.id.0, error = %e, "chat registry lookup failed")
            }
        }
    }

    let Some(command) = command else {
        return Ok(());
    };

    match command {
        Command::Start if !info.kind.is_group() => {
            reply(
                &bot,
                msg.chat.id,
                "Add me to a group as an administrator, then open the app to see the \
                 groups you own and their administrators.",
            )
            .await;
        }
        Command::Register if info.kind.is_group() => {
            let text = match state.gateway.note_chat(&info).await {
                Ok(()) => format!("Chat '{}' is registered.", info.display_title()),
                Err(e) => {
                    tracing::warn!(chat_id = info.id.0, error = %e, "failed to register chat");
                    e.user_message()
                }
            };
            reply(&bot, msg.chat.id, text).await;
        }
        Command::Register => {
            reply(&bot, msg.chat.id, "This command only works in groups.").await;
        }
        Command::Leave if info.kind.is_group() => {
            let Some(from) = msg.from() else {
                return Ok(());
            };
            let user = UserId(from.id.0 as i64);
            leave(&bot, &msg, &state, info.id, user).await;
        }
        _ => {}
    }

    Ok(())
}

async fn leave(bot: &Bot, msg: &Message, state: &EventState, chat: ChatId, user: UserId) {
    let Err(e) = state.gateway.leave_chat(user, chat).await else {
        return;
    };
    if !matches!(e, Error::Forbidden(_)) {
        tracing::warn!(chat_id = chat.0, user_id = user.0, error = %e, "leave failed");
    }
    reply(bot, msg.chat.id, e.user_message()).await;
}
