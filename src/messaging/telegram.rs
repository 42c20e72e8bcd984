//! Telegram Bot API connection.
//!
//! One `TelegramConnection` per bot token. Updates are fetched with
//! `getUpdates` long polling; only messages and callback queries are requested.

use crate::error::Result;
use crate::messaging::traits::{AdminRights, BotConnection, BotProfile, PollScope};
use crate::{
    ConversationId, InboundEvent, IncomingMessage, Interaction, MessageId, OutboundMessage,
    ParseMode, RawUpdate, SentMessage, TopicId, UpdateId,
};

use anyhow::Context as _;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use teloxide::prelude::*;
use teloxide::types::{
    AllowedUpdate, CallbackQuery, CallbackQueryId, ChatMemberKind, MaybeInaccessibleMessage,
    Message,
    MessageId as TelegramMessageId, ParseMode as TelegramParseMode, ReplyParameters, ThreadId,
    UpdateKind,
};

/// Upper bound for the long-poll timeout. The HTTP client gives up after
/// roughly 17 seconds, so the server must answer before that.
pub const MAX_POLL_TIMEOUT_SECS: u32 = 15;

pub struct TelegramConnection {
    bot: Bot,
    poll_timeout_secs: u32,
    /// One past the highest update id that could not be converted. Those are
    /// never delivered, so the poller would otherwise never acknowledge them.
    skip_floor: AtomicI64,
    closed: AtomicBool,
}

impl TelegramConnection {
    pub fn new(token: &str, poll_timeout_secs: u32) -> Self {
        Self {
            bot: Bot::new(token),
            poll_timeout_secs: poll_timeout_secs.min(MAX_POLL_TIMEOUT_SECS),
            skip_floor: AtomicI64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::error::TransportError::Closed.into());
        }
        Ok(())
    }
}

impl BotConnection for TelegramConnection {
    async fn poll(&self, _scope: &PollScope, cursor: Option<UpdateId>) -> Result<Vec<RawUpdate>> {
        self.ensure_open()?;

        let offset = cursor.unwrap_or(0).max(self.skip_floor.load(Ordering::Acquire));
        let offset = i32::try_from(offset).context("update offset out of range")?;

        let updates = self
            .bot
            .get_updates()
            .offset(offset)
            .timeout(self.poll_timeout_secs)
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery])
            .await
            .context("getUpdates failed")?;

        let mut batch = Vec::with_capacity(updates.len());
        for update in updates {
            let update_id = i64::from(update.id.0);
            match convert_update(update.kind) {
                Some(event) => batch.push(RawUpdate { update_id, event }),
                None => {
                    tracing::trace!(update_id, "skipping unsupported telegram update");
                    self.skip_floor.fetch_max(update_id + 1, Ordering::AcqRel);
                }
            }
        }

        Ok(batch)
    }

    async fn confirm_identity(&self) -> Result<BotProfile> {
        let me = self.bot.get_me().await.context("getMe failed")?;
        Ok(BotProfile {
            user_id: i64::try_from(me.user.id.0).context("bot user id out of range")?,
            username: me.user.username.clone(),
            display_name: me.user.first_name.clone(),
        })
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        topic_id: Option<TopicId>,
        message: &OutboundMessage,
    ) -> Result<SentMessage> {
        self.ensure_open()?;

        let mut request = self
            .bot
            .send_message(ChatId(conversation_id), message.text.clone())
            .disable_notification(!message.notify);

        if let Some(topic_id) = topic_id {
            request = request.message_thread_id(ThreadId(telegram_message_id(topic_id)?));
        }
        if let Some(reply_to) = message.reply_to {
            request = request.reply_parameters(ReplyParameters::new(telegram_message_id(reply_to)?));
        }
        if let Some(parse_mode) = message.parse_mode {
            request = request.parse_mode(telegram_parse_mode(parse_mode));
        }

        let sent = request.await.context("sendMessage failed")?;
        Ok(sent_message(&sent))
    }

    async fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        message: &OutboundMessage,
    ) -> Result<SentMessage> {
        self.ensure_open()?;

        let mut request = self.bot.edit_message_text(
            ChatId(conversation_id),
            telegram_message_id(message_id)?,
            message.text.clone(),
        );
        if let Some(parse_mode) = message.parse_mode {
            request = request.parse_mode(telegram_parse_mode(parse_mode));
        }

        let edited = request.await.context("editMessageText failed")?;
        Ok(sent_message(&edited))
    }

    async fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool> {
        self.ensure_open()?;

        match self
            .bot
            .delete_message(ChatId(conversation_id), telegram_message_id(message_id)?)
            .await
        {
            Ok(_) => Ok(true),
            // Already gone or too old to delete.
            Err(teloxide::RequestError::Api(error)) => {
                tracing::debug!(conversation_id, message_id, %error, "telegram refused delete");
                Ok(false)
            }
            Err(error) => Err(anyhow::Error::new(error).context("deleteMessage failed").into()),
        }
    }

    async fn answer_interaction(&self, interaction_id: &str, text: Option<&str>) -> Result<()> {
        self.ensure_open()?;

        let mut request = self
            .bot
            .answer_callback_query(CallbackQueryId(interaction_id.to_owned()));
        if let Some(text) = text {
            request = request.text(text.to_owned());
        }
        request.await.context("answerCallbackQuery failed")?;
        Ok(())
    }

    async fn admin_rights(&self, conversation_id: ConversationId) -> Result<AdminRights> {
        let me = self.bot.get_me().await.context("getMe failed")?;
        let member = self
            .bot
            .get_chat_member(ChatId(conversation_id), me.user.id)
            .await
            .context("getChatMember failed")?;

        Ok(admin_rights_of(&member.kind))
    }

    /// Stops further use of this connection. Telegram's own `close` method is
    /// not called: it logs the bot out of the API server for ten minutes.
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

fn admin_rights_of(kind: &ChatMemberKind) -> AdminRights {
    match kind {
        ChatMemberKind::Owner(_) => AdminRights {
            is_admin: true,
            can_manage_topics: true,
        },
        ChatMemberKind::Administrator(admin) => AdminRights {
            is_admin: true,
            can_manage_topics: admin.can_manage_topics,
        },
        _ => AdminRights {
            is_admin: false,
            can_manage_topics: false,
        },
    }
}

fn telegram_message_id(id: i64) -> Result<TelegramMessageId> {
    let id = i32::try_from(id).with_context(|| format!("message id {id} out of range"))?;
    Ok(TelegramMessageId(id))
}

fn telegram_parse_mode(parse_mode: ParseMode) -> TelegramParseMode {
    match parse_mode {
        ParseMode::Html => TelegramParseMode::Html,
        ParseMode::MarkdownV2 => TelegramParseMode::MarkdownV2,
    }
}

fn sent_message(message: &Message) -> SentMessage {
    SentMessage {
        message_id: i64::from(message.id.0),
        topic_id: thread_of(message),
    }
}

fn thread_of(message: &Message) -> Option<TopicId> {
    message.thread_id.map(|ThreadId(id)| i64::from(id.0))
}

/// Translate a Telegram update into an inbound event. Returns `None` for
/// update kinds the transport does not carry.
fn convert_update(kind: UpdateKind) -> Option<InboundEvent> {
    match kind {
        UpdateKind::Message(message) => Some(InboundEvent::Message(convert_message(&message))),
        UpdateKind::CallbackQuery(query) => Some(InboundEvent::Interaction(convert_callback(&query))),
        _ => None,
    }
}

fn convert_message(message: &Message) -> IncomingMessage {
    let reply = message.reply_to_message();
    IncomingMessage {
        conversation_id: message.chat.id.0,
        message_id: i64::from(message.id.0),
        topic_id: thread_of(message),
        sender_id: message.from.as_ref().map(|user| user.id.0 as i64),
        text: message.text().or_else(|| message.caption()).map(str::to_owned),
        reply_to_message_id: reply.map(|reply| i64::from(reply.id.0)),
        reply_to_text: reply
            .and_then(|reply| reply.text().or_else(|| reply.caption()))
            .map(str::to_owned),
        timestamp: message.date,
    }
}

fn convert_callback(query: &CallbackQuery) -> Interaction {
    let (conversation_id, message_id, topic_id) = match &query.message {
        Some(MaybeInaccessibleMessage::Regular(message)) => (
            Some(message.chat.id.0),
            Some(i64::from(message.id.0)),
            thread_of(message),
        ),
        Some(MaybeInaccessibleMessage::Inaccessible(message)) => (
            Some(message.chat.id.0),
            Some(i64::from(message.message_id.0)),
            None,
        ),
        None => (None, None, None),
    };

    Interaction {
        interaction_id: query.id.0.clone(),
        conversation_id,
        message_id,
        sender_id: query.from.id.0 as i64,
        data: query.data.clone(),
        topic_id,
    }
}
