//! Bot connection trait and dynamic dispatch companion.

use crate::error::Result;
use crate::{ConversationId, InboundEnvelope, MessageId, OutboundMessage, RawUpdate, SentMessage, TopicId, UpdateId};

use futures::Stream;
use serde::Serialize;
use std::pin::Pin;

/// Merged, deduplicated inbound stream.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEnvelope> + Send>>;

/// Which conversations a poll may deliver events from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollScope {
    /// Every conversation, private chats included. Used by the primary bot.
    Unrestricted,
    /// Only the listed conversations. Used by topic-bound bots.
    Conversations(Vec<ConversationId>),
}

impl PollScope {
    pub fn only(conversation_id: ConversationId) -> Self {
        Self::Conversations(vec![conversation_id])
    }

    /// Events without a conversation are only admitted by an unrestricted scope.
    pub fn admits(&self, conversation_id: Option<ConversationId>) -> bool {
        match self {
            PollScope::Unrestricted => true,
            PollScope::Conversations(allowed) => {
                conversation_id.is_some_and(|id| allowed.contains(&id))
            }
        }
    }
}

/// Confirmed identity of a bot account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BotProfile {
    pub user_id: i64,
    pub username: Option<String>,
    pub display_name: String,
}

/// A bot's rights in the group conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdminRights {
    pub is_admin: bool,
    pub can_manage_topics: bool,
}

/// Static trait for backend connections.
/// Use this for type-safe implementations.
pub trait BotConnection: Send + Sync + 'static {
    /// Fetch the next batch of updates starting at `cursor` (the first update
    /// id not yet acknowledged). Backends that cannot filter server-side may
    /// ignore `scope`.
    fn poll(
        &self,
        scope: &PollScope,
        cursor: Option<UpdateId>,
    ) -> impl std::future::Future<Output = Result<Vec<RawUpdate>>> + Send;

    /// Ask the backend who this connection is.
    fn confirm_identity(&self) -> impl std::future::Future<Output = Result<BotProfile>> + Send;

    fn send_message(
        &self,
        conversation_id: ConversationId,
        topic_id: Option<TopicId>,
        message: &OutboundMessage,
    ) -> impl std::future::Future<Output = Result<SentMessage>> + Send;

    fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        message: &OutboundMessage,
    ) -> impl std::future::Future<Output = Result<SentMessage>> + Send;

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    /// Acknowledge a button press.
    fn answer_interaction(
        &self,
        _interaction_id: &str,
        _text: Option<&str>,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }

    /// Rights of this bot in `conversation_id`.
    fn admin_rights(
        &self,
        conversation_id: ConversationId,
    ) -> impl std::future::Future<Output = Result<AdminRights>> + Send;

    /// Release the connection.
    fn close(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn BotConnectionDyn>` to hold connections of
/// different types side by side.
pub trait BotConnectionDyn: Send + Sync + 'static {
    fn poll<'a>(
        &'a self,
        scope: &'a PollScope,
        cursor: Option<UpdateId>,
    ) -> BoxFuture<'a, Result<Vec<RawUpdate>>>;

    fn confirm_identity<'a>(&'a self) -> BoxFuture<'a, Result<BotProfile>>;

    fn send_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        topic_id: Option<TopicId>,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<SentMessage>>;

    fn edit_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<SentMessage>>;

    fn delete_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'a, Result<bool>>;

    fn answer_interaction<'a>(
        &'a self,
        interaction_id: &'a str,
        text: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>>;

    fn admin_rights<'a>(&'a self, conversation_id: ConversationId) -> BoxFuture<'a, Result<AdminRights>>;

    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>>;
}

/// Blanket implementation: any type implementing BotConnection automatically implements BotConnectionDyn.
impl<T: BotConnection> BotConnectionDyn for T {
    fn poll<'a>(
        &'a self,
        scope: &'a PollScope,
        cursor: Option<UpdateId>,
    ) -> BoxFuture<'a, Result<Vec<RawUpdate>>> {
        Box::pin(BotConnection::poll(self, scope, cursor))
    }

    fn confirm_identity<'a>(&'a self) -> BoxFuture<'a, Result<BotProfile>> {
        Box::pin(BotConnection::confirm_identity(self))
    }

    fn send_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        topic_id: Option<TopicId>,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<SentMessage>> {
        Box::pin(BotConnection::send_message(self, conversation_id, topic_id, message))
    }

    fn edit_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
        message: &'a OutboundMessage,
    ) -> BoxFuture<'a, Result<SentMessage>> {
        Box::pin(BotConnection::edit_message(self, conversation_id, message_id, message))
    }

    fn delete_message<'a>(
        &'a self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> BoxFuture<'a, Result<bool>> {
        Box::pin(BotConnection::delete_message(self, conversation_id, message_id))
    }

    fn answer_interaction<'a>(
        &'a self,
        interaction_id: &'a str,
        text: Option<&'a str>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(BotConnection::answer_interaction(self, interaction_id, text))
    }

    fn admin_rights<'a>(&'a self, conversation_id: ConversationId) -> BoxFuture<'a, Result<AdminRights>> {
        Box::pin(BotConnection::admin_rights(self, conversation_id))
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, Result<()>> {
        Box::pin(BotConnection::close(self))
    }
}
