//! Topicbot: many bot connections to one forum-style group chat, presented as
//! a single transport.
//!
//! Each connection is bound to a set of topics. Inbound traffic from every
//! connection is merged into one deduplicated stream, and outbound sends,
//! edits and deletes are routed back through whichever connection owns the
//! topic or the message.

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;

pub use error::{Error, Result};
pub use messaging::identity::BotFingerprint;

use crate::messaging::traits::BotConnectionDyn;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Backend-assigned chat identifier.
pub type ConversationId = i64;

/// Forum topic (thread) identifier within a group conversation.
pub type TopicId = i64;

/// Backend-assigned message identifier, unique within a conversation.
pub type MessageId = i64;

/// Per-connection update sequence number.
pub type UpdateId = i64;

/// A message delivered to one of the bots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IncomingMessage {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub topic_id: Option<TopicId>,
    pub sender_id: Option<i64>,
    pub text: Option<String>,
    pub reply_to_message_id: Option<MessageId>,
    pub reply_to_text: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A button press (callback query) on a message one of the bots sent.
///
/// Interactions do not carry the thread fields plain messages do; the topic is
/// taken from the message the button was attached to, when the backend still
/// exposes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interaction {
    pub interaction_id: String,
    pub conversation_id: Option<ConversationId>,
    pub message_id: Option<MessageId>,
    pub sender_id: i64,
    pub data: Option<String>,
    pub topic_id: Option<TopicId>,
}

/// Inbound event payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Message(IncomingMessage),
    Interaction(Interaction),
}

impl InboundEvent {
    pub fn conversation_id(&self) -> Option<ConversationId> {
        match self {
            InboundEvent::Message(message) => Some(message.conversation_id),
            InboundEvent::Interaction(interaction) => interaction.conversation_id,
        }
    }

    pub fn topic_id(&self) -> Option<TopicId> {
        match self {
            InboundEvent::Message(message) => message.topic_id,
            InboundEvent::Interaction(interaction) => interaction.topic_id,
        }
    }
}

/// One update as returned by a connection's poll call.
#[derive(Debug, Clone, PartialEq)]
pub struct RawUpdate {
    pub update_id: UpdateId,
    pub event: InboundEvent,
}

/// An inbound event tagged with the identity of the connection that received it.
#[derive(Clone)]
pub struct InboundEnvelope {
    pub update_id: UpdateId,
    pub event: InboundEvent,
    pub source_key: BotFingerprint,
    /// Unset while the receiving bot's identity is unconfirmed.
    pub source_numeric_id: Option<i64>,
    /// The connection that received the event. Replies to interactions must
    /// go through it.
    pub source_connection: Arc<dyn BotConnectionDyn>,
    pub topic_hint: Option<TopicId>,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

impl std::fmt::Debug for InboundEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundEnvelope")
            .field("update_id", &self.update_id)
            .field("event", &self.event)
            .field("source_key", &self.source_key)
            .field("source_numeric_id", &self.source_numeric_id)
            .field("topic_hint", &self.topic_hint)
            .field("received_at", &self.received_at)
            .finish_non_exhaustive()
    }
}

/// Handle to a previously sent message, used to edit or delete it later.
///
/// Equality and hashing only look at the conversation and message ids; the
/// source key and topic are routing hints and may be missing on references
/// rebuilt from persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRef {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub source_key: Option<BotFingerprint>,
    pub topic_hint: Option<TopicId>,
}

impl MessageRef {
    pub fn new(conversation_id: ConversationId, message_id: MessageId) -> Self {
        Self {
            conversation_id,
            message_id,
            source_key: None,
            topic_hint: None,
        }
    }

    pub fn with_source_key(mut self, key: BotFingerprint) -> Self {
        self.source_key = Some(key);
        self
    }

    pub fn with_topic_hint(mut self, topic_id: TopicId) -> Self {
        self.topic_hint = Some(topic_id);
        self
    }
}

impl PartialEq for MessageRef {
    fn eq(&self, other: &Self) -> bool {
        self.conversation_id == other.conversation_id && self.message_id == other.message_id
    }
}

impl Eq for MessageRef {}

impl std::hash::Hash for MessageRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.conversation_id.hash(state);
        self.message_id.hash(state);
    }
}

/// Markup dialect of an outbound message's text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    Html,
    MarkdownV2,
}

/// Already-rendered outbound content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub text: String,
    pub reply_to: Option<MessageId>,
    pub notify: bool,
    pub parse_mode: Option<ParseMode>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
            notify: true,
            parse_mode: None,
        }
    }

    pub fn reply_to(mut self, message_id: MessageId) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    pub fn silent(mut self) -> Self {
        self.notify = false;
        self
    }

    pub fn with_parse_mode(mut self, parse_mode: ParseMode) -> Self {
        self.parse_mode = Some(parse_mode);
        self
    }

    /// Same options, different text. Used for followup chunks.
    pub(crate) fn with_text(&self, text: String) -> Self {
        Self {
            text,
            ..self.clone()
        }
    }
}

/// Backend acknowledgement of a sent or edited message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentMessage {
    pub message_id: MessageId,
    pub topic_id: Option<TopicId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn message_ref_identity_ignores_routing_hints() {
        let tagged = MessageRef::new(123, 1)
            .with_source_key(BotFingerprint::from_token("abc"))
            .with_topic_hint(7);
        let bare = MessageRef::new(123, 1);

        assert_eq!(tagged, bare);

        let mut seen = HashSet::new();
        seen.insert(tagged);
        assert!(seen.contains(&bare));
    }

    #[test]
    fn interaction_topic_comes_from_its_own_context() {
        let event = InboundEvent::Interaction(Interaction {
            interaction_id: "q1".into(),
            conversation_id: Some(-100),
            message_id: Some(5),
            sender_id: 42,
            data: Some("cancel".into()),
            topic_id: Some(101),
        });

        assert_eq!(event.topic_id(), Some(101));
        assert_eq!(event.conversation_id(), Some(-100));
    }

    #[test]
    fn outbound_followup_keeps_options() {
        let message = OutboundMessage::text("first")
            .reply_to(9)
            .silent()
            .with_parse_mode(ParseMode::Html);
        let followup = message.with_text("second".into());

        assert_eq!(followup.text, "second");
        assert_eq!(followup.reply_to, Some(9));
        assert!(!followup.notify);
        assert_eq!(followup.parse_mode, Some(ParseMode::Html));
    }
}
