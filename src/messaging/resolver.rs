//! Picks the bot connection an outbound operation must use.
//!
//! New sends are addressed by topic. Edits and deletes of an existing message
//! follow a fixed chain, first match wins:
//!
//! 1. the reference's `source_key`, if it names a registered bot
//! 2. the sent-message index entry for (conversation, message)
//! 3. the bot bound to the reference's topic hint
//! 4. the primary bot
//!
//! Agent bots whose topic duties were disabled by a failed permission check are
//! skipped in topic-based steps and their topics fall through to the primary.

use crate::error::AddressResolutionError;
use crate::messaging::identity::{BotIdentity, IdentityRegistry};
use crate::messaging::sent_index::SentMessageIndex;
use crate::{MessageRef, TopicId};

use std::sync::Arc;

#[derive(Clone)]
pub struct BotResolver {
    registry: Arc<IdentityRegistry>,
    sent: Arc<SentMessageIndex>,
}

impl BotResolver {
    pub fn new(registry: Arc<IdentityRegistry>, sent: Arc<SentMessageIndex>) -> Self {
        Self { registry, sent }
    }

    /// Topic owner if it is on duty, else the primary.
    pub fn resolve_for_send(
        &self,
        topic_hint: Option<TopicId>,
    ) -> Result<Arc<BotIdentity>, AddressResolutionError> {
        let primary = self
            .registry
            .primary()
            .ok_or(AddressResolutionError::NoPrimary)?;

        let identity = self
            .registry
            .resolve_by_topic(topic_hint)
            .filter(|identity| identity.is_primary() || identity.topic_duties_enabled())
            .unwrap_or(primary);

        Ok(identity.clone())
    }

    pub fn resolve_for_address(
        &self,
        reference: &MessageRef,
    ) -> Result<Arc<BotIdentity>, AddressResolutionError> {
        if let Some(key) = &reference.source_key {
            if let Some(identity) = self.registry.resolve_by_key(key) {
                return Ok(identity.clone());
            }
            tracing::debug!(bot = %key, "source key not registered, continuing resolution");
        }

        if let Some(key) = self
            .sent
            .lookup(reference.conversation_id, reference.message_id)
            && let Some(identity) = self.registry.resolve_by_key(&key)
        {
            return Ok(identity.clone());
        }

        self.resolve_for_send(reference.topic_hint)
    }
}
