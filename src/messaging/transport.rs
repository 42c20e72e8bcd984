//! TopicTransport: fan-in and routing for all bot connections.
//!
//! The rest of the application sees one transport. Inbound, every bot's poller
//! feeds a bounded merge channel and the consumer stream drops updates it has
//! already delivered. Outbound, sends are routed by topic and mutations of
//! existing messages by the resolver's fallback chain; every successful send is
//! recorded so later edits find the bot that owns the message.

use crate::config::{Config, PollingConfig};
use crate::error::{
    CloseError, CloseFailure, ConfigError, IdentityConfirmationError, PermissionError, Result,
    TransportError,
};
use crate::messaging::dedup::DedupSet;
use crate::messaging::identity::{BotFingerprint, BotIdentity, BotRole, IdentityRegistry, IdentitySnapshot};
use crate::messaging::poller::{PollerSettings, spawn_confirmation, spawn_poller};
use crate::messaging::resolver::BotResolver;
use crate::messaging::sent_index::SentMessageIndex;
use crate::messaging::telegram::TelegramConnection;
use crate::messaging::traits::{InboundStream, PollScope};
use crate::{ConversationId, InboundEnvelope, InboundEvent, MessageRef, OutboundMessage, TopicId};

use futures::StreamExt as _;
use futures::future::{join_all, ready};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Telegram rejects messages longer than this many characters.
pub const MAX_MESSAGE_LENGTH: usize = 4096;

/// Default merge channel capacity.
pub const DEFAULT_MERGE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// The forum group all topic-bound bots live in.
    pub group_chat_id: ConversationId,
    pub merge_capacity: usize,
    pub sent_index_capacity: usize,
    pub dedup_window: usize,
    pub poller: PollerSettings,
}

impl TransportSettings {
    pub fn new(group_chat_id: ConversationId) -> Self {
        Self {
            group_chat_id,
            merge_capacity: DEFAULT_MERGE_CAPACITY,
            sent_index_capacity: crate::messaging::sent_index::DEFAULT_SENT_INDEX_CAPACITY,
            dedup_window: crate::messaging::dedup::DEFAULT_DEDUP_WINDOW,
            poller: PollerSettings::default(),
        }
    }

    pub fn from_polling(group_chat_id: ConversationId, polling: &PollingConfig) -> Self {
        Self {
            group_chat_id,
            merge_capacity: polling.merge_capacity,
            sent_index_capacity: polling.sent_index_capacity,
            dedup_window: polling.dedup_window,
            poller: PollerSettings {
                initial_backoff: std::time::Duration::from_millis(polling.initial_backoff_ms),
                max_backoff: std::time::Duration::from_millis(polling.max_backoff_ms),
            },
        }
    }
}

/// Outcome of the startup permission check.
#[derive(Debug, Default)]
pub struct PermissionReport {
    pub passed: Vec<BotFingerprint>,
    pub failed: Vec<PermissionError>,
}

impl PermissionReport {
    pub fn all_passed(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Single send/edit/delete/close surface over every bot connection.
pub struct TopicTransport {
    registry: Arc<IdentityRegistry>,
    resolver: BotResolver,
    sent: Arc<SentMessageIndex>,
    dedup: Arc<DedupSet>,
    settings: TransportSettings,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TopicTransport {
    /// Fails if no primary bot is registered.
    pub fn new(registry: IdentityRegistry, settings: TransportSettings) -> Result<Self> {
        if registry.primary().is_none() {
            return Err(ConfigError::MissingPrimary.into());
        }

        let registry = Arc::new(registry);
        let sent = Arc::new(SentMessageIndex::new(settings.sent_index_capacity));
        let dedup = Arc::new(DedupSet::new(settings.dedup_window));

        Ok(Self {
            resolver: BotResolver::new(registry.clone(), sent.clone()),
            registry,
            sent,
            dedup,
            settings,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Build Telegram connections for the primary and every agent token.
    /// The config is validated first; nothing is opened if it is invalid.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let telegram = &config.telegram;
        let timeout = config.polling.timeout_secs;

        let mut registry = IdentityRegistry::new();
        registry.register(BotIdentity::primary(
            BotFingerprint::from_token(&telegram.token),
            Arc::new(TelegramConnection::new(&telegram.token, timeout)),
        ))?;

        for (topic_id, token) in &telegram.agents {
            registry.register(BotIdentity::agent(
                BotFingerprint::from_token(token),
                [*topic_id],
                Arc::new(TelegramConnection::new(token, timeout)),
            ))?;
        }

        tracing::info!(
            bots = registry.len(),
            chat_id = telegram.chat_id,
            "telegram transport configured"
        );

        Self::new(
            registry,
            TransportSettings::from_polling(telegram.chat_id, &config.polling),
        )
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &BotResolver {
        &self.resolver
    }

    pub fn sent_index(&self) -> &Arc<SentMessageIndex> {
        &self.sent
    }

    pub fn group_chat_id(&self) -> ConversationId {
        self.settings.group_chat_id
    }

    /// Snapshot of every identity, confirmed or not.
    pub fn identities(&self) -> Vec<IdentitySnapshot> {
        self.registry.identities().map(|identity| identity.snapshot()).collect()
    }

    /// Start one poller and one confirmation task per bot and return the merged,
    /// deduplicated inbound stream. Can only be taken once.
    pub fn inbound_stream(&self) -> Result<InboundStream> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed.into());
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted.into());
        }

        let (merge_tx, merge_rx) = mpsc::channel(self.settings.merge_capacity.max(1));
        let mut handles = Vec::with_capacity(self.registry.len() * 2);

        for identity in self.registry.identities() {
            let scope = match identity.role() {
                BotRole::Primary => PollScope::Unrestricted,
                BotRole::Agent => PollScope::only(self.settings.group_chat_id),
            };
            handles.push(spawn_poller(
                identity.clone(),
                scope,
                merge_tx.clone(),
                self.settings.poller,
                self.cancel.child_token(),
            ));
            handles.push(spawn_confirmation(
                identity.clone(),
                self.settings.poller,
                self.cancel.child_token(),
            ));
        }
        // Pollers hold the only senders from here on.
        drop(merge_tx);

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);

        tracing::info!(bots = self.registry.len(), "inbound stream started");

        let dedup = self.dedup.clone();
        let stream = ReceiverStream::new(merge_rx).filter(move |envelope: &InboundEnvelope| {
            let fresh = dedup.mark_and_check(&envelope.source_key, envelope.update_id);
            if !fresh {
                tracing::debug!(
                    bot = %envelope.source_key,
                    update_id = envelope.update_id,
                    "duplicate update dropped"
                );
            }
            ready(fresh)
        });

        Ok(Box::pin(stream))
    }

    /// Send to a topic of the group chat.
    pub async fn send_to_topic(
        &self,
        topic_hint: Option<TopicId>,
        message: OutboundMessage,
    ) -> Result<MessageRef> {
        self.send(self.settings.group_chat_id, topic_hint, message).await
    }

    /// Send through the bot owning `topic_hint` (or the primary). Overlong text
    /// is split; the returned reference points at the first chunk. Every chunk
    /// is recorded in the sent-message index before this returns.
    pub async fn send(
        &self,
        conversation_id: ConversationId,
        topic_hint: Option<TopicId>,
        message: OutboundMessage,
    ) -> Result<MessageRef> {
        self.ensure_open()?;
        let identity = self.resolver.resolve_for_send(topic_hint)?;

        let mut chunks = split_message(&message.text, MAX_MESSAGE_LENGTH).into_iter();
        let first = message.with_text(chunks.next().unwrap_or_default());

        let sent = identity
            .connection()
            .send_message(conversation_id, topic_hint, &first)
            .await?;
        self.sent
            .record(conversation_id, sent.message_id, identity.key().clone());

        self.send_followups(&identity, conversation_id, topic_hint, &message, chunks)
            .await?;

        tracing::debug!(
            bot = %identity.key(),
            conversation_id,
            message_id = sent.message_id,
            topic_id = ?topic_hint,
            "message sent"
        );

        Ok(MessageRef {
            conversation_id,
            message_id: sent.message_id,
            source_key: Some(identity.key().clone()),
            topic_hint: sent.topic_id.or(topic_hint),
        })
    }

    /// Edit through the bot that owns the message. The returned reference
    /// keeps the input's `source_key`.
    pub async fn edit(&self, reference: &MessageRef, message: OutboundMessage) -> Result<MessageRef> {
        self.ensure_open()?;
        let identity = self.resolver.resolve_for_address(reference)?;

        let mut chunks = split_message(&message.text, MAX_MESSAGE_LENGTH).into_iter();
        let first = message.with_text(chunks.next().unwrap_or_default());

        let edited = identity
            .connection()
            .edit_message(reference.conversation_id, reference.message_id, &first)
            .await?;

        // Overflow goes to the edited message's own topic, whatever the caller passed.
        let topic_id = edited.topic_id.or(reference.topic_hint);
        self.send_followups(&identity, reference.conversation_id, topic_id, &message, chunks)
            .await?;

        Ok(MessageRef {
            conversation_id: reference.conversation_id,
            message_id: edited.message_id,
            source_key: reference.source_key.clone(),
            topic_hint: topic_id,
        })
    }

    /// Delete through the bot that owns the message. Returns the backend's verdict.
    pub async fn delete(&self, reference: &MessageRef) -> Result<bool> {
        self.ensure_open()?;
        let identity = self.resolver.resolve_for_address(reference)?;
        identity
            .connection()
            .delete_message(reference.conversation_id, reference.message_id)
            .await
    }

    /// Answer a button press through the bot that received it.
    pub async fn answer_interaction(&self, envelope: &InboundEnvelope, text: Option<&str>) -> Result<()> {
        let InboundEvent::Interaction(interaction) = &envelope.event else {
            return Ok(());
        };
        envelope
            .source_connection
            .answer_interaction(&interaction.interaction_id, text)
            .await
    }

    /// One confirmation attempt per unconfirmed bot, concurrently. Pollers
    /// retry on their own; this is for callers that need profiles up front.
    pub async fn confirm_identities(&self) -> Vec<IdentityConfirmationError> {
        let attempts = self
            .registry
            .identities()
            .filter(|identity| identity.profile().is_none())
            .map(|identity| async move { (identity, identity.connection().confirm_identity().await) });

        let mut failures = Vec::new();
        for (identity, outcome) in join_all(attempts).await {
            match outcome {
                Ok(profile) => {
                    identity.confirm(profile);
                }
                Err(error) => failures.push(IdentityConfirmationError {
                    key: identity.key().clone(),
                    message: error.to_string(),
                }),
            }
        }
        failures
    }

    /// Check every bot's admin rights in the group chat. Bots that fail lose
    /// their topic duties; the others are unaffected.
    pub async fn verify_permissions(&self) -> PermissionReport {
        let chat_id = self.settings.group_chat_id;
        let checks = self.registry.identities().map(|identity| async move {
            let outcome = match identity.connection().admin_rights(chat_id).await {
                Ok(rights) if !rights.is_admin => Err("not an administrator of the group".to_owned()),
                Ok(rights) if !rights.can_manage_topics => {
                    Err("missing the manage topics right".to_owned())
                }
                Ok(_) => Ok(()),
                Err(error) => Err(format!("permission check failed: {error}")),
            };
            (identity, outcome)
        });

        let mut report = PermissionReport::default();
        for (identity, outcome) in join_all(checks).await {
            match outcome {
                Ok(()) => {
                    identity.set_topic_duties(true);
                    report.passed.push(identity.key().clone());
                }
                Err(reason) => {
                    let error = PermissionError {
                        key: identity.key().clone(),
                        reason,
                    };
                    tracing::warn!(%error, role = %identity.role(), "bot disabled for topic duties");
                    identity.set_topic_duties(false);
                    report.failed.push(error);
                }
            }
        }
        report
    }

    /// Stop every poller, wait for them, then close every connection. All
    /// close failures are collected and reported together.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in handles {
            if let Err(error) = handle.await
                && error.is_panic()
            {
                tracing::error!(%error, "poller task panicked");
            }
        }

        let closes = self.registry.identities().map(|identity| async move {
            (identity, identity.connection().close().await)
        });

        let mut failures = Vec::new();
        for (identity, outcome) in join_all(closes).await {
            if let Err(error) = outcome {
                tracing::warn!(bot = %identity.key(), %error, "failed to close bot connection");
                failures.push(CloseFailure {
                    key: identity.key().clone(),
                    message: error.to_string(),
                });
            }
        }

        tracing::info!(bots = self.registry.len(), failed = failures.len(), "transport closed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError { failures }.into())
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed.into());
        }
        Ok(())
    }

    async fn send_followups(
        &self,
        identity: &BotIdentity,
        conversation_id: ConversationId,
        topic_hint: Option<TopicId>,
        message: &OutboundMessage,
        chunks: impl Iterator<Item = String>,
    ) -> Result<()> {
        for chunk in chunks {
            let followup = message.with_text(chunk);
            let sent = identity
                .connection()
                .send_message(conversation_id, topic_hint, &followup)
                .await?;
            self.sent
                .record(conversation_id, sent.message_id, identity.key().clone());
        }
        Ok(())
    }
}

/// Split text into chunks of at most `max_chars` characters.
/// Tries to split at newlines, then spaces, then hard-cuts on a char boundary.
/// Only the single separator at a split point is dropped; other whitespace is
/// kept so indentation survives.
fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let limit = match remaining.char_indices().nth(max_chars) {
            Some((byte_index, _)) => byte_index,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };

        let window = &remaining[..limit];
        let separator = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|index| *index > 0);

        match separator {
            Some(split_at) => {
                chunks.push(remaining[..split_at].to_string());
                // '\n' and ' ' are both one byte.
                remaining = &remaining[split_at + 1..];
            }
            None => {
                chunks.push(remaining[..limit].to_string());
                remaining = &remaining[limit..];
            }
        }
    }

    chunks
}
