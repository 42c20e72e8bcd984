//! In-memory connection used by the messaging tests.

use crate::error::Result;
use crate::messaging::traits::{AdminRights, BotConnection, BotProfile, PollScope};
use crate::{
    ConversationId, InboundEvent, IncomingMessage, Interaction, MessageId, OutboundMessage,
    RawUpdate, SentMessage, TopicId, UpdateId,
};

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SendCall {
    pub conversation_id: ConversationId,
    pub topic_id: Option<TopicId>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EditCall {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub text: String,
}

pub(crate) struct FakeConnection {
    batches: Mutex<VecDeque<std::result::Result<Vec<RawUpdate>, String>>>,
    /// Once scripted batches run out, every poll fails with this.
    poll_failure: Option<String>,
    pub cursors: Mutex<Vec<Option<UpdateId>>>,
    pub sends: Mutex<Vec<SendCall>>,
    pub edits: Mutex<Vec<EditCall>>,
    pub deletes: Mutex<Vec<(ConversationId, MessageId)>>,
    pub answers: Mutex<Vec<(String, Option<String>)>>,
    /// Topic each sent message landed in.
    topics: Mutex<HashMap<MessageId, Option<TopicId>>>,
    next_message_id: AtomicI64,
    profile: Option<BotProfile>,
    identity_calls: AtomicUsize,
    rights: std::result::Result<AdminRights, String>,
    close_error: Option<String>,
    pub closed: AtomicBool,
}

impl FakeConnection {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(VecDeque::new()),
            poll_failure: None,
            cursors: Mutex::new(Vec::new()),
            sends: Mutex::new(Vec::new()),
            edits: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            topics: Mutex::new(HashMap::new()),
            next_message_id: AtomicI64::new(1),
            profile: None,
            identity_calls: AtomicUsize::new(0),
            rights: Ok(AdminRights {
                is_admin: true,
                can_manage_topics: true,
            }),
            close_error: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_batch(self, batch: Vec<RawUpdate>) -> Self {
        self.batches.lock().push_back(Ok(batch));
        self
    }

    pub fn with_poll_error(self, message: &str) -> Self {
        self.batches.lock().push_back(Err(message.to_owned()));
        self
    }

    pub fn failing_polls(mut self, message: &str) -> Self {
        self.poll_failure = Some(message.to_owned());
        self
    }

    pub fn with_profile(mut self, profile: BotProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_rights(mut self, rights: AdminRights) -> Self {
        self.rights = Ok(rights);
        self
    }

    pub fn with_rights_error(mut self, message: &str) -> Self {
        self.rights = Err(message.to_owned());
        self
    }

    pub fn with_close_error(mut self, message: &str) -> Self {
        self.close_error = Some(message.to_owned());
        self
    }

    /// Message ids handed out by this connection start at `first`.
    pub fn with_message_ids_from(self, first: MessageId) -> Self {
        self.next_message_id.store(first, Ordering::SeqCst);
        self
    }

    pub fn identity_calls(&self) -> usize {
        self.identity_calls.load(Ordering::SeqCst)
    }
}

impl BotConnection for FakeConnection {
    async fn poll(&self, _scope: &PollScope, cursor: Option<UpdateId>) -> Result<Vec<RawUpdate>> {
        self.cursors.lock().push(cursor);
        let next = self.batches.lock().pop_front();
        match next {
            Some(Ok(batch)) => Ok(batch),
            Some(Err(message)) => Err(anyhow::anyhow!(message).into()),
            None => match &self.poll_failure {
                Some(message) => Err(anyhow::anyhow!(message.clone()).into()),
                None => {
                    // Idle long poll.
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(Vec::new())
                }
            },
        }
    }

    async fn confirm_identity(&self) -> Result<BotProfile> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        self.profile
            .clone()
            .ok_or_else(|| anyhow::anyhow!("getMe unavailable").into())
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        topic_id: Option<TopicId>,
        message: &OutboundMessage,
    ) -> Result<SentMessage> {
        self.sends.lock().push(SendCall {
            conversation_id,
            topic_id,
            text: message.text.clone(),
        });
        let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        self.topics.lock().insert(message_id, topic_id);
        Ok(SentMessage {
            message_id,
            topic_id,
        })
    }

    async fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        message: &OutboundMessage,
    ) -> Result<SentMessage> {
        self.edits.lock().push(EditCall {
            conversation_id,
            message_id,
            text: message.text.clone(),
        });
        let topic_id = self.topics.lock().get(&message_id).copied().flatten();
        Ok(SentMessage {
            message_id,
            topic_id,
        })
    }

    async fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> Result<bool> {
        self.deletes.lock().push((conversation_id, message_id));
        Ok(true)
    }

    async fn answer_interaction(&self, interaction_id: &str, text: Option<&str>) -> Result<()> {
        self.answers
            .lock()
            .push((interaction_id.to_owned(), text.map(str::to_owned)));
        Ok(())
    }

    async fn admin_rights(&self, _conversation_id: ConversationId) -> Result<AdminRights> {
        self.rights
            .clone()
            .map_err(|message| anyhow::anyhow!(message).into())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        match &self.close_error {
            Some(message) => Err(anyhow::anyhow!(message.clone()).into()),
            None => Ok(()),
        }
    }
}

pub(crate) fn message_update(
    update_id: UpdateId,
    conversation_id: ConversationId,
    topic_id: Option<TopicId>,
) -> RawUpdate {
    RawUpdate {
        update_id,
        event: InboundEvent::Message(IncomingMessage {
            conversation_id,
            message_id: update_id * 10,
            topic_id,
            sender_id: Some(42),
            text: Some(format!("update {update_id}")),
            reply_to_message_id: None,
            reply_to_text: None,
            timestamp: chrono::Utc::now(),
        }),
    }
}

pub(crate) fn interaction_update(
    update_id: UpdateId,
    conversation_id: ConversationId,
    topic_id: Option<TopicId>,
) -> RawUpdate {
    RawUpdate {
        update_id,
        event: InboundEvent::Interaction(Interaction {
            interaction_id: format!("q{update_id}"),
            conversation_id: Some(conversation_id),
            message_id: Some(update_id * 10),
            sender_id: 42,
            data: Some("cancel".into()),
            topic_id,
        }),
    }
}
