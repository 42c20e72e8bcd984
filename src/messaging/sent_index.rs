//! Bounded record of which bot sent which message.
//!
//! Lets edits and deletes find the right connection for references that were
//! rebuilt without their source key. Oldest entries are evicted first, by
//! insertion order.

use crate::messaging::identity::BotFingerprint;
use crate::{ConversationId, MessageId};

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

/// Default number of tracked messages.
pub const DEFAULT_SENT_INDEX_CAPACITY: usize = 2048;

type SentKey = (ConversationId, MessageId);

pub struct SentMessageIndex {
    capacity: usize,
    inner: Mutex<SentIndexInner>,
}

#[derive(Default)]
struct SentIndexInner {
    entries: HashMap<SentKey, BotFingerprint>,
    order: VecDeque<SentKey>,
}

impl SentMessageIndex {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(SentIndexInner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Remember that `key` sent the message. Entries are write-once: a second
    /// record for the same message is ignored.
    pub fn record(&self, conversation_id: ConversationId, message_id: MessageId, key: BotFingerprint) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let sent_key = (conversation_id, message_id);
        if inner.entries.contains_key(&sent_key) {
            return;
        }

        while inner.order.len() >= self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }

        inner.entries.insert(sent_key, key);
        inner.order.push_back(sent_key);
    }

    pub fn lookup(&self, conversation_id: ConversationId, message_id: MessageId) -> Option<BotFingerprint> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .get(&(conversation_id, message_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SentMessageIndex {
    fn default() -> Self {
        Self::new(DEFAULT_SENT_INDEX_CAPACITY)
    }
}
