//! Delivered-update tracking across all connections.
//!
//! Keys are (bot fingerprint, update id): update ids are only unique per bot,
//! so the same number arriving through two bots is two distinct events.
//!
//! Each bot keeps a window of its most recent update ids. Update ids are
//! monotonic per bot, so once an id falls out of the window everything at or
//! below it is treated as already delivered. An id far below the floor means
//! Telegram restarted the bot's sequence; the window starts over from it.

use crate::UpdateId;
use crate::messaging::identity::BotFingerprint;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

/// Default number of update ids remembered per bot.
pub const DEFAULT_DEDUP_WINDOW: usize = 1024;

/// How far below a bot's floor an id must land to count as a restarted
/// sequence rather than a replay.
const SEQUENCE_RESTART_GAP: UpdateId = 1_000_000;

pub struct DedupSet {
    window: usize,
    inner: Mutex<HashMap<BotFingerprint, BotWindow>>,
}

#[derive(Default)]
struct BotWindow {
    seen: BTreeSet<UpdateId>,
    /// Highest id evicted from `seen`.
    floor: Option<UpdateId>,
}

impl DedupSet {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record the update and report whether it is new. Test and insert happen
    /// under one lock acquisition.
    pub fn mark_and_check(&self, key: &BotFingerprint, update_id: UpdateId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let window = inner.entry(key.clone()).or_default();

        if let Some(floor) = window.floor
            && update_id <= floor
        {
            if floor - update_id < SEQUENCE_RESTART_GAP {
                return false;
            }
            tracing::warn!(
                bot = %key,
                update_id,
                floor,
                "update ids restarted below the delivered floor; resetting duplicate window"
            );
            *window = BotWindow::default();
        }
        if !window.seen.insert(update_id) {
            return false;
        }

        while window.seen.len() > self.window {
            if let Some(evicted) = window.seen.pop_first() {
                window.floor = Some(window.floor.map_or(evicted, |floor| floor.max(evicted)));
            }
        }

        true
    }

    /// Number of ids currently held for `key`.
    pub fn tracked(&self, key: &BotFingerprint) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map_or(0, |window| window.seen.len())
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}
