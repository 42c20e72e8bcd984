//! Per-bot long-poll loops feeding the shared merge channel.
//!
//! Each bot gets its own task with its own cursor. A task only advances its
//! cursor after the envelope has been accepted by the merge channel, so a full
//! channel stalls that bot's acknowledgements to the backend instead of
//! dropping events. Every task owns one sender clone; the consumer sees the
//! end of the stream once all of them have exited.

use crate::error::{IdentityConfirmationError, PollError};
use crate::messaging::identity::BotIdentity;
use crate::messaging::traits::PollScope;
use crate::{InboundEnvelope, RawUpdate, UpdateId};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Retry pacing for poll and confirmation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff, doubling up to a cap.
#[derive(Debug, Clone, Copy)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(settings: PollerSettings) -> Self {
        Self {
            initial: settings.initial_backoff,
            max: settings.max_backoff,
            current: settings.initial_backoff,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl InboundEnvelope {
    fn tag(identity: &BotIdentity, update: RawUpdate) -> Self {
        let topic_hint = update.event.topic_id();
        Self {
            update_id: update.update_id,
            event: update.event,
            source_key: identity.key().clone(),
            source_numeric_id: identity.numeric_id(),
            source_connection: identity.connection().clone(),
            topic_hint,
            received_at: chrono::Utc::now(),
        }
    }
}

pub fn spawn_poller(
    identity: Arc<BotIdentity>,
    scope: PollScope,
    sink: mpsc::Sender<InboundEnvelope>,
    settings: PollerSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_poller(&identity, &scope, sink, settings, &cancel).await;
        tracing::debug!(bot = %identity.key(), "poller stopped");
    })
}

/// `sink` is owned so it is dropped on every exit path.
async fn run_poller(
    identity: &BotIdentity,
    scope: &PollScope,
    sink: mpsc::Sender<InboundEnvelope>,
    settings: PollerSettings,
    cancel: &CancellationToken,
) {
    let mut cursor: Option<UpdateId> = None;
    let mut backoff = Backoff::new(settings);

    tracing::info!(bot = %identity.key(), role = %identity.role(), ?scope, "poller started");

    loop {
        let polled = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            polled = identity.connection().poll(scope, cursor) => polled,
        };

        let updates = match polled {
            Ok(updates) => {
                backoff.reset();
                updates
            }
            Err(error) => {
                let error = PollError {
                    key: identity.key().clone(),
                    message: error.to_string(),
                };
                let delay = backoff.next_delay();
                tracing::warn!(%error, retry_in_ms = delay.as_millis() as u64, "poll failed");
                if !pause(delay, cancel).await {
                    return;
                }
                continue;
            }
        };

        for update in updates {
            let next_cursor = update.update_id + 1;

            if scope.admits(update.event.conversation_id()) {
                let envelope = InboundEnvelope::tag(identity, update);
                let handed_off = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = sink.send(envelope) => sent,
                };
                if handed_off.is_err() {
                    tracing::debug!(bot = %identity.key(), "merge channel closed, stopping poller");
                    return;
                }
            } else {
                tracing::trace!(
                    bot = %identity.key(),
                    update_id = update.update_id,
                    "update outside poll scope dropped"
                );
            }

            cursor = Some(next_cursor);
        }
    }
}

/// Retry identity confirmation until it succeeds or the token is cancelled.
/// Runs independently of the bot's poller.
pub fn spawn_confirmation(
    identity: Arc<BotIdentity>,
    settings: PollerSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = Backoff::new(settings);
        while identity.profile().is_none() {
            let confirmed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                confirmed = identity.connection().confirm_identity() => confirmed,
            };

            match confirmed {
                Ok(profile) => {
                    tracing::info!(
                        bot = %identity.key(),
                        user_id = profile.user_id,
                        username = profile.username.as_deref().unwrap_or(""),
                        "bot identity confirmed"
                    );
                    identity.confirm(profile);
                }
                Err(error) => {
                    let error = IdentityConfirmationError {
                        key: identity.key().clone(),
                        message: error.to_string(),
                    };
                    let delay = backoff.next_delay();
                    tracing::warn!(%error, retry_in_ms = delay.as_millis() as u64, "identity confirmation failed");
                    if !pause(delay, &cancel).await {
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::identity::BotFingerprint;
    use crate::messaging::testing::{FakeConnection, message_update};
    use crate::messaging::traits::BotProfile;

    fn fast() -> PollerSettings {
        PollerSettings {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut backoff = Backoff::new(PollerSettings {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        });

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn cursor_advances_past_delivered_updates() {
        let connection = Arc::new(
            FakeConnection::new()
                .with_batch(vec![message_update(5, -100, None), message_update(6, -100, None)])
                .with_batch(vec![message_update(7, -100, None)]),
        );
        let identity = Arc::new(BotIdentity::primary(
            BotFingerprint::from("prim"),
            connection.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_poller(identity, PollScope::Unrestricted, tx, fast(), cancel.clone());

        let mut update_ids = Vec::new();
        for _ in 0..3 {
            update_ids.push(rx.recv().await.expect("envelope").update_id);
        }
        assert_eq!(update_ids, vec![5, 6, 7]);

        // Let the loop issue its next (idle) poll with the advanced cursor.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();

        let cursors = connection.cursors.lock().clone();
        assert_eq!(cursors[0], None);
        assert_eq!(cursors[1], Some(7));
        assert_eq!(cursors[2], Some(8));
    }

    #[tokio::test]
    async fn envelopes_are_tagged_with_identity() {
        let connection = Arc::new(FakeConnection::new().with_batch(vec![message_update(1, -100, Some(101))]));
        let identity = Arc::new(BotIdentity::agent(
            BotFingerprint::from("agent1"),
            [101],
            connection,
        ));
        identity.confirm(BotProfile {
            user_id: 77,
            username: Some("agent_bot".into()),
            display_name: "Agent".into(),
        });
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let _handle = spawn_poller(identity, PollScope::only(-100), tx, fast(), cancel.clone());

        let envelope = rx.recv().await.expect("envelope");
        assert_eq!(envelope.source_key, BotFingerprint::from("agent1"));
        assert_eq!(envelope.source_numeric_id, Some(77));
        assert_eq!(envelope.topic_hint, Some(101));
        cancel.cancel();
    }

    #[tokio::test]
    async fn out_of_scope_updates_are_skipped_but_acknowledged() {
        let connection = Arc::new(
            FakeConnection::new()
                .with_batch(vec![message_update(1, 42, None), message_update(2, -100, None)]),
        );
        let identity = Arc::new(BotIdentity::agent(
            BotFingerprint::from("agent1"),
            [101],
            connection.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_poller(identity, PollScope::only(-100), tx, fast(), cancel.clone());

        let envelope = rx.recv().await.expect("envelope");
        assert_eq!(envelope.update_id, 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(connection.cursors.lock()[1], Some(3));
    }

    #[tokio::test]
    async fn poll_errors_are_retried() {
        let connection = Arc::new(
            FakeConnection::new()
                .with_poll_error("connection reset")
                .with_poll_error("timeout")
                .with_batch(vec![message_update(1, -100, None)]),
        );
        let identity = Arc::new(BotIdentity::primary(BotFingerprint::from("prim"), connection));
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let _handle = spawn_poller(identity, PollScope::Unrestricted, tx, fast(), cancel.clone());

        let envelope = rx.recv().await.expect("envelope after retries");
        assert_eq!(envelope.update_id, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn full_channel_holds_back_the_cursor() {
        let connection = Arc::new(
            FakeConnection::new()
                .with_batch(vec![message_update(1, -100, None), message_update(2, -100, None)]),
        );
        let identity = Arc::new(BotIdentity::primary(
            BotFingerprint::from("prim"),
            connection.clone(),
        ));
        let (tx, mut rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let _handle = spawn_poller(identity, PollScope::Unrestricted, tx, fast(), cancel.clone());

        // Second envelope cannot be handed off, so no second poll happens yet.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(connection.cursors.lock().len(), 1);

        assert_eq!(rx.recv().await.unwrap().update_id, 1);
        assert_eq!(rx.recv().await.unwrap().update_id, 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn dropping_the_receiver_stops_the_poller() {
        let connection = Arc::new(FakeConnection::new().with_batch(vec![message_update(1, -100, None)]));
        let identity = Arc::new(BotIdentity::primary(BotFingerprint::from("prim"), connection));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let handle = spawn_poller(
            identity,
            PollScope::Unrestricted,
            tx,
            fast(),
            CancellationToken::new(),
        );
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn confirmation_retries_until_cancelled() {
        let connection = Arc::new(FakeConnection::new());
        let identity = Arc::new(BotIdentity::primary(
            BotFingerprint::from("prim"),
            connection.clone(),
        ));
        let cancel = CancellationToken::new();
        let handle = spawn_confirmation(identity.clone(), fast(), cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(connection.identity_calls() > 1);
        assert!(identity.profile().is_none());
    }

    #[tokio::test]
    async fn confirmation_stores_profile_once() {
        let connection = Arc::new(FakeConnection::new().with_profile(BotProfile {
            user_id: 999,
            username: Some("primary_bot".into()),
            display_name: "Primary".into(),
        }));
        let identity = Arc::new(BotIdentity::primary(
            BotFingerprint::from("prim"),
            connection.clone(),
        ));

        spawn_confirmation(identity.clone(), fast(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(identity.numeric_id(), Some(999));
        assert_eq!(connection.identity_calls(), 1);
    }
}
