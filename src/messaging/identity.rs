//! Bot identities and the registry that owns them.
//!
//! Every connection gets a [`BotFingerprint`] derived from its token, so it can
//! be addressed, deduplicated and logged before (or without) the backend ever
//! confirming who the bot is. Confirmation fills in the numeric id and names
//! at most once per identity.

use crate::TopicId;
use crate::error::ConfigError;
use crate::messaging::traits::{BotConnectionDyn, BotProfile};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

const FINGERPRINT_LEN: usize = 10;

/// Stable, log-safe key of a bot connection, derived from its token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BotFingerprint(Arc<str>);

impl BotFingerprint {
    /// First 10 hex chars of the token's SHA-256 digest.
    pub fn from_token(token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(Arc::from(&digest[..FINGERPRINT_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BotFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BotFingerprint {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotRole {
    /// Fallback for everything no agent bot owns, private chats included.
    Primary,
    /// Bound to specific topics of the group conversation.
    Agent,
}

impl std::fmt::Display for BotRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotRole::Primary => write!(f, "primary"),
            BotRole::Agent => write!(f, "agent"),
        }
    }
}

/// One registered bot connection.
pub struct BotIdentity {
    key: BotFingerprint,
    role: BotRole,
    topics: BTreeSet<TopicId>,
    connection: Arc<dyn BotConnectionDyn>,
    profile: OnceLock<BotProfile>,
    topic_duties: AtomicBool,
}

impl BotIdentity {
    pub fn primary(key: BotFingerprint, connection: Arc<dyn BotConnectionDyn>) -> Self {
        Self::new(key, BotRole::Primary, BTreeSet::new(), connection)
    }

    pub fn agent(
        key: BotFingerprint,
        topics: impl IntoIterator<Item = TopicId>,
        connection: Arc<dyn BotConnectionDyn>,
    ) -> Self {
        Self::new(key, BotRole::Agent, topics.into_iter().collect(), connection)
    }

    fn new(
        key: BotFingerprint,
        role: BotRole,
        topics: BTreeSet<TopicId>,
        connection: Arc<dyn BotConnectionDyn>,
    ) -> Self {
        Self {
            key,
            role,
            topics,
            connection,
            profile: OnceLock::new(),
            topic_duties: AtomicBool::new(true),
        }
    }

    pub fn key(&self) -> &BotFingerprint {
        &self.key
    }

    pub fn role(&self) -> BotRole {
        self.role
    }

    pub fn is_primary(&self) -> bool {
        self.role == BotRole::Primary
    }

    pub fn topics(&self) -> &BTreeSet<TopicId> {
        &self.topics
    }

    pub fn connection(&self) -> &Arc<dyn BotConnectionDyn> {
        &self.connection
    }

    /// `None` until the backend has confirmed this bot's identity.
    pub fn profile(&self) -> Option<&BotProfile> {
        self.profile.get()
    }

    pub fn numeric_id(&self) -> Option<i64> {
        self.profile().map(|profile| profile.user_id)
    }

    pub fn username(&self) -> Option<&str> {
        self.profile().and_then(|profile| profile.username.as_deref())
    }

    /// Record the confirmed profile. Returns `true` if this call stored it,
    /// `false` if the identity was already confirmed.
    pub fn confirm(&self, profile: BotProfile) -> bool {
        self.profile.set(profile).is_ok()
    }

    /// Whether this bot may serve its bound topics. Cleared when the
    /// permission check fails.
    pub fn topic_duties_enabled(&self) -> bool {
        self.topic_duties.load(Ordering::Acquire)
    }

    pub fn set_topic_duties(&self, enabled: bool) {
        self.topic_duties.store(enabled, Ordering::Release);
    }

    pub fn snapshot(&self) -> IdentitySnapshot {
        let profile = self.profile();
        IdentitySnapshot {
            key: self.key.clone(),
            role: self.role,
            topics: self.topics.iter().copied().collect(),
            numeric_id: profile.map(|profile| profile.user_id),
            username: profile.and_then(|profile| profile.username.clone()),
            display_name: profile.map(|profile| profile.display_name.clone()),
            topic_duties: self.topic_duties_enabled(),
        }
    }
}

impl std::fmt::Debug for BotIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotIdentity")
            .field("key", &self.key)
            .field("role", &self.role)
            .field("topics", &self.topics)
            .field("profile", &self.profile.get())
            .field("topic_duties", &self.topic_duties_enabled())
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of an identity, for mention detection and status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentitySnapshot {
    pub key: BotFingerprint,
    pub role: BotRole,
    pub topics: Vec<TopicId>,
    pub numeric_id: Option<i64>,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub topic_duties: bool,
}

/// All bot identities of the process. Built once at startup; afterwards only
/// confirmation and the topic-duty flag change.
#[derive(Default)]
pub struct IdentityRegistry {
    primary: Option<BotFingerprint>,
    by_key: HashMap<BotFingerprint, Arc<BotIdentity>>,
    by_topic: HashMap<TopicId, BotFingerprint>,
    /// Registration order, primary first when registered first.
    order: Vec<BotFingerprint>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an identity. Nothing is registered if the key, a bound topic, or
    /// the primary role collides with an existing entry.
    pub fn register(&mut self, identity: BotIdentity) -> Result<Arc<BotIdentity>, ConfigError> {
        if self.by_key.contains_key(identity.key()) {
            return Err(ConfigError::DuplicateFingerprint {
                key: identity.key().clone(),
            });
        }

        if identity.is_primary()
            && let Some(existing) = &self.primary
        {
            return Err(ConfigError::DuplicatePrimary {
                existing: existing.clone(),
            });
        }

        for topic_id in identity.topics() {
            if let Some(existing) = self.by_topic.get(topic_id) {
                return Err(ConfigError::DuplicateTopic {
                    topic_id: *topic_id,
                    existing: existing.clone(),
                });
            }
        }

        let key = identity.key().clone();
        if identity.is_primary() {
            self.primary = Some(key.clone());
        }
        for topic_id in identity.topics() {
            self.by_topic.insert(*topic_id, key.clone());
        }

        let identity = Arc::new(identity);
        self.by_key.insert(key.clone(), identity.clone());
        self.order.push(key.clone());

        tracing::debug!(
            bot = %key,
            role = %identity.role(),
            topics = ?identity.topics(),
            "bot identity registered"
        );

        Ok(identity)
    }

    pub fn primary(&self) -> Option<&Arc<BotIdentity>> {
        self.primary.as_ref().and_then(|key| self.by_key.get(key))
    }

    /// The agent bound to `topic_id`, else the primary. Only `None` when no
    /// primary has been registered.
    pub fn resolve_by_topic(&self, topic_id: Option<TopicId>) -> Option<&Arc<BotIdentity>> {
        topic_id
            .and_then(|topic_id| self.by_topic.get(&topic_id))
            .and_then(|key| self.by_key.get(key))
            .or_else(|| self.primary())
    }

    /// A miss is not an error; resolution continues down its fallback chain.
    pub fn resolve_by_key(&self, key: &BotFingerprint) -> Option<&Arc<BotIdentity>> {
        self.by_key.get(key)
    }

    /// Store a confirmed profile for `key`. `None` if the key is unknown,
    /// otherwise whether this call was the one that confirmed it.
    pub fn confirm(&self, key: &BotFingerprint, profile: BotProfile) -> Option<bool> {
        self.by_key.get(key).map(|identity| identity.confirm(profile))
    }

    /// Identities in registration order.
    pub fn identities(&self) -> impl Iterator<Item = &Arc<BotIdentity>> {
        self.order.iter().filter_map(|key| self.by_key.get(key))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::testing::FakeConnection;

    fn identity(token: &str, topics: &[TopicId]) -> BotIdentity {
        let connection = Arc::new(FakeConnection::new());
        if topics.is_empty() {
            BotIdentity::primary(BotFingerprint::from_token(token), connection)
        } else {
            BotIdentity::agent(
                BotFingerprint::from_token(token),
                topics.iter().copied(),
                connection,
            )
        }
    }

    #[test]
    fn fingerprint_is_deterministic_and_ten_chars() {
        let first = BotFingerprint::from_token("test-token");
        let second = BotFingerprint::from_token("test-token");
        let other = BotFingerprint::from_token("other-token");

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.as_str().len(), 10);
        assert!(first.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn registry_holds_one_primary_plus_agents() {
        let mut registry = IdentityRegistry::new();
        registry.register(identity("primary", &[])).unwrap();
        registry.register(identity("agent-1", &[101])).unwrap();
        registry.register(identity("agent-2", &[102, 103])).unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry
                .identities()
                .filter(|identity| identity.is_primary())
                .count(),
            1
        );
    }

    #[test]
    fn second_primary_is_rejected() {
        let mut registry = IdentityRegistry::new();
        registry.register(identity("primary", &[])).unwrap();

        let error = registry.register(identity("another", &[])).unwrap_err();
        assert!(matches!(error, ConfigError::DuplicatePrimary { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_fingerprint_is_rejected() {
        let mut registry = IdentityRegistry::new();
        registry.register(identity("primary", &[])).unwrap();
        registry.register(identity("agent", &[101])).unwrap();

        let error = registry.register(identity("agent", &[102])).unwrap_err();
        assert!(matches!(error, ConfigError::DuplicateFingerprint { .. }));
        assert_eq!(registry.resolve_by_topic(Some(102)).unwrap().role(), BotRole::Primary);
    }

    #[test]
    fn overlapping_topic_binding_is_rejected() {
        let mut registry = IdentityRegistry::new();
        registry.register(identity("agent-1", &[101])).unwrap();

        let error = registry.register(identity("agent-2", &[101])).unwrap_err();
        match error {
            ConfigError::DuplicateTopic { topic_id, existing } => {
                assert_eq!(topic_id, 101);
                assert_eq!(existing, BotFingerprint::from_token("agent-1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn resolve_by_topic_prefers_bound_agent_then_primary() {
        let mut registry = IdentityRegistry::new();
        let primary = registry.register(identity("primary", &[])).unwrap();
        let agent = registry.register(identity("agent", &[101])).unwrap();

        assert_eq!(registry.resolve_by_topic(Some(101)).unwrap().key(), agent.key());
        assert_eq!(registry.resolve_by_topic(Some(999)).unwrap().key(), primary.key());
        assert_eq!(registry.resolve_by_topic(None).unwrap().key(), primary.key());
    }

    #[test]
    fn resolve_by_key_miss_is_none() {
        let mut registry = IdentityRegistry::new();
        registry.register(identity("primary", &[])).unwrap();

        assert!(registry.resolve_by_key(&BotFingerprint::from("missing")).is_none());
    }

    #[test]
    fn confirmation_succeeds_at_most_once() {
        let mut registry = IdentityRegistry::new();
        let primary = registry.register(identity("primary", &[])).unwrap();
        assert!(primary.profile().is_none());
        assert_eq!(primary.snapshot().numeric_id, None);

        let profile = BotProfile {
            user_id: 999,
            username: Some("primary_bot".into()),
            display_name: "Primary".into(),
        };
        assert_eq!(registry.confirm(primary.key(), profile.clone()), Some(true));
        assert_eq!(
            registry.confirm(
                primary.key(),
                BotProfile {
                    user_id: 1,
                    ..profile
                }
            ),
            Some(false)
        );

        assert_eq!(primary.numeric_id(), Some(999));
        assert_eq!(primary.username(), Some("primary_bot"));
        assert_eq!(
            registry.confirm(
                &BotFingerprint::from("missing"),
                BotProfile {
                    user_id: 2,
                    username: None,
                    display_name: "x".into(),
                }
            ),
            None
        );
    }
}
