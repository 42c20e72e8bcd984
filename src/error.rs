//! Top-level error types for Topicbot.

use crate::BotFingerprint;
use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    IdentityConfirmation(#[from] IdentityConfirmationError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    AddressResolution(#[from] AddressResolutionError),

    #[error(transparent)]
    Permission(#[from] PermissionError),

    #[error(transparent)]
    Close(#[from] CloseError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading and identity registration errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error("a primary bot is already registered ({existing})")]
    DuplicatePrimary { existing: BotFingerprint },

    #[error("bot {key} is already registered")]
    DuplicateFingerprint { key: BotFingerprint },

    #[error("topic {topic_id} is already bound to bot {existing}")]
    DuplicateTopic {
        topic_id: i64,
        existing: BotFingerprint,
    },

    #[error("no primary bot registered")]
    MissingPrimary,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A bot's identity lookup failed. Non-fatal: the bot keeps polling and
/// sending, only mention detection is degraded until it succeeds.
#[derive(Debug, thiserror::Error)]
#[error("failed to confirm identity of bot {key}: {message}")]
pub struct IdentityConfirmationError {
    pub key: BotFingerprint,
    pub message: String,
}

/// A poll call failed for one bot. Retried by that bot's loop only.
#[derive(Debug, thiserror::Error)]
#[error("poll failed for bot {key}: {message}")]
pub struct PollError {
    pub key: BotFingerprint,
    pub message: String,
}

/// No connection could be chosen for an outbound operation.
#[derive(Debug, thiserror::Error)]
pub enum AddressResolutionError {
    #[error("no primary bot registered to fall back on")]
    NoPrimary,
}

/// A bot lacks the rights needed for topic-bound operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bot {key} lacks required permissions: {reason}")]
pub struct PermissionError {
    pub key: BotFingerprint,
    pub reason: String,
}

/// One connection's failure to close.
#[derive(Debug, Clone)]
pub struct CloseFailure {
    pub key: BotFingerprint,
    pub message: String,
}

/// Every connection close failure from one shutdown, not just the first.
#[derive(Debug, thiserror::Error)]
#[error("failed to close {} connection(s): {}", .failures.len(), describe_failures(.failures))]
pub struct CloseError {
    pub failures: Vec<CloseFailure>,
}

fn describe_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("{} ({})", failure.key, failure.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Transport lifecycle misuse.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("inbound stream already taken")]
    AlreadyStarted,

    #[error("transport is closed")]
    Closed,
}
