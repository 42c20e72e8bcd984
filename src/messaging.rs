//! Multi-bot messaging: identities, fan-in polling, routing and the transport facade.

pub mod dedup;
pub mod identity;
pub mod poller;
pub mod resolver;
pub mod sent_index;
pub mod telegram;
#[cfg(test)]
pub(crate) mod testing;
pub mod traits;
pub mod transport;

pub use identity::{BotFingerprint, BotIdentity, BotRole, IdentityRegistry};
pub use traits::{BotConnection, BotConnectionDyn};
pub use transport::TopicTransport;
