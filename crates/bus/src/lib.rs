//! RabbitMQ transport for the pipeline: sealed payloads, topic routing over
//! a direct exchange, primary/fallback endpoints, and reconnecting
//! consumers. Delivery is at-least-once; handlers must be idempotent.

mod config;
mod consume;
mod publish;
mod retry;

pub use config::BusArgs;
pub use consume::{Consumer, Outcome};
pub use publish::Publisher;
pub use retry::RetryPolicy;

/// Routing keys. The exchange is direct, so the routing key is the topic.
pub mod topic {
    pub const INCIDENT: &str = "incident";
    pub const MAINTENANCE: &str = "maintenance";
    pub const CASE: &str = "case";
    pub const CHANGE: &str = "change";
    pub const ANNOUNCEMENT: &str = "announcement";
    /// Downstream fan-out events emitted by the NQ2DS consumer.
    pub const NOTIFICATION: &str = "notification";
    /// Health probes; never consumed by the pipeline proper.
    pub const PROBE: &str = "pnp.probe";
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to seal message payload")]
    Seal(#[source] envelope::Error),
    #[error("failed to open message payload")]
    Open(#[source] envelope::Error),
    #[error(transparent)]
    Transport(#[from] lapin::Error),
    #[error("broker negatively confirmed the publish")]
    Unconfirmed,
}

impl Error {
    /// Transport errors are retried against the fallback endpoint; payload
    /// errors are surfaced immediately.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Unconfirmed)
    }
}
