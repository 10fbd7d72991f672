//! Adapter / reconciler stage: polls authoritative sources on a cadence,
//! diffs snapshots against the store, and normalizes raw hook payloads.
//! Both paths publish typed messages for the NQ2DS consumer.

pub mod doctor;
pub mod names;
pub mod normalize;
pub mod reconcile;
pub mod scheduler;

use lazy_static::lazy_static;
use prometheus::IntCounterVec;

lazy_static! {
    pub(crate) static ref PUBLISHED: IntCounterVec = prometheus::register_int_counter_vec!(
        "pnp_adapter_published_total",
        "Typed messages published toward the consumer, by source and kind.",
        &["source", "kind"]
    )
    .unwrap();
    pub(crate) static ref MALFORMED: IntCounterVec = prometheus::register_int_counter_vec!(
        "pnp_adapter_malformed_total",
        "Raw payloads dropped because they could not be normalized, by source.",
        &["source"]
    )
    .unwrap();
}

/// An Adapter fetches the current upstream snapshot for one source. The
/// scheduler owns the cadence and the diffing; adapters only speak to their
/// upstream.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Source name, matching the `source` field of everything it emits.
    fn source(&self) -> &'static str;

    /// Fetch the complete current snapshot. An error aborts this tick
    /// without publishing anything.
    async fn fetch(&self) -> anyhow::Result<Vec<models::IngestMessage>>;
}
