//! Outbound delivery pipeline: recipient expansion, signing, and the
//! sharded worker pool (spec §4.4).

pub mod pipeline;
pub mod recipients;
pub mod worker;

pub use pipeline::OutboxPipeline;
pub use recipients::Recipient;
