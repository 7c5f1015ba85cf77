//! A self-contained ActivityPub federation engine: resolver, inbox/outbox
//! pipelines, follower synchronization, and the HTTP Signature/integrity
//! proof machinery that ties them to the wire.
//!
//! Embedding applications implement [`store::Store`] over their own
//! database and wire the pieces from [`config`], [`resolver`], [`inbox`],
//! [`outbox`] and [`sync`] into their own process; [`memory_store`] exists
//! only to ground this crate's own tests.

/// Domain block-list checked before any remote fetch or delivery.
pub mod blocklist;
/// Engine configuration and the `Data<S>` handle threaded through every pipeline.
pub mod config;
/// Error taxonomy shared by every module.
pub mod error;
/// axum wiring and capped-fetch helpers for the engine's HTTP surface.
pub mod http;
/// Inbound activity pipeline: ingress verification and background processing.
pub mod inbox;
/// In-memory [`store::Store`] implementation used by this crate's own tests.
pub mod memory_store;
/// Outbound delivery pipeline: recipient expansion, signing, worker pool.
pub mod outbox;
/// WebFinger-driven actor discovery and caching.
pub mod resolver;
/// HTTP Signatures and Ed25519 integrity proofs.
pub mod signatures;
/// The persistence collaborator every pipeline is generic over.
pub mod store;
/// Follower-collection digest reconciliation.
pub mod sync;
/// Wire-facing data structures: activities, actors, follows.
pub mod types;

pub use config::{Data, EngineConfig};
pub use error::Error;
pub use store::Store;

/// Mime type used for `Accept`/`Content-Type` headers on every federated request.
pub static ACTIVITY_JSON_CONTENT_TYPE: &str = "application/activity+json";
