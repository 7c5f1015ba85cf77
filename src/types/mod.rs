//! Data structures which model the engine's federated documents.
//!
//! These mirror the wire shapes inspected by the engine (spec §3), not the
//! full ActivityStreams vocabulary -- the front-end's nanoblogging domain
//! rules and most object fields are opaque `serde_json::Value` payloads that
//! pass through untouched.

mod activity;
pub(crate) mod actor;
mod follow;
pub mod keys;

pub use activity::{Activity, ActivityObject, ActivityType, PUBLIC_ADDRESS};
pub use actor::{Actor, ActorType, CachedActor};
pub use follow::{Delivery, Follow, FollowSync};
pub use keys::Keypair;
