//! Follow relationships, delivery idempotency keys, and cross-server follower
//! digests (spec §3).

use chrono::{DateTime, Utc};
use url::Url;

/// (follow-id, follower-id, followed-id, accepted, inserted-at).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Follow {
    /// The activity id of the `Follow` that created this row.
    pub id: Url,
    /// The actor doing the following.
    pub follower: Url,
    /// The actor being followed.
    pub followed: Url,
    /// Set once a matching `Accept` is received (or immediately, for inbound
    /// follows of a local actor).
    pub accepted: bool,
    /// When this row was created.
    pub inserted_at: DateTime<Utc>,
}

/// An (activity-id, inbox-url) pair recording a successful delivery,
/// serving as the idempotency key for outbox retries (spec §3).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Delivery {
    /// The delivered activity's id.
    pub activity: Url,
    /// The inbox URL it was POSTed to.
    pub inbox: Url,
}

/// "I know the peer's full view of your followers has this digest" (spec §3, §4.5).
#[derive(Clone, Debug)]
pub struct FollowSync {
    /// The remote actor this digest was received from (or is owed to).
    pub actor: Url,
    /// The partial followers-collection URL scoped to one remote host.
    pub partial_collection_url: Url,
    /// 64 lowercase hex characters: the XOR-of-SHA-256 digest.
    pub digest_hex: String,
    /// When this digest was last recorded.
    pub updated_at: DateTime<Utc>,
    /// When this row was last selected for reconciliation.
    pub last_fetched_at: Option<DateTime<Utc>>,
}
