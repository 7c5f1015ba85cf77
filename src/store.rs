//! The persistence collaborator.
//!
//! Spec §1 places database schema migrations out of scope, and §6 describes
//! persisted state only "as schema shape, not verbatim". Every pipeline in
//! this crate is therefore generic over a `Store` implementation rather than
//! owning SQL directly -- the same shape as the teacher's `Data<T>`/`T:
//! Clone` app-data pattern, just with an async trait instead of an opaque
//! blob, since the engine itself needs to call specific queries.
//!
//! A real implementation backs this with an ACID store providing row-level
//! atomicity on `ON CONFLICT`/`INSERT OR IGNORE` (spec §5); the in-memory
//! [`MemoryStore`] below exists purely to ground pipeline tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use crate::{
    error::Error,
    types::{Actor, CachedActor, Delivery, Follow, FollowSync},
};

/// A durable inbox queue row (spec §3).
#[derive(Clone, Debug)]
pub struct InboxRow {
    /// Monotonic sequence id, used to bound a batch and for final cleanup.
    pub id: i64,
    /// The path the activity was POSTed to (`/inbox/{name}` or `/inbox`).
    pub path: String,
    /// The sending actor's id, as claimed before verification.
    pub sender: Url,
    /// Parsed activity JSON.
    pub activity: Value,
    /// Raw request body bytes, kept for signature re-verification/audit.
    pub raw: Vec<u8>,
    /// When this row was inserted.
    pub inserted_at: DateTime<Utc>,
}

/// Local-user and local-post totals the NodeInfo boundary collaborator reads
/// (spec §1 Non-goals: response bodies are out of scope, only this typed
/// counter surface is; spec §5 "NodeInfo counters: guarded by a mutex with a
/// TTL cache").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageCounters {
    /// Number of local actors provisioned on this instance.
    pub total_users: u64,
    /// Number of notes authored by a local actor.
    pub local_posts: u64,
}

/// A durable outbox queue row (spec §3).
#[derive(Clone, Debug)]
pub struct OutboxRow {
    /// Row identity, stable across attempts.
    pub id: i64,
    /// The activity to deliver.
    pub activity: Value,
    /// The local actor who authored it.
    pub sender: Url,
    /// When this row was inserted.
    pub inserted_at: DateTime<Utc>,
    /// Whether every required inbox has acknowledged delivery.
    pub sent: bool,
    /// Number of delivery attempts made so far.
    pub attempts: u32,
    /// Timestamp of the most recent attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// The persistence surface the engine depends on.
///
/// Method names follow the table they operate on (spec §6): `persons`,
/// `notes`, `follows`, `inbox`, `outbox`, `deliveries`, `follows_sync`.
/// Mutations on `notes`/`deliveries` are specified idempotent on missing
/// rows so a concurrently running external TTL sweeper (the "Deleter",
/// spec §9) cannot desynchronize the engine.
#[async_trait]
pub trait Store: Send + Sync {
    // -- persons / actor cache (resolver, spec §4.1) --

    /// Reads a cached actor by id, regardless of freshness.
    async fn get_cached_actor(&self, id: &Url) -> Result<Option<CachedActor>, Error>;

    /// Reads a local actor by username. Used when `host` is the local domain.
    async fn get_local_actor(&self, name: &str) -> Result<Option<Actor>, Error>;

    /// Reads a cached actor by its `preferredUsername`/host pair, used to
    /// short-circuit webfinger for a peer already known (spec §4.1 step 4).
    async fn get_cached_actor_by_acct(&self, name: &str, host: &str) -> Result<Option<CachedActor>, Error>;

    /// Upserts a fetched actor document, refreshing `updated_at`/`fetched_at`.
    async fn upsert_cached_actor(&self, actor: Actor, now: DateTime<Utc>) -> Result<(), Error>;

    /// Records a failed fetch attempt without changing the cached document.
    async fn record_fetch_failure(&self, id: &Url, now: DateTime<Utc>) -> Result<(), Error>;

    /// Deletes the cached actor and cascades to notes/shares/bookmarks/follows
    /// authored by or referencing it (spec §3, §4.1 "gone handling").
    async fn delete_actor_cascade(&self, id: &Url) -> Result<(), Error>;

    // -- notes --

    /// True if a note with this id already exists (Create dedup, spec §4.3).
    async fn note_exists(&self, id: &Url) -> Result<bool, Error>;

    /// Inserts a new note.
    async fn insert_note(&self, id: &Url, author: &Url, object: Value, public: bool) -> Result<(), Error>;

    /// Reads a note's author and `updated` timestamp, if it exists locally.
    async fn get_note_meta(&self, id: &Url) -> Result<Option<(Url, Option<DateTime<Utc>>)>, Error>;

    /// Overwrites a note's object body and `updated` timestamp.
    async fn update_note(&self, id: &Url, object: Value, updated: DateTime<Utc>) -> Result<(), Error>;

    /// Deletes a note by id. Idempotent: returns `Ok(())` if missing.
    async fn delete_note(&self, id: &Url) -> Result<(), Error>;

    // -- follows --

    /// Inserts a follow row, idempotent on `(follower, followed)`.
    async fn insert_follow(&self, follow: Follow) -> Result<(), Error>;

    /// Marks the follow matching `follow_id` (and, defensively, `follower`) as accepted.
    async fn accept_follow(&self, follow_id: &Url, follower: &Url) -> Result<(), Error>;

    /// Reads a follow row by its originating activity id, regardless of
    /// whether it's since been accepted (inbound `Accept` handling, spec
    /// §4.3, which may reference it by bare id rather than an embedded
    /// `Follow`).
    async fn get_follow_by_id(&self, follow_id: &Url) -> Result<Option<Follow>, Error>;

    /// Deletes the follow matching `follow_id` and `follower` (Undo handling, spec §4.3).
    async fn delete_follow(&self, follow_id: &Url, follower: &Url) -> Result<(), Error>;

    /// Deletes the follow matching `(follower, followed)` regardless of its
    /// originating activity id (follower-sync reconciliation, spec §4.5,
    /// which only ever learns the pair, never the original `Follow`'s id).
    async fn delete_follow_by_pair(&self, follower: &Url, followed: &Url) -> Result<(), Error>;

    /// Lists accepted followers of `actor` whose id host equals `host`, excluding local followers.
    async fn followers_on_host(&self, actor: &Url, host: &str, local_domain: &str) -> Result<Vec<Url>, Error>;

    /// Lists all accepted followers of `actor` (used for shared-inbox expansion).
    async fn all_followers(&self, actor: &Url) -> Result<Vec<Url>, Error>;

    // -- inbox queue (spec §4.3) --

    /// Idempotent insert keyed on `(path, activity id)`. Returns `true` if a row was inserted.
    async fn enqueue_inbox(&self, path: &str, sender: &Url, activity: Value, raw: Vec<u8>, now: DateTime<Utc>) -> Result<bool, Error>;

    /// Reads up to `limit` rows starting at `offset`, in insertion order.
    async fn read_inbox_batch(&self, offset: u64, limit: u64) -> Result<Vec<InboxRow>, Error>;

    /// Total number of queued inbox rows (for the overflow-shedding check, spec §4.3 step 2).
    async fn inbox_queue_len(&self) -> Result<u64, Error>;

    /// Deletes all inbox rows with id <= `max_id`.
    async fn delete_inbox_through(&self, max_id: i64) -> Result<(), Error>;

    // -- outbox queue (spec §4.4) --

    /// Enqueues a new outgoing activity.
    async fn enqueue_outbox(&self, sender: &Url, activity: Value, now: DateTime<Utc>) -> Result<i64, Error>;

    /// Selects due rows: `sent = false` and either never attempted, or eligible for retry.
    async fn due_outbox_rows(&self, limit: u64, retry_after: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<OutboxRow>, Error>;

    /// Atomically bumps `attempts` and `last_attempt_at` before any network work.
    async fn bump_outbox_attempt(&self, id: i64, now: DateTime<Utc>) -> Result<(), Error>;

    /// Marks a row `sent = true`.
    async fn mark_outbox_sent(&self, id: i64) -> Result<(), Error>;

    // -- deliveries (idempotency, spec §3/§4.4) --

    /// True if `(activity, inbox)` has already been recorded as delivered.
    async fn delivery_exists(&self, activity: &Url, inbox: &Url) -> Result<bool, Error>;

    /// Records a successful delivery. Idempotent.
    async fn insert_delivery(&self, delivery: Delivery) -> Result<(), Error>;

    // -- follows_sync (spec §4.5) --

    /// Upserts the peer-advertised digest for `actor`.
    async fn upsert_follow_sync(&self, sync: FollowSync) -> Result<(), Error>;

    /// Selects rows not fetched within `retry_after`, up to `limit`.
    async fn due_follow_syncs(&self, limit: u64, retry_after: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<FollowSync>, Error>;

    /// Marks a row as just having been reconciled.
    async fn touch_follow_sync(&self, actor: &Url, now: DateTime<Utc>) -> Result<(), Error>;

    // -- usage counters (NodeInfo boundary, spec §5/§6) --

    /// Local-user and local-post totals fed to the NodeInfo boundary collaborator.
    async fn usage_counters(&self) -> Result<UsageCounters, Error>;
}
