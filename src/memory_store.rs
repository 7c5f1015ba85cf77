//! An in-memory [`Store`] implementation used to ground pipeline tests
//! without a real database, following the teacher's `examples/*/instance.rs`
//! pattern of a `Mutex`-guarded in-process "database".

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use crate::{
    error::Error,
    store::{InboxRow, OutboxRow, Store},
    types::{Actor, CachedActor, Delivery, Follow, FollowSync},
};

#[derive(Default)]
struct State {
    actors: HashMap<Url, CachedActor>,
    local_actors: HashMap<String, Actor>,
    notes: HashMap<Url, (Url, Value, bool, Option<DateTime<Utc>>)>,
    follows: Vec<Follow>,
    inbox: Vec<InboxRow>,
    next_inbox_id: i64,
    outbox: Vec<OutboxRow>,
    next_outbox_id: i64,
    deliveries: Vec<Delivery>,
    follow_syncs: HashMap<Url, FollowSync>,
}

/// An in-memory, `Mutex`-guarded store for tests.
///
/// Wraps its state in an `Arc` so the store itself stays cheap to `Clone`,
/// matching the `S: Store + Clone` bound every pipeline is generic over.
#[derive(Default, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store mutex poisoned")
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_cached_actor(&self, id: &Url) -> Result<Option<CachedActor>, Error> {
        Ok(self.lock().actors.get(id).cloned())
    }

    async fn get_local_actor(&self, name: &str) -> Result<Option<Actor>, Error> {
        Ok(self.lock().local_actors.get(name).cloned())
    }

    async fn get_cached_actor_by_acct(&self, name: &str, host: &str) -> Result<Option<CachedActor>, Error> {
        let state = self.lock();
        Ok(state
            .actors
            .values()
            .find(|cached| cached.actor.preferred_username == name && cached.actor.host == host)
            .cloned())
    }

    async fn upsert_cached_actor(&self, actor: Actor, now: DateTime<Utc>) -> Result<(), Error> {
        let mut state = self.lock();
        let entry = state
            .actors
            .entry(actor.id.clone())
            .or_insert_with(|| CachedActor {
                actor: actor.clone(),
                inserted_at: now,
                updated_at: now,
                fetched_at: now,
                last_fetch_failed_at: None,
            });
        entry.actor = actor;
        entry.updated_at = now;
        entry.fetched_at = now;
        entry.last_fetch_failed_at = None;
        Ok(())
    }

    async fn record_fetch_failure(&self, id: &Url, now: DateTime<Utc>) -> Result<(), Error> {
        let mut state = self.lock();
        if let Some(entry) = state.actors.get_mut(id) {
            entry.fetched_at = now;
            entry.last_fetch_failed_at = Some(now);
        }
        Ok(())
    }

    async fn delete_actor_cascade(&self, id: &Url) -> Result<(), Error> {
        let mut state = self.lock();
        state.actors.remove(id);
        state.notes.retain(|_, (author, ..)| author != id);
        state.follows.retain(|f| &f.follower != id && &f.followed != id);
        Ok(())
    }

    async fn note_exists(&self, id: &Url) -> Result<bool, Error> {
        Ok(self.lock().notes.contains_key(id))
    }

    async fn insert_note(&self, id: &Url, author: &Url, object: Value, public: bool) -> Result<(), Error> {
        self.lock()
            .notes
            .insert(id.clone(), (author.clone(), object, public, None));
        Ok(())
    }

    async fn get_note_meta(&self, id: &Url) -> Result<Option<(Url, Option<DateTime<Utc>>)>, Error> {
        Ok(self
            .lock()
            .notes
            .get(id)
            .map(|(author, _, _, updated)| (author.clone(), *updated)))
    }

    async fn update_note(&self, id: &Url, object: Value, updated: DateTime<Utc>) -> Result<(), Error> {
        if let Some(entry) = self.lock().notes.get_mut(id) {
            entry.1 = object;
            entry.3 = Some(updated);
        }
        Ok(())
    }

    async fn delete_note(&self, id: &Url) -> Result<(), Error> {
        self.lock().notes.remove(id);
        Ok(())
    }

    async fn insert_follow(&self, follow: Follow) -> Result<(), Error> {
        let mut state = self.lock();
        let exists = state
            .follows
            .iter()
            .any(|f| f.follower == follow.follower && f.followed == follow.followed);
        if !exists {
            state.follows.push(follow);
        }
        Ok(())
    }

    async fn accept_follow(&self, follow_id: &Url, follower: &Url) -> Result<(), Error> {
        let mut state = self.lock();
        for f in state.follows.iter_mut() {
            if &f.id == follow_id && &f.follower == follower {
                f.accepted = true;
            }
        }
        Ok(())
    }

    async fn get_follow_by_id(&self, follow_id: &Url) -> Result<Option<Follow>, Error> {
        Ok(self.lock().follows.iter().find(|f| &f.id == follow_id).cloned())
    }

    async fn delete_follow(&self, follow_id: &Url, follower: &Url) -> Result<(), Error> {
        self.lock()
            .follows
            .retain(|f| !(&f.id == follow_id && &f.follower == follower));
        Ok(())
    }

    async fn delete_follow_by_pair(&self, follower: &Url, followed: &Url) -> Result<(), Error> {
        self.lock()
            .follows
            .retain(|f| !(&f.follower == follower && &f.followed == followed));
        Ok(())
    }

    async fn followers_on_host(&self, actor: &Url, host: &str, local_domain: &str) -> Result<Vec<Url>, Error> {
        let state = self.lock();
        Ok(state
            .follows
            .iter()
            .filter(|f| &f.followed == actor && f.accepted)
            .map(|f| f.follower.clone())
            .filter(|follower| follower.host_str() != Some(local_domain))
            .filter(|follower| follower.host_str() == Some(host))
            .collect())
    }

    async fn all_followers(&self, actor: &Url) -> Result<Vec<Url>, Error> {
        let state = self.lock();
        Ok(state
            .follows
            .iter()
            .filter(|f| &f.followed == actor && f.accepted)
            .map(|f| f.follower.clone())
            .collect())
    }

    async fn enqueue_inbox(&self, path: &str, sender: &Url, activity: Value, raw: Vec<u8>, now: DateTime<Utc>) -> Result<bool, Error> {
        let mut state = self.lock();
        let activity_id = activity.get("id").and_then(Value::as_str).map(str::to_owned);
        let duplicate = state.inbox.iter().any(|row| {
            row.path == path && row.activity.get("id").and_then(Value::as_str).map(str::to_owned) == activity_id
        });
        if duplicate {
            return Ok(false);
        }
        state.next_inbox_id += 1;
        let id = state.next_inbox_id;
        state.inbox.push(InboxRow {
            id,
            path: path.to_string(),
            sender: sender.clone(),
            activity,
            raw,
            inserted_at: now,
        });
        Ok(true)
    }

    async fn read_inbox_batch(&self, offset: u64, limit: u64) -> Result<Vec<InboxRow>, Error> {
        let state = self.lock();
        Ok(state
            .inbox
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn inbox_queue_len(&self) -> Result<u64, Error> {
        Ok(self.lock().inbox.len() as u64)
    }

    async fn delete_inbox_through(&self, max_id: i64) -> Result<(), Error> {
        self.lock().inbox.retain(|row| row.id > max_id);
        Ok(())
    }

    async fn enqueue_outbox(&self, sender: &Url, activity: Value, now: DateTime<Utc>) -> Result<i64, Error> {
        let mut state = self.lock();
        state.next_outbox_id += 1;
        let id = state.next_outbox_id;
        state.outbox.push(OutboxRow {
            id,
            activity,
            sender: sender.clone(),
            inserted_at: now,
            sent: false,
            attempts: 0,
            last_attempt_at: None,
        });
        Ok(id)
    }

    async fn due_outbox_rows(&self, limit: u64, retry_after: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<OutboxRow>, Error> {
        let state = self.lock();
        let mut rows: Vec<OutboxRow> = state
            .outbox
            .iter()
            .filter(|row| !row.sent)
            .filter(|row| {
                row.attempts == 0
                    || row
                        .last_attempt_at
                        .map(|last| now - last >= retry_after)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.attempts
                .cmp(&b.attempts)
                .then(a.last_attempt_at.cmp(&b.last_attempt_at))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn bump_outbox_attempt(&self, id: i64, now: DateTime<Utc>) -> Result<(), Error> {
        let mut state = self.lock();
        if let Some(row) = state.outbox.iter_mut().find(|row| row.id == id) {
            row.attempts += 1;
            row.last_attempt_at = Some(now);
        }
        Ok(())
    }

    async fn mark_outbox_sent(&self, id: i64) -> Result<(), Error> {
        let mut state = self.lock();
        if let Some(row) = state.outbox.iter_mut().find(|row| row.id == id) {
            row.sent = true;
        }
        Ok(())
    }

    async fn delivery_exists(&self, activity: &Url, inbox: &Url) -> Result<bool, Error> {
        Ok(self
            .lock()
            .deliveries
            .iter()
            .any(|d| &d.activity == activity && &d.inbox == inbox))
    }

    async fn insert_delivery(&self, delivery: Delivery) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.deliveries.contains(&delivery) {
            state.deliveries.push(delivery);
        }
        Ok(())
    }

    async fn upsert_follow_sync(&self, sync: FollowSync) -> Result<(), Error> {
        self.lock().follow_syncs.insert(sync.actor.clone(), sync);
        Ok(())
    }

    async fn due_follow_syncs(&self, limit: u64, retry_after: chrono::Duration, now: DateTime<Utc>) -> Result<Vec<FollowSync>, Error> {
        let state = self.lock();
        let mut rows: Vec<FollowSync> = state
            .follow_syncs
            .values()
            .filter(|sync| {
                sync.last_fetched_at
                    .map(|last| now - last >= retry_after)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn touch_follow_sync(&self, actor: &Url, now: DateTime<Utc>) -> Result<(), Error> {
        let mut state = self.lock();
        if let Some(sync) = state.follow_syncs.get_mut(actor) {
            sync.last_fetched_at = Some(now);
        }
        Ok(())
    }

    async fn usage_counters(&self) -> Result<crate::store::UsageCounters, Error> {
        let state = self.lock();
        let total_users = state.local_actors.len() as u64;
        let local_posts = state
            .notes
            .values()
            .filter(|(author, ..)| state.local_actors.values().any(|local| &local.id == author))
            .count() as u64;
        Ok(crate::store::UsageCounters { total_users, local_posts })
    }
}

impl MemoryStore {
    /// Test helper: registers a local actor.
    pub fn put_local_actor(&self, actor: Actor) {
        self.lock().local_actors.insert(actor.preferred_username.clone(), actor);
    }
}
