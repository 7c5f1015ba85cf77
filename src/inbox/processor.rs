//! Background batched half of the inbox pipeline (spec §4.3 "Processor loop").

use crate::{
    config::Data,
    inbox::handlers,
    resolver::Resolver,
    store::{InboxRow, Store},
    types::Activity,
};

/// Drains the durable inbox queue on a fixed polling interval, dispatching
/// each row to its per-type handler under a deadline.
pub struct InboxProcessor<S: Store + Clone + Send + Sync + 'static> {
    data: Data<S>,
    resolver: Resolver<S>,
}

impl<S: Store + Clone + Send + Sync + 'static> InboxProcessor<S> {
    /// Builds a processor over `data`, sharing `resolver` with the ingress half.
    pub fn new(data: Data<S>, resolver: Resolver<S>) -> Self {
        Self { data, resolver }
    }

    /// Runs the poll/drain loop forever. Intended to be spawned as its own task.
    pub async fn run(self) {
        loop {
            self.drain().await;
            tokio::time::sleep(self.data.config.activities_polling_interval).await;
        }
    }

    /// Repeatedly reads and processes batches until one comes back short,
    /// i.e. the queue has been caught up to the current moment.
    async fn drain(&self) {
        loop {
            let batch_size = self.data.config.activities_batch_size;
            let queue_len = match self.data.inbox_queue_len().await {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(%err, "failed to read inbox queue length, pausing until next poll");
                    return;
                }
            };

            let cap = self.data.config.max_activities_queue_size;
            let offset = if queue_len > cap { cap / 10 } else { 0 };
            if offset > 0 {
                tracing::warn!(queue_len, cap, offset, "inbox queue over capacity, shedding oldest rows");
            }

            let batch = match self.data.read_inbox_batch(offset, batch_size).await {
                Ok(rows) => rows,
                Err(err) => {
                    tracing::warn!(%err, "failed to read inbox batch, pausing until next poll");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }

            let max_id = batch.iter().map(|row| row.id).max().expect("batch is non-empty");
            let short_batch = (batch.len() as u64) < batch_size;

            for row in &batch {
                self.process_row(row).await;
            }

            if let Err(err) = self.data.delete_inbox_through(max_id).await {
                tracing::error!(%err, max_id, "failed to trim inbox queue after processing batch");
            }

            tokio::time::sleep(self.data.config.activities_batch_delay).await;
            if short_batch {
                return;
            }
        }
    }

    async fn process_row(&self, row: &InboxRow) {
        let activity: Activity = match serde_json::from_value(row.activity.clone()) {
            Ok(activity) => activity,
            Err(err) => {
                tracing::warn!(row_id = row.id, %err, "dropping inbox row with unparseable activity");
                return;
            }
        };

        let deadline = self.data.config.activity_processing_timeout;
        let outcome = tokio::time::timeout(
            deadline,
            handlers::dispatch(&self.data, &self.resolver, &activity, &row.sender),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(row_id = row.id, id = %activity.id, kind = ?activity.kind, %err, "activity handler failed, dropping");
            }
            Err(_) => {
                tracing::warn!(row_id = row.id, id = %activity.id, kind = ?activity.kind, "activity handler timed out, dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::json;
    use url::Url;

    use super::*;
    use crate::{config::EngineConfig, memory_store::MemoryStore, types::Actor};

    fn data(store: MemoryStore) -> Data<MemoryStore> {
        let config = EngineConfig::builder()
            .domain("town.example")
            .store(store)
            .activities_batch_size(2u64)
            .max_activities_queue_size(4u64)
            .activities_batch_delay(Duration::from_millis(1))
            .build()
            .expect("config");
        Data::from(config)
    }

    fn note_create(id: &str, actor: &str) -> serde_json::Value {
        json!({
            "id": format!("https://bazaar.example/activities/{id}"),
            "actor": actor,
            "type": "Create",
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
            "object": {
                "id": format!("https://bazaar.example/notes/{id}"),
                "attributedTo": actor,
            },
        })
    }

    #[tokio::test]
    async fn drains_until_short_batch() {
        let store = MemoryStore::new();
        let actor_url = Url::parse("https://bazaar.example/users/remote").expect("url");
        store
            .upsert_cached_actor(
                Actor {
                    id: actor_url.clone(),
                    preferred_username: "remote".into(),
                    host: "bazaar.example".into(),
                    inbox: Url::parse("https://bazaar.example/users/remote/inbox").expect("url"),
                    shared_inbox: None,
                    followers: None,
                    public_key_id: format!("{actor_url}#main-key"),
                    public_key_pem: String::new(),
                    assertion_method_id: None,
                    assertion_method_key: None,
                    published: Utc::now() - chrono::Duration::days(10),
                    suspended: false,
                    kind: crate::types::ActorType::Person,
                    private_key_pem: None,
                    assertion_private_key: None,
                },
                Utc::now(),
            )
            .await
            .expect("seed actor");

        for i in 0..5 {
            store
                .enqueue_inbox(
                    "/inbox",
                    &actor_url,
                    note_create(&i.to_string(), actor_url.as_str()),
                    Vec::new(),
                    Utc::now(),
                )
                .await
                .expect("enqueue");
        }

        let data = data(store.clone());
        let resolver = Resolver::new(data.clone());
        let processor = InboxProcessor::new(data.clone(), resolver);
        processor.drain().await;

        assert_eq!(data.inbox_queue_len().await.expect("len"), 0);
    }

    #[tokio::test]
    async fn sheds_oldest_rows_over_capacity() {
        let store = MemoryStore::new();
        let actor_url = Url::parse("https://bazaar.example/users/remote").expect("url");
        store
            .upsert_cached_actor(
                Actor {
                    id: actor_url.clone(),
                    preferred_username: "remote".into(),
                    host: "bazaar.example".into(),
                    inbox: Url::parse("https://bazaar.example/users/remote/inbox").expect("url"),
                    shared_inbox: None,
                    followers: None,
                    public_key_id: format!("{actor_url}#main-key"),
                    public_key_pem: String::new(),
                    assertion_method_id: None,
                    assertion_method_key: None,
                    published: Utc::now() - chrono::Duration::days(10),
                    suspended: false,
                    kind: crate::types::ActorType::Person,
                    private_key_pem: None,
                    assertion_private_key: None,
                },
                Utc::now(),
            )
            .await
            .expect("seed actor");

        for i in 0..20 {
            store
                .enqueue_inbox(
                    "/inbox",
                    &actor_url,
                    note_create(&i.to_string(), actor_url.as_str()),
                    Vec::new(),
                    Utc::now(),
                )
                .await
                .expect("enqueue");
        }

        let data = data(store.clone());
        let resolver = Resolver::new(data.clone());
        let processor = InboxProcessor::new(data.clone(), resolver);
        processor.drain().await;

        assert_eq!(data.inbox_queue_len().await.expect("len"), 0);
        assert!(data.note_exists(&Url::parse("https://bazaar.example/notes/19").expect("url")).await.expect("exists"));
    }
}
