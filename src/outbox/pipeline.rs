//! Batch scan, recipient expansion, request building and worker dispatch
//! (spec §4.4 `ProcessBatch`/`Process`).

use std::collections::HashSet;

use chrono::Utc;
use tokio::sync::mpsc;
use url::Url;

use crate::{
    config::Data,
    error::Error,
    outbox::{
        recipients,
        worker::{run_worker, worker_index, DeliveryFailure, DeliveryTask},
    },
    resolver::{ResolveFlags, Resolver},
    signatures::{base_headers, sign_proof, sign_request},
    store::{OutboxRow, Store},
    sync,
    types::{keys::parse_private_key, Activity},
};

/// Scans the outbox and drives one or more delivery rounds (spec §4.4 `Process`).
pub struct OutboxPipeline<S: Store + Clone + Send + Sync + 'static> {
    data: Data<S>,
    resolver: Resolver<S>,
}

impl<S: Store + Clone + Send + Sync + 'static> OutboxPipeline<S> {
    /// Builds a pipeline over `data`, sharing `resolver` with the rest of the engine.
    pub fn new(data: Data<S>, resolver: Resolver<S>) -> Self {
        Self { data, resolver }
    }

    /// Runs the poll loop forever. Intended to be spawned as its own task.
    pub async fn run(self) {
        loop {
            if let Err(err) = self.process_batch().await {
                tracing::warn!(%err, "outbox batch failed");
            }
            tokio::time::sleep(self.data.config.outbox_polling_interval).await;
        }
    }

    /// Runs the poll loop until `shutdown` fires, then returns once the
    /// in-flight batch (if any) has finished -- `process_batch` already joins
    /// every delivery worker before returning, so no deliveries are left
    /// dangling, mirroring the teacher's `ActivityQueue::shutdown` (drop the
    /// senders, await the worker handles).
    pub async fn run_until_shutdown(self, mut shutdown: tokio::sync::oneshot::Receiver<()>) {
        loop {
            if let Err(err) = self.process_batch().await {
                tracing::warn!(%err, "outbox batch failed");
            }
            tokio::select! {
                () = tokio::time::sleep(self.data.config.outbox_polling_interval) => {}
                _ = &mut shutdown => return,
            }
        }
    }

    /// Selects due rows, expands and delivers them, and marks survivors sent.
    /// Returns the number of rows read, for callers that want to keep
    /// looping until a short batch signals the queue is caught up.
    pub async fn process_batch(&self) -> Result<u64, Error> {
        let rows = self
            .data
            .due_outbox_rows(
                self.data.config.delivery_batch_size,
                self.data.config.delivery_retry_interval,
                Utc::now(),
            )
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        for row in &rows {
            self.data.bump_outbox_attempt(row.id, now).await?;
        }

        let worker_count = self.data.config.delivery_workers.max(1);
        let buffer = self.data.config.delivery_worker_buffer.max(1);
        let (events_tx, mut events_rx) = mpsc::channel::<DeliveryFailure>(worker_count * buffer);

        let mut senders = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel::<DeliveryTask>(buffer);
            senders.push(tx);
            let worker_data = self.data.clone();
            let worker_events = events_tx.clone();
            let timeout = self.data.config.delivery_timeout;
            handles.push(tokio::spawn(run_worker(worker_data, rx, worker_events, timeout)));
        }
        drop(events_tx);

        for row in &rows {
            match self.build_tasks(row).await {
                Ok(tasks) => {
                    for task in tasks {
                        let idx = worker_index(&task.inbox, worker_count);
                        if senders[idx].send(task).await.is_err() {
                            tracing::warn!(row_id = row.id, "delivery worker channel closed early");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(row_id = row.id, %err, "recipient expansion failed, will retry next cycle");
                }
            }
        }
        drop(senders);

        for handle in handles {
            let _ = handle.await;
        }

        let mut failed: HashSet<i64> = HashSet::new();
        while let Some(failure) = events_rx.recv().await {
            tracing::warn!(row_id = failure.row_id, error = %failure.error, "delivery failed");
            failed.insert(failure.row_id);
        }

        for row in &rows {
            if !failed.contains(&row.id) {
                self.data.mark_outbox_sent(row.id).await?;
            }
        }

        Ok(rows.len() as u64)
    }

    async fn build_tasks(&self, row: &OutboxRow) -> Result<Vec<DeliveryTask>, Error> {
        let activity: Activity = serde_json::from_value(row.activity.clone()).map_err(Error::Malformed)?;
        let recipient_list = recipients::expand(&self.data, &self.resolver, &activity, &row.sender).await?;
        if recipient_list.is_empty() {
            return Ok(Vec::new());
        }

        let sender_actor = self.resolver.resolve_id(&row.sender, ResolveFlags::offline()).await?;
        let private_key_pem = sender_actor
            .private_key_pem
            .as_deref()
            .ok_or_else(|| Error::Key(format!("local actor {} is missing a private key", row.sender)))?;

        let is_forward = activity.actor != row.sender;
        let mut body = row.activity.clone();
        if !is_forward && !self.data.config.disable_integrity_proofs {
            if let (Some(method_id), Some(assertion_key)) =
                (&sender_actor.assertion_method_id, &sender_actor.assertion_private_key)
            {
                let proof = sign_proof(&body, assertion_key, method_id)?;
                body["proof"] = proof;
            }
        }
        let body_bytes = serde_json::to_vec(&body).map_err(Error::Malformed)?;
        let private_key = parse_private_key(private_key_pem)?;

        let mut tasks = Vec::with_capacity(recipient_list.len());
        for recipient in recipient_list {
            let headers = base_headers(&recipient.inbox, "application/activity+json");
            let mut builder = self.data.config.client.post(recipient.inbox.clone());
            for (name, value) in headers.iter() {
                builder = builder.header(name.clone(), value.clone());
            }
            if recipient.wide_delivery {
                if let Some(followers_url) = &sender_actor.followers {
                    let digest = self.followers_digest(&row.sender, &recipient.inbox).await?;
                    let partial_url = partial_collection_url(followers_url, &recipient.inbox);
                    let header = sync::header_value(followers_url, &partial_url, &digest);
                    builder = builder.header("collection-synchronization", header);
                }
            }

            let request = sign_request(
                builder,
                &sender_actor.public_key_id,
                bytes::Bytes::from(body_bytes.clone()),
                private_key.clone(),
                self.data.config.http_signature_compat,
            )
            .await?;

            tasks.push(DeliveryTask {
                row_id: row.id,
                activity_id: activity.id.clone(),
                inbox: recipient.inbox,
                request,
            });
        }
        Ok(tasks)
    }

    async fn followers_digest(&self, sender: &Url, inbox: &Url) -> Result<String, Error> {
        let host = inbox.host_str().unwrap_or_default();
        let followers = self.data.followers_on_host(sender, host, &self.data.config.domain).await?;
        Ok(sync::xor_digest(followers.iter()))
    }
}

fn partial_collection_url(followers_url: &Url, inbox: &Url) -> Url {
    let mut url = followers_url.clone();
    url.query_pairs_mut().append_pair("host", inbox.host_str().unwrap_or_default());
    url
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{config::EngineConfig, memory_store::MemoryStore, resolver::Resolver};

    fn data() -> Data<MemoryStore> {
        EngineConfig::builder()
            .domain("town.example")
            .store(MemoryStore::new())
            .outbox_polling_interval(Duration::from_millis(5))
            .build()
            .expect("config")
            .into()
    }

    #[tokio::test]
    async fn process_batch_is_a_noop_on_an_empty_queue() {
        let data = data();
        let resolver = Resolver::new(data.clone());
        let pipeline = OutboxPipeline::new(data, resolver);
        assert_eq!(pipeline.process_batch().await.expect("batch"), 0);
    }

    #[tokio::test]
    async fn run_until_shutdown_returns_once_signalled() {
        let data = data();
        let resolver = Resolver::new(data.clone());
        let pipeline = OutboxPipeline::new(data, resolver);
        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = tokio::spawn(pipeline.run_until_shutdown(rx));

        tx.send(()).expect("receiver still alive");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop exits promptly after shutdown fires")
            .expect("task did not panic");
    }
}
