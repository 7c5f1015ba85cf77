//! Sharded delivery worker pool (spec §4.4 "Worker loop", §5, §9).
//!
//! Per-inbox hashing (CRC32 of the inbox URL mod worker count) is a
//! correctness property, not a heuristic: it keeps per-(activity,inbox)
//! handling on exactly one worker so deduplication needs no cross-worker
//! locks. Do not replace with round-robin.

use std::{collections::HashSet, time::Duration};

use tokio::sync::mpsc;
use url::Url;

use crate::{config::Data, error::Error, store::Store, types::Delivery};

/// One POST to perform, already built and signed.
pub struct DeliveryTask {
    /// The outbox row this delivery belongs to, for attributing failures.
    pub row_id: i64,
    /// The delivered activity's id, used as half of the idempotency key.
    pub activity_id: Url,
    /// The destination inbox.
    pub inbox: Url,
    /// The pre-built, pre-signed request.
    pub request: reqwest::Request,
}

/// A worker's report of one non-benign delivery failure.
pub struct DeliveryFailure {
    /// The owning outbox row.
    pub row_id: i64,
    /// Why the delivery failed.
    pub error: Error,
}

/// Hashes `inbox` with CRC32 into `[0, worker_count)`.
pub fn worker_index(inbox: &Url, worker_count: usize) -> usize {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(inbox.as_str().as_bytes());
    (hasher.finalize() as usize) % worker_count.max(1)
}

/// Runs one worker to completion: drains `rx` until the producer closes it,
/// reporting non-benign failures on `events`.
pub async fn run_worker<S: Store + Clone + Send + Sync + 'static>(
    data: Data<S>,
    mut rx: mpsc::Receiver<DeliveryTask>,
    events: mpsc::Sender<DeliveryFailure>,
    delivery_timeout: Duration,
) {
    let mut seen = HashSet::new();
    while let Some(task) = rx.recv().await {
        let key = (task.activity_id.clone(), task.inbox.clone());
        if !seen.insert(key) {
            continue;
        }
        if let Err((row_id, error)) = deliver(&data, task, delivery_timeout).await {
            if error.is_benign_delivery_failure() {
                tracing::debug!(row_id, %error, "benign delivery failure, not flipping job");
            } else if events.send(DeliveryFailure { row_id, error }).await.is_err() {
                tracing::warn!(row_id, "events channel closed before failure could be reported");
            }
        }
    }
}

async fn deliver<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    task: DeliveryTask,
    delivery_timeout: Duration,
) -> Result<(), (i64, Error)> {
    let DeliveryTask { row_id, activity_id, inbox, request } = task;
    attempt(data, &activity_id, &inbox, request, delivery_timeout)
        .await
        .map_err(|err| (row_id, err))
}

async fn attempt<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    activity_id: &Url,
    inbox: &Url,
    request: reqwest::Request,
    delivery_timeout: Duration,
) -> Result<(), Error> {
    if data.delivery_exists(activity_id, inbox).await? {
        return Ok(());
    }

    let response = tokio::time::timeout(delivery_timeout, data.config.client.execute(request))
        .await
        .map_err(|_| Error::Timeout)??;

    let status = response.status();
    if status.as_u16() == 404 || status.as_u16() == 410 {
        return Err(Error::ActorGone(inbox.clone()));
    }
    if !status.is_success() {
        return Err(Error::Other(format!("delivery to {inbox} failed with status {status}")));
    }

    data.insert_delivery(Delivery {
        activity: activity_id.clone(),
        inbox: inbox.clone(),
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_index_is_deterministic() {
        let inbox = Url::parse("https://town.example/users/alice/inbox").expect("url");
        let first = worker_index(&inbox, 4);
        let second = worker_index(&inbox, 4);
        assert_eq!(first, second);
        assert!(first < 4);
    }

    #[test]
    fn worker_index_spreads_across_distinct_inboxes() {
        let worker_count = 4;
        let inboxes: Vec<Url> = (0..16)
            .map(|i| Url::parse(&format!("https://host{i}.example/inbox")).expect("url"))
            .collect();
        let indices: HashSet<usize> = inboxes.iter().map(|inbox| worker_index(inbox, worker_count)).collect();
        assert!(indices.len() > 1, "16 distinct inboxes should not all hash to one worker");
    }

    async fn spawn_echo_server() -> Url {
        use axum::{routing::post, Router};

        let app = Router::new().route("/inbox", post(|| async { http::StatusCode::ACCEPTED }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        Url::parse(&format!("http://{addr}/inbox")).expect("url")
    }

    fn data() -> Data<crate::memory_store::MemoryStore> {
        crate::config::EngineConfig::builder()
            .domain("town.example")
            .store(crate::memory_store::MemoryStore::new())
            .build()
            .expect("config")
            .into()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deliver_records_a_successful_delivery() {
        let inbox = spawn_echo_server().await;
        let activity_id = Url::parse("https://town.example/activities/1").expect("url");
        let data = data();
        let request = data.config.client.post(inbox.clone()).build().expect("request");

        attempt(&data, &activity_id, &inbox, request, Duration::from_secs(5))
            .await
            .expect("delivery succeeds");

        assert!(data.delivery_exists(&activity_id, &inbox).await.expect("query"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deliver_is_idempotent_on_existing_delivery() {
        let inbox = Url::parse("https://town.example/users/alice/inbox").expect("url");
        let activity_id = Url::parse("https://town.example/activities/2").expect("url");
        let data = data();
        data.insert_delivery(Delivery {
            activity: activity_id.clone(),
            inbox: inbox.clone(),
        })
        .await
        .expect("insert");

        let request = data.config.client.post(inbox.clone()).build().expect("request");
        attempt(&data, &activity_id, &inbox, request, Duration::from_secs(5))
            .await
            .expect("already-delivered short circuit does not hit the network");
    }
}
