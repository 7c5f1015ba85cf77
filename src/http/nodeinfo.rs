//! TTL-cached boundary for NodeInfo's `usage` counters (spec §1 Non-goals,
//! §5, §6). The engine does not build the NodeInfo document itself -- that's
//! an external collaborator's job -- but that collaborator needs a cheap
//! read of local-user/local-post totals without hitting the store on every
//! discovery request.

use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::{config::Data, error::Error, store::{Store, UsageCounters}};

/// Caches [`UsageCounters`] behind a mutex with a TTL, matching spec §5's
/// "NodeInfo counters: guarded by a mutex with a TTL cache".
pub struct NodeInfoUsageSource<S: Store + Clone + Send + Sync + 'static> {
    data: Data<S>,
    ttl: Duration,
    cached: Mutex<Option<(Instant, UsageCounters)>>,
}

impl<S: Store + Clone + Send + Sync + 'static> NodeInfoUsageSource<S> {
    /// Builds a source over `data`, refreshing at most once per `ttl`.
    pub fn new(data: Data<S>, ttl: Duration) -> Self {
        Self {
            data,
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Returns the cached counters, querying the store if the TTL elapsed.
    pub async fn usage(&self) -> Result<UsageCounters, Error> {
        let mut guard = self.cached.lock().await;
        if let Some((fetched_at, counters)) = *guard {
            if fetched_at.elapsed() < self.ttl {
                return Ok(counters);
            }
        }
        let counters = self.data.usage_counters().await?;
        *guard = Some((Instant::now(), counters));
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use url::Url;

    use super::*;
    use crate::{config::EngineConfig, memory_store::MemoryStore, types::{Actor, ActorType}};

    fn data() -> Data<MemoryStore> {
        EngineConfig::builder()
            .domain("town.example")
            .store(MemoryStore::new())
            .build()
            .expect("config")
            .into()
    }

    #[tokio::test]
    async fn reports_local_users_and_posts() {
        let data = data();
        let alice = Actor {
            id: Url::parse("https://town.example/user/alice").expect("url"),
            preferred_username: "alice".to_string(),
            host: "town.example".to_string(),
            inbox: Url::parse("https://town.example/user/alice/inbox").expect("url"),
            shared_inbox: None,
            followers: None,
            public_key_id: "https://town.example/user/alice#main-key".to_string(),
            public_key_pem: String::new(),
            assertion_method_id: None,
            assertion_method_key: None,
            published: Utc::now(),
            suspended: false,
            kind: ActorType::Person,
            private_key_pem: Some("priv".to_string()),
            assertion_private_key: None,
        };
        data.put_local_actor(alice.clone());
        data.insert_note(
            &Url::parse("https://town.example/notes/1").expect("url"),
            &alice.id,
            serde_json::json!({"content": "hello"}),
            true,
        )
        .await
        .expect("insert");

        let source = NodeInfoUsageSource::new(data, Duration::from_secs(60));
        let usage = source.usage().await.expect("usage");
        assert_eq!(usage.total_users, 1);
        assert_eq!(usage.local_posts, 1);
    }

    #[tokio::test]
    async fn serves_stale_value_within_ttl() {
        let data = data();
        let source = NodeInfoUsageSource::new(data.clone(), Duration::from_secs(3600));
        assert_eq!(source.usage().await.expect("usage").total_users, 0);

        let alice = Actor {
            id: Url::parse("https://town.example/user/alice").expect("url"),
            preferred_username: "alice".to_string(),
            host: "town.example".to_string(),
            inbox: Url::parse("https://town.example/user/alice/inbox").expect("url"),
            shared_inbox: None,
            followers: None,
            public_key_id: "https://town.example/user/alice#main-key".to_string(),
            public_key_pem: String::new(),
            assertion_method_id: None,
            assertion_method_key: None,
            published: Utc::now(),
            suspended: false,
            kind: ActorType::Person,
            private_key_pem: Some("priv".to_string()),
            assertion_private_key: None,
        };
        data.put_local_actor(alice);

        // Within the TTL the cached (stale) value is still served.
        assert_eq!(source.usage().await.expect("usage").total_users, 0);
    }
}
