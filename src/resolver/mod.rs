//! Actor discovery, caching, staleness and gone-handling (spec §4.1).

mod webfinger;

use chrono::{DateTime, Utc};
use url::Url;

use crate::{
    config::Data,
    error::Error,
    store::Store,
    types::{actor::is_reserved_host, Actor, CachedActor},
};

pub use webfinger::{discover_link, Webfinger, WebfingerLink};

/// Flags controlling one resolution call (spec §4.1).
#[derive(Clone, Copy, Debug, Default)]
pub struct ResolveFlags {
    /// Forbid network fetches; only ever return what's cached.
    pub offline: bool,
    /// Treat `host` as the name too, for instance-actor discovery.
    pub instance_actor: bool,
}

impl ResolveFlags {
    /// All default (online, not an instance-actor lookup).
    pub fn none() -> Self {
        Self::default()
    }

    /// Shorthand for `{ offline: true, ..Default::default() }`.
    pub fn offline() -> Self {
        ResolveFlags {
            offline: true,
            ..Default::default()
        }
    }
}

/// Discovers and caches remote actor records (spec §4.1).
///
/// Holds a fixed-size array of locks, indexed by a stable hash of
/// `host‖name`, so concurrent resolutions of the same actor serialize
/// instead of each issuing their own WebFinger burst (spec §5).
pub struct Resolver<S: Store + Clone> {
    data: Data<S>,
    locks: Vec<tokio::sync::Mutex<()>>,
}

/// Where a fresh document for an actor would come from on the network.
enum FetchTarget {
    Direct(Url),
    Webfinger { host: String, name: String },
}

impl<S: Store + Clone + Send + Sync + 'static> Resolver<S> {
    /// Builds a resolver over `data`. The lock array size is
    /// `max_resolver_requests` from the engine config.
    pub fn new(data: Data<S>) -> Self {
        let slots = data.config.max_resolver_requests.max(1);
        let locks = (0..slots).map(|_| tokio::sync::Mutex::new(())).collect();
        Resolver { data, locks }
    }

    fn lock_index(&self, host: &str, name: &str) -> usize {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(host.as_bytes());
        hasher.update(b"\0");
        hasher.update(name.as_bytes());
        (hasher.finalize() as usize) % self.locks.len()
    }

    /// Resolves an actor by its full identifier (spec §4.1 `ResolveID`).
    pub async fn resolve_id(&self, id: &Url, flags: ResolveFlags) -> Result<Actor, Error> {
        validate_identifier(id, self.data.config.debug)?;
        let host = id
            .host_str()
            .ok_or_else(|| Error::InvalidId(id.to_string()))?
            .to_string();

        if self.data.config.is_local_host(&host) {
            let name = last_path_segment(id).ok_or_else(|| Error::NoLocalActor(id.to_string()))?;
            return self
                .data
                .get_local_actor(&name)
                .await?
                .ok_or(Error::NoLocalActor(name));
        }
        if self.data.config.block_list.contains(&host) {
            return Err(Error::BlockedDomain(host));
        }

        let name = last_path_segment(id).unwrap_or_default();
        let _guard = self.locks[self.lock_index(&host, &name)].lock().await;

        let cached = self.data.get_cached_actor(id).await?;
        self.resolve_with_cache(cached, flags, FetchTarget::Direct(id.clone())).await
    }

    /// Resolves an actor by `(host, name)` via WebFinger (spec §4.1 `Resolve`).
    ///
    /// `flags.instance_actor` discovers the host's instance-wide actor
    /// instead of a specific user, by webfingering `acct:{host}@{host}`.
    pub async fn resolve(&self, host: &str, name: &str, flags: ResolveFlags) -> Result<Actor, Error> {
        let name = if flags.instance_actor { host } else { name };

        if self.data.config.is_local_host(host) {
            return self
                .data
                .get_local_actor(name)
                .await?
                .ok_or_else(|| Error::NoLocalActor(name.to_string()));
        }
        if self.data.config.block_list.contains(host) {
            return Err(Error::BlockedDomain(host.to_string()));
        }

        let _guard = self.locks[self.lock_index(host, name)].lock().await;

        let cached = self.data.get_cached_actor_by_acct(name, host).await?;
        self.resolve_with_cache(
            cached,
            flags,
            FetchTarget::Webfinger {
                host: host.to_string(),
                name: name.to_string(),
            },
        )
        .await
    }

    /// Shared staleness/retry/fetch logic for both entry points (spec §4.1 steps 5-11).
    async fn resolve_with_cache(
        &self,
        cached: Option<CachedActor>,
        flags: ResolveFlags,
        target: FetchTarget,
    ) -> Result<Actor, Error> {
        let now = Utc::now();

        if let Some(c) = &cached {
            if c.actor.suspended {
                return Err(Error::SuspendedActor(c.actor.id.clone()));
            }
            let ttl = chrono::Duration::from_std(self.data.config.resolver_cache_ttl)
                .unwrap_or(chrono::Duration::zero());
            if flags.offline || c.since_last_update(now) < ttl {
                return Ok(c.actor.clone());
            }
        }

        if flags.offline {
            return match cached {
                Some(c) => Ok(c.actor),
                None => Err(Error::ActorNotCached),
            };
        }

        if let Some(c) = &cached {
            if let Some(failed_at) = c.last_fetch_failed_at {
                let retry_window = chrono::Duration::from_std(self.data.config.resolver_retry_interval)
                    .unwrap_or(chrono::Duration::zero());
                if now - failed_at < retry_window {
                    return Ok(c.actor.clone());
                }
            }
        }

        let fetch_url = match self.locate(&target, &cached).await {
            Ok(Some(url)) => url,
            Ok(None) => {
                return match cached {
                    Some(c) => Ok(c.actor),
                    None => Err(Error::WebfingerResolveFailed(target.describe())),
                };
            }
            Err(err) => return self.handle_fetch_error(cached, err, now).await,
        };

        self.data.record_fetch_failure(&fetch_url, now).await.ok();

        match self.fetch_actor(&fetch_url).await {
            Ok(actor) => {
                actor.validate(&self.data.config.domain, self.data.config.debug)?;
                self.data.upsert_cached_actor(actor.clone(), now).await?;

                let min_age = chrono::Duration::from_std(self.data.config.min_actor_age)
                    .unwrap_or(chrono::Duration::zero());
                if now - actor.published < min_age {
                    return Err(Error::YoungActor(actor.id));
                }
                Ok(actor)
            }
            Err(err) => self.handle_fetch_error(cached, err, now).await,
        }
    }

    /// Resolves a [`FetchTarget`] to a concrete document url, running
    /// WebFinger discovery and its host-match/id-match checks when needed.
    /// `Ok(None)` means "nothing usable was discovered, fall back to cache".
    async fn locate(&self, target: &FetchTarget, cached: &Option<CachedActor>) -> Result<Option<Url>, Error> {
        match target {
            FetchTarget::Direct(url) => Ok(Some(url.clone())),
            FetchTarget::Webfinger { host, name } => {
                let Some(link) = discover_link(&self.data, host, name).await? else {
                    return Ok(None);
                };
                if !crate::types::actor::host_matches_or_subdomain(link.host_str().unwrap_or(""), host) {
                    return Err(Error::InvalidHost(link));
                }
                validate_identifier(&link, self.data.config.debug)?;
                if let Some(c) = cached {
                    if c.actor.id != link {
                        return Err(Error::InvalidId(link.to_string()));
                    }
                }
                Ok(Some(link))
            }
        }
    }

    /// Applies gone-handling (spec §4.1 step 10) or falls back to a stale
    /// cache entry for transient failures, within the recovery window.
    async fn handle_fetch_error(
        &self,
        cached: Option<CachedActor>,
        err: Error,
        now: DateTime<Utc>,
    ) -> Result<Actor, Error> {
        if let Error::ActorGone(id) = &err {
            self.data.delete_actor_cascade(id).await?;
            if let Some(c) = &cached {
                self.data.delete_actor_cascade(&c.actor.id).await?;
            }
            return Err(err);
        }

        let Some(c) = cached else {
            return Err(err);
        };
        let recovery = chrono::Duration::from_std(self.data.config.max_instance_recovery_time)
            .unwrap_or(chrono::Duration::zero());
        if now - c.updated_at > recovery {
            self.data.delete_actor_cascade(&c.actor.id).await?;
            return Err(Error::ActorGone(c.actor.id));
        }
        tracing::warn!("transient fetch failure for {}, serving stale cache: {err}", c.actor.id);
        Ok(c.actor)
    }

    async fn fetch_actor(&self, url: &Url) -> Result<Actor, Error> {
        let actor: Actor = crate::http::fetch_json_capped(
            &self.data.config.client,
            url,
            "application/activity+json, application/ld+json",
            self.data.config.max_response_body_size,
        )
        .await?;
        if &actor.id != url {
            return Err(Error::InvalidId(format!(
                "fetched actor id {} does not match requested url {url}",
                actor.id
            )));
        }
        Ok(actor)
    }
}

impl FetchTarget {
    fn describe(&self) -> String {
        match self {
            FetchTarget::Direct(url) => url.to_string(),
            FetchTarget::Webfinger { host, name } => format!("{name}@{host}"),
        }
    }
}

/// Step 1 of the discovery protocol: scheme, reserved-host and percent-escape checks.
pub fn validate_identifier(id: &Url, debug: bool) -> Result<(), Error> {
    match id.scheme() {
        "https" => {}
        "http" if debug => {}
        _ => return Err(Error::InvalidScheme(id.clone())),
    }
    let host = id.host_str().ok_or_else(|| Error::InvalidId(id.to_string()))?;
    if is_reserved_host(host) {
        return Err(Error::InvalidId(id.to_string()));
    }
    // `Url` rejects invalid UTF-8 percent-escapes at parse time; re-parsing
    // the string form catches any smuggled double-encoding.
    if Url::parse(id.as_str()).is_err() {
        return Err(Error::InvalidId(id.to_string()));
    }
    Ok(())
}

fn last_path_segment(url: &Url) -> Option<String> {
    url.path_segments()?.last().filter(|s| !s.is_empty()).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use crate::{config::EngineConfig, memory_store::MemoryStore, types::ActorType};

    use super::*;

    fn local_actor(domain: &str, name: &str) -> Actor {
        Actor {
            id: Url::parse(&format!("https://{domain}/user/{name}")).expect("valid url"),
            preferred_username: name.to_string(),
            host: domain.to_string(),
            inbox: Url::parse(&format!("https://{domain}/user/{name}/inbox")).expect("valid url"),
            shared_inbox: None,
            followers: None,
            public_key_id: format!("https://{domain}/user/{name}#main-key"),
            public_key_pem: String::new(),
            assertion_method_id: None,
            assertion_method_key: None,
            published: Utc::now() - chrono::Duration::days(2),
            suspended: false,
            kind: ActorType::Person,
            private_key_pem: Some("priv".to_string()),
            assertion_private_key: None,
        }
    }

    fn test_data(domain: &str) -> Data<MemoryStore> {
        let config = EngineConfig::builder()
            .domain(domain)
            .store(MemoryStore::new())
            .build()
            .expect("config builds");
        Data::from(config)
    }

    #[tokio::test]
    async fn local_actor_resolves_directly() {
        let data = test_data("localhost.localdomain");
        let actor = local_actor("localhost.localdomain", "alice");
        data.put_local_actor(actor.clone());

        let resolver = Resolver::new(data);
        let resolved = resolver
            .resolve("localhost.localdomain", "alice", ResolveFlags::none())
            .await
            .expect("resolves");
        assert_eq!(resolved.id, actor.id);
    }

    #[tokio::test]
    async fn missing_local_actor_fails() {
        let data = test_data("localhost.localdomain");
        let resolver = Resolver::new(data);
        let err = resolver
            .resolve("localhost.localdomain", "ghost", ResolveFlags::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoLocalActor(_)));
    }

    #[tokio::test]
    async fn blocked_domain_short_circuits() {
        let mut config = EngineConfig::builder()
            .domain("localhost.localdomain")
            .store(MemoryStore::new())
            .build()
            .expect("config builds");
        config.block_list = std::sync::Arc::new(crate::blocklist::BlockList::from_domains([
            "evil.example".to_string(),
        ]));
        let data = Data::from(config);
        let resolver = Resolver::new(data);
        let err = resolver
            .resolve_id(
                &Url::parse("https://evil.example/user/mallory").expect("valid url"),
                ResolveFlags::none(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BlockedDomain(_)));
    }

    #[tokio::test]
    async fn offline_without_cache_fails() {
        let data = test_data("localhost.localdomain");
        let resolver = Resolver::new(data);
        let err = resolver
            .resolve_id(
                &Url::parse("https://ip6-allnodes.example/user/dan").expect("valid url"),
                ResolveFlags::offline(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ActorNotCached));
    }

    #[tokio::test]
    async fn offline_returns_cached_even_if_stale() {
        let data = test_data("localhost.localdomain");
        let remote = local_actor("ip6-allnodes.example", "dan");
        data.upsert_cached_actor(remote.clone(), Utc::now() - chrono::Duration::days(400))
            .await
            .expect("insert");
        let resolver = Resolver::new(data);
        let resolved = resolver
            .resolve_id(&remote.id, ResolveFlags::offline())
            .await
            .expect("serves stale cache");
        assert_eq!(resolved.id, remote.id);
    }

    #[tokio::test]
    async fn suspended_actor_is_rejected_even_when_fresh() {
        let data = test_data("localhost.localdomain");
        let mut remote = local_actor("ip6-allnodes.example", "dan");
        remote.suspended = true;
        data.upsert_cached_actor(remote.clone(), Utc::now()).await.expect("insert");
        let resolver = Resolver::new(data);
        let err = resolver.resolve_id(&remote.id, ResolveFlags::none()).await.unwrap_err();
        assert!(matches!(err, Error::SuspendedActor(_)));
    }
}
