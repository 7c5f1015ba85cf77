//! Actor record and its validation invariants (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// The ActivityStreams actor type tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ActorType {
    /// A single human-operated account.
    Person,
    /// An automated account.
    Service,
    /// A piece of software acting as an actor, e.g. an instance actor.
    Application,
    /// A group account with shared posting.
    Group,
    /// An organization.
    Organization,
}

/// A remote or local identity participating in federation.
///
/// Field names track the wire vocabulary (`camelCase` in JSON) but the Rust
/// struct stores only what the engine inspects; arbitrary extra JSON on a
/// fetched document is the object-layer's concern, not this engine's.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Actor {
    /// Stable `https` identifier for this actor.
    pub id: Url,
    /// Non-empty local handle, e.g. `alice`.
    pub preferred_username: String,
    /// Host this actor is served from; derived from `id` but kept denormalized
    /// for cheap comparisons in the hot paths (origin checks, blocklist).
    pub host: String,
    /// Inbox URL activities addressed to this actor are delivered to.
    pub inbox: Url,
    /// Optional shared inbox, advertised under an `endpoints` mapping on the wire.
    pub shared_inbox: Option<Url>,
    /// URL of the followers OrderedCollection, if any.
    pub followers: Option<Url>,
    /// RSA key used for HTTP Signatures. Always present for a usable actor.
    pub public_key_id: String,
    /// PEM-encoded RSA public key.
    pub public_key_pem: String,
    /// Optional Ed25519 assertion-method key id, for integrity proofs.
    pub assertion_method_id: Option<String>,
    /// PEM/multibase-encoded Ed25519 public key, if `assertion_method_id` is set.
    pub assertion_method_key: Option<String>,
    /// When this actor was first published, per the actor document.
    pub published: DateTime<Utc>,
    /// Whether the actor has been administratively suspended.
    pub suspended: bool,
    /// ActivityStreams type tag.
    #[serde(rename = "type")]
    pub kind: ActorType,
    /// RSA private key PEM, present only for local actors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_pem: Option<String>,
    /// Ed25519 private key, present only for local actors with an assertion method.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assertion_private_key: Option<String>,
}

/// Hosts that must never be treated as valid discovery or actor-id hosts.
const RESERVED_HOSTS: &[&str] = &["localhost", "0.0.0.0", "127.0.0.1", "::1"];

impl Actor {
    /// Validates the invariants spec §3 requires of any actor before it is
    /// trusted: `https` scheme, non-reserved host, non-empty username, and
    /// (for local actors) presence of private key material.
    pub fn validate(&self, local_domain: &str, debug: bool) -> Result<(), Error> {
        match self.id.scheme() {
            "https" => {}
            "http" if debug => {}
            _ => return Err(Error::InvalidScheme(self.id.clone())),
        }
        let id_host = self.id.host_str().ok_or(Error::InvalidId(self.id.to_string()))?;
        if is_reserved_host(id_host) {
            return Err(Error::InvalidId(self.id.to_string()));
        }
        if self.preferred_username.trim().is_empty() {
            return Err(Error::InvalidId(self.id.to_string()));
        }
        if id_host == local_domain && self.private_key_pem.is_none() {
            return Err(Error::Key(format!(
                "local actor {} is missing a private key",
                self.id
            )));
        }
        Ok(())
    }

    /// True if `self.id`'s host equals `host` or is a subdomain of it.
    pub fn id_matches_host(&self, host: &str) -> bool {
        host_matches_or_subdomain(self.id.host_str().unwrap_or(""), host)
    }

    /// Returns the shared inbox if advertised, else the personal inbox
    /// (spec §3, used for shared-inbox fan-in in the outbox pipeline).
    pub fn shared_inbox_or_inbox(&self) -> &Url {
        self.shared_inbox.as_ref().unwrap_or(&self.inbox)
    }
}

/// True if `candidate` is `host` itself or a subdomain `*.host`.
pub fn host_matches_or_subdomain(candidate: &str, host: &str) -> bool {
    candidate == host || candidate.ends_with(&format!(".{host}"))
}

/// True if `host` is a loopback/private/reserved host that must never be
/// treated as a remote discovery target.
pub fn is_reserved_host(host: &str) -> bool {
    if RESERVED_HOSTS.contains(&host) {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified() || is_private(&ip);
    }
    false
}

fn is_private(ip: &std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        std::net::IpAddr::V6(_) => false,
    }
}

/// `Actor` plus the lifecycle timestamps the resolver's cache tracks (spec §3/§4.1).
#[derive(Clone, Debug)]
pub struct CachedActor {
    /// The cached actor document.
    pub actor: Actor,
    /// When this row was first inserted.
    pub inserted_at: DateTime<Utc>,
    /// When the actor document was last successfully refreshed.
    pub updated_at: DateTime<Utc>,
    /// When a fetch was last *attempted* (successful or not).
    pub fetched_at: DateTime<Utc>,
    /// Timestamp of the most recent failed fetch attempt, if any, used for
    /// the retry back-off window in spec §4.1 step 7.
    pub last_fetch_failed_at: Option<DateTime<Utc>>,
}

impl CachedActor {
    /// `now - updated_at`, the freshness measure the resolver's TTL check uses.
    pub fn since_last_update(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.updated_at
    }
}
