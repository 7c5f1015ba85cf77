//! Error taxonomy for the federation engine.
//!
//! Mirrors the categories in the design: transport, authentication, protocol,
//! target-gone, policy and idempotent-conflict. Pipeline call sites match on
//! these variants to decide whether a failure poisons a batch or is merely
//! logged and dropped.

use url::Url;

/// Errors returned by the federation engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Identifier did not use the `https` scheme (outside debug mode).
    #[error("identifier must use https: {0}")]
    InvalidScheme(Url),
    /// Identifier host did not match the expected discovery host.
    #[error("identifier host does not match discovery host: {0}")]
    InvalidHost(Url),
    /// Identifier was not an allowed actor id (reserved/loopback/private host, bad percent-escapes).
    #[error("identifier is not a valid actor id: {0}")]
    InvalidId(String),
    /// Resolution targeted the local domain but no such local actor exists.
    #[error("no local actor named {0}")]
    NoLocalActor(String),
    /// Resolution was requested offline and nothing is cached.
    #[error("actor not cached and offline resolution was requested")]
    ActorNotCached,
    /// The remote actor no longer exists (404/410 or DNS gone past the recovery window).
    #[error("actor is gone: {0}")]
    ActorGone(Url),
    /// The remote host is on the block-list.
    #[error("domain is blocked: {0}")]
    BlockedDomain(String),
    /// The actor is marked suspended.
    #[error("actor is suspended: {0}")]
    SuspendedActor(Url),
    /// The actor's `published` timestamp is younger than the configured minimum age.
    #[error("actor is too young: {0}")]
    YoungActor(Url),
    /// HTTP signature verification failed, or the signing actor could not be resolved.
    #[error("request signature is invalid or unverifiable")]
    Unauthorized,
    /// Integrity proof over the activity body did not match.
    #[error("integrity proof verification failed")]
    InvalidProof,
    /// Activity failed the cross-origin check against its claimed sender.
    #[error("activity actor/object is not hosted on the sender's origin")]
    CrossOriginForgery,
    /// Webfinger discovery did not yield a usable link.
    #[error("webfinger resolution failed for {0}")]
    WebfingerResolveFailed(String),
    /// A response or request body exceeded the configured size cap.
    #[error("body exceeded size limit of {0} bytes")]
    BodyTooLarge(usize),
    /// JSON structurally failed to parse as an activity or actor document.
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Outbound/inbound HTTP request failed at the transport layer.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    /// Underlying reqwest-middleware failure (retry policies, etc).
    #[error(transparent)]
    Middleware(#[from] reqwest_middleware::Error),
    /// HTTP signature construction failed.
    #[error(transparent)]
    Sign(#[from] http_signature_normalization_reqwest::SignError),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
    /// Key material was malformed or unusable.
    #[error("key error: {0}")]
    Key(String),
    /// Catch-all for collaborator (store) failures that the engine cannot classify further.
    #[error("store error: {0}")]
    Store(String),
    /// Deadline for processing a single activity or delivery elapsed.
    #[error("operation timed out")]
    Timeout,
    /// Anything else, carrying a plain message so call sites stay readable.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors that are expected/benign in the outbox worker loop and
    /// must not flip a delivery job to failed (spec §4.4).
    pub fn is_benign_delivery_failure(&self) -> bool {
        matches!(self, Error::BlockedDomain(_) | Error::ActorGone(_))
    }
}
