//! Engine configuration, builder-style like the teacher's `FederationConfig`.

use std::{ops::Deref, sync::Arc, time::Duration};

use derive_builder::Builder;
use reqwest_middleware::ClientWithMiddleware;

use crate::{blocklist::BlockList, store::Store};

/// All tunables enumerated in spec §6, with the defaults given there.
#[derive(Builder, Clone)]
#[builder(build_fn(private, name = "partial_build"))]
pub struct EngineConfig<S: Store + Clone> {
    /// The local authoritative host.
    #[builder(setter(into))]
    pub domain: String,
    /// The persistence collaborator (spec §1/§6).
    pub store: S,
    /// HTTP client used for all outgoing requests.
    #[builder(default = "reqwest::Client::default().into()")]
    pub client: ClientWithMiddleware,
    /// Run in debug mode: allow `http`/`localhost` urls, useful for local federation tests.
    #[builder(default = "false")]
    pub debug: bool,
    /// Sign outgoing HTTP Signatures in Mastodon's relaxed header-selection
    /// variant instead of the strict Cavage draft (spec §4.2, §6 interop).
    #[builder(default = "false")]
    pub http_signature_compat: bool,

    /// How long a cached actor is considered fresh (spec §4.1).
    #[builder(default = "Duration::from_secs(72 * 3600)")]
    pub resolver_cache_ttl: Duration,
    /// Minimum interval between retries of a previously failed fetch.
    #[builder(default = "Duration::from_secs(6 * 3600)")]
    pub resolver_retry_interval: Duration,
    /// Size of the resolver's per-(host,name) lock array.
    #[builder(default = "16")]
    pub max_resolver_requests: usize,
    /// How long a stale-but-unreachable instance is tolerated before being treated as gone.
    #[builder(default = "Duration::from_secs(30 * 24 * 3600)")]
    pub max_instance_recovery_time: Duration,
    /// Minimum age a freshly-discovered actor's `published` must have.
    #[builder(default = "Duration::from_secs(24 * 3600)")]
    pub min_actor_age: Duration,

    /// Cap on inbound/fetched request body sizes.
    #[builder(default = "1024 * 1024")]
    pub max_request_body_size: usize,
    /// Cap on fetched response body sizes (webfinger, actor documents).
    #[builder(default = "1024 * 1024")]
    pub max_response_body_size: usize,
    /// Per-activity processing deadline.
    #[builder(default = "Duration::from_secs(15)")]
    pub activity_processing_timeout: Duration,
    /// Upper bound on the in-flight inbox queue before shedding the oldest 10%.
    #[builder(default = "10_000")]
    pub max_activities_queue_size: u64,
    /// Rows read per inbox processor batch.
    #[builder(default = "64")]
    pub activities_batch_size: u64,
    /// Sleep between inbox processor polls.
    #[builder(default = "Duration::from_secs(5)")]
    pub activities_polling_interval: Duration,
    /// Sleep between inbox processor batches.
    #[builder(default = "Duration::from_millis(100)")]
    pub activities_batch_delay: Duration,
    /// Maximum hops for activity forwarding.
    #[builder(default = "5")]
    pub max_forwarding_depth: u32,

    /// Sleep between outbox pipeline polls.
    #[builder(default = "Duration::from_secs(5)")]
    pub outbox_polling_interval: Duration,
    /// Rows read per outbox batch.
    #[builder(default = "16")]
    pub delivery_batch_size: u64,
    /// Maximum delivery attempts before a job is abandoned.
    #[builder(default = "5")]
    pub max_delivery_attempts: u32,
    /// Minimum interval between delivery retries for the same row.
    #[builder(default = "chrono::Duration::minutes(30)")]
    pub delivery_retry_interval: chrono::Duration,
    /// Per-POST timeout.
    #[builder(default = "Duration::from_secs(5 * 60)")]
    pub delivery_timeout: Duration,
    /// Number of outbox worker shards.
    #[builder(default = "4")]
    pub delivery_workers: usize,
    /// Per-worker inbound queue depth.
    #[builder(default = "16")]
    pub delivery_worker_buffer: usize,
    /// Gateway hosts a portable (`did:key`) inbox is delivered through, one
    /// POST per gateway (spec §3/§4.4 "portable inbox").
    #[builder(default = "Vec::new()")]
    pub portable_gateways: Vec<String>,

    /// Rows read per follower-sync reconciliation batch.
    #[builder(default = "64")]
    pub followers_sync_batch_size: u64,
    /// Minimum interval between follower-sync reconciliations for the same row.
    #[builder(default = "chrono::Duration::days(3)")]
    pub followers_sync_retry_interval: chrono::Duration,
    /// Sleep between follower-sync reconciliation polls.
    #[builder(default = "Duration::from_secs(300)")]
    pub followers_sync_polling_interval: Duration,
    /// Disables attaching/verifying Ed25519 integrity proofs.
    #[builder(default = "false")]
    pub disable_integrity_proofs: bool,

    /// Block-list, shared behind an `Arc` so pipelines can hold a cheap handle.
    #[builder(default = "Arc::new(BlockList::from_domains(Vec::new()))")]
    pub block_list: Arc<BlockList>,
}

impl<S: Store + Clone> EngineConfig<S> {
    /// Returns a new config builder with default values for everything but
    /// `domain` and `store`.
    pub fn builder() -> EngineConfigBuilder<S> {
        EngineConfigBuilder::default()
    }

    /// True if `host` (optionally with a port) names this instance.
    pub fn is_local_host(&self, host: &str) -> bool {
        host == self.domain
    }
}

impl<S: Store + Clone> EngineConfigBuilder<S> {
    /// Builds the config. Exists only to keep the derive-generated
    /// `partial_build` private while presenting a stable public `build`.
    pub fn build(&mut self) -> Result<EngineConfig<S>, EngineConfigBuilderError> {
        self.partial_build()
    }
}

/// Per-request handle bundling the config and app-visible store, mirroring
/// the teacher's `Data<T>`.
#[derive(Clone)]
pub struct Data<S: Store + Clone> {
    /// The engine configuration this request is running under.
    pub config: EngineConfig<S>,
}

impl<S: Store + Clone> Deref for Data<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.config.store
    }
}

impl<S: Store + Clone> From<EngineConfig<S>> for Data<S> {
    fn from(config: EngineConfig<S>) -> Self {
        Data { config }
    }
}
