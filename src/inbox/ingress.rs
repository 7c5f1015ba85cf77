//! Synchronous half of the inbox pipeline: body cap, parse, origin check,
//! signature verification, idempotent enqueue (spec §4.3 "Ingress").

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method, Uri};

use crate::{
    config::Data,
    error::Error,
    resolver::{ResolveFlags, Resolver},
    signatures::{verify_digest, verify_proof, verify_signature},
    store::Store,
    sync,
    types::{keys::parse_public_key, Activity, ActivityObject, ActivityType, FollowSync},
};

/// Result of a successful ingress call.
#[derive(Debug, PartialEq, Eq)]
pub enum IngressOutcome {
    /// The activity was durably enqueued.
    Enqueued,
    /// The (path, activity id) pair was already queued; treated as success.
    Duplicate,
    /// The sending actor is not locally known and the activity is a
    /// `Delete`; silently dropped rather than probed (spec §4.2).
    SilentlyDropped,
}

/// Runs the full ingress sequence and enqueues the activity on success.
///
/// `path` is the inbox path the request targeted (`/inbox/{name}` or
/// `/inbox`); it is part of the enqueue idempotency key.
pub async fn verify_and_enqueue<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    resolver: &Resolver<S>,
    path: &str,
    headers: &HeaderMap,
    method: &Method,
    uri: &Uri,
    body: Bytes,
) -> Result<IngressOutcome, Error> {
    if body.len() > data.config.max_request_body_size {
        return Err(Error::BodyTooLarge(data.config.max_request_body_size));
    }

    let activity: Activity = serde_json::from_slice(&body).map_err(Error::Malformed)?;
    validate_origin(&activity)?;

    let digest_header = headers.get("digest");
    verify_digest(digest_header, &body)?;

    let key_id = extract_key_id(headers)?;
    let key_owner = strip_fragment(&key_id)?;

    let offline = activity.kind == ActivityType::Delete;
    let signer = match resolver.resolve_id(&key_owner, ResolveFlags { offline, instance_actor: false }).await {
        Ok(actor) => actor,
        Err(Error::ActorNotCached) if offline => {
            return Ok(IngressOutcome::SilentlyDropped);
        }
        Err(err) => return Err(err),
    };

    let public_key = parse_public_key(&signer.public_key_pem)?;
    verify_signature(headers.iter(), method, uri, &public_key, &data.config.domain)?;

    if signer.id != activity.actor {
        return Err(Error::Unauthorized);
    }

    if activity.proof.is_some() {
        verify_integrity_proof(&body, signer.assertion_method_key.as_deref())?;
    }

    record_follower_sync_header(data, &signer.id, headers).await;

    let inserted = data
        .enqueue_inbox(path, &activity.actor, serde_json::to_value(&activity)?, body.to_vec(), Utc::now())
        .await?;
    Ok(if inserted { IngressOutcome::Enqueued } else { IngressOutcome::Duplicate })
}

/// Verifies an attached integrity proof against the sender's published
/// assertion key (spec §4.2). A peer without a published assertion key
/// cannot satisfy a proof it's claiming to have attached.
fn verify_integrity_proof(body: &[u8], assertion_method_key: Option<&str>) -> Result<(), Error> {
    let document: serde_json::Value = serde_json::from_slice(body).map_err(Error::Malformed)?;
    let method_key = assertion_method_key.ok_or(Error::InvalidProof)?;
    verify_proof(&document, method_key)
}

/// Persists the peer-advertised digest from an inbound `Collection-Synchronization`
/// header (spec §4.5): keyed by the authenticated actor rather than the
/// collection url the header names, since only that actor's own wide
/// delivery ever attaches one. Best-effort: a missing or malformed header is
/// not an ingress failure.
async fn record_follower_sync_header<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    actor: &url::Url,
    headers: &HeaderMap,
) {
    let Some(raw) = headers.get("collection-synchronization").and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Some((_, partial_collection_url, digest_hex)) = sync::parse_header(raw) else {
        tracing::debug!(%actor, "malformed collection-synchronization header, ignoring");
        return;
    };
    if let Err(err) = data
        .upsert_follow_sync(FollowSync {
            actor: actor.clone(),
            partial_collection_url,
            digest_hex,
            updated_at: Utc::now(),
            last_fetched_at: None,
        })
        .await
    {
        tracing::warn!(%err, %actor, "failed to record inbound follower-sync digest");
    }
}

/// Checks that the activity's actor, and any embedded object's
/// `attributedTo`, are hosted on the activity's own origin (spec §4.3 step 3).
fn validate_origin(activity: &Activity) -> Result<(), Error> {
    let origin = activity.id_host().ok_or_else(|| Error::InvalidId(activity.id.to_string()))?;
    let actor_host = activity.actor_host().ok_or_else(|| Error::InvalidId(activity.actor.to_string()))?;
    if actor_host != origin {
        return Err(Error::CrossOriginForgery);
    }
    if let Some(ActivityObject::Object(_)) = &activity.object {
        if let Some(attributed_to) = activity.object.as_ref().and_then(ActivityObject::attributed_to) {
            if attributed_to.host_str() != Some(origin) {
                return Err(Error::CrossOriginForgery);
            }
        }
    }
    Ok(())
}

fn extract_key_id(headers: &HeaderMap) -> Result<String, Error> {
    let signature_header = headers.get("signature").ok_or(Error::Unauthorized)?;
    let raw = signature_header.to_str().map_err(|_| Error::Unauthorized)?;
    raw.split(',')
        .find_map(|part| {
            let part = part.trim();
            part.strip_prefix("keyId=\"")
                .and_then(|rest| rest.strip_suffix('"'))
                .map(str::to_string)
        })
        .ok_or(Error::Unauthorized)
}

fn strip_fragment(key_id: &str) -> Result<url::Url, Error> {
    let mut url = url::Url::parse(key_id).map_err(|_| Error::Unauthorized)?;
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::{config::EngineConfig, memory_store::MemoryStore};

    fn data() -> Data<MemoryStore> {
        EngineConfig::builder()
            .domain("town.example")
            .store(MemoryStore::new())
            .build()
            .expect("config")
            .into()
    }

    #[tokio::test]
    async fn inbound_header_is_recorded_keyed_by_actor() {
        let data = data();
        let actor = Url::parse("https://bazaar.example/users/bob").expect("url");
        let collection_id = Url::parse("https://bazaar.example/users/bob/followers").expect("url");
        let partial = Url::parse("https://bazaar.example/users/bob/followers?host=town.example").expect("url");
        let digest = "a".repeat(64);

        let mut headers = HeaderMap::new();
        let header = sync::header_value(&collection_id, &partial, &digest);
        headers.insert("collection-synchronization", http::HeaderValue::from_str(&header).expect("header value"));

        record_follower_sync_header(&data, &actor, &headers).await;

        let due = data
            .due_follow_syncs(10, chrono::Duration::zero(), Utc::now())
            .await
            .expect("query");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].actor, actor);
        assert_eq!(due[0].partial_collection_url, partial);
        assert_eq!(due[0].digest_hex, digest);
    }

    #[tokio::test]
    async fn missing_header_is_a_noop() {
        let data = data();
        let actor = Url::parse("https://bazaar.example/users/bob").expect("url");
        record_follower_sync_header(&data, &actor, &HeaderMap::new()).await;

        let due = data
            .due_follow_syncs(10, chrono::Duration::zero(), Utc::now())
            .await
            .expect("query");
        assert!(due.is_empty());
    }

    #[test]
    fn valid_proof_is_accepted() {
        use crate::{signatures::sign_proof, types::keys::generate_assertion_keypair};

        let (private, public) = generate_assertion_keypair();
        let document = serde_json::json!({"id": "https://bazaar.example/activities/1", "type": "Create"});
        let proof = sign_proof(&document, &private, "https://bazaar.example/users/bob#ed25519-key").expect("sign");
        let mut signed = document.clone();
        signed["proof"] = proof;
        let body = serde_json::to_vec(&signed).expect("serialize");

        verify_integrity_proof(&body, Some(public.as_str())).expect("verify");
    }

    #[test]
    fn tampered_proof_is_rejected() {
        use crate::{signatures::sign_proof, types::keys::generate_assertion_keypair};

        let (private, public) = generate_assertion_keypair();
        let document = serde_json::json!({"id": "https://bazaar.example/activities/1", "type": "Create"});
        let proof = sign_proof(&document, &private, "https://bazaar.example/users/bob#ed25519-key").expect("sign");
        let mut signed = serde_json::json!({"id": "https://bazaar.example/activities/2", "type": "Create"});
        signed["proof"] = proof;
        let body = serde_json::to_vec(&signed).expect("serialize");

        let err = verify_integrity_proof(&body, Some(public.as_str())).unwrap_err();
        assert!(matches!(err, Error::InvalidProof));
    }

    #[test]
    fn missing_assertion_key_is_rejected() {
        let body = serde_json::to_vec(&serde_json::json!({"id": "https://bazaar.example/activities/1"})).expect("serialize");
        let err = verify_integrity_proof(&body, None).unwrap_err();
        assert!(matches!(err, Error::InvalidProof));
    }
}
