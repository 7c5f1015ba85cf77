//! XOR-of-SHA-256 followers digests and the periodic reconciliation loop
//! (spec §4.5 "Follower Syncer").

use std::fmt::Write as _;

use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    config::Data,
    error::Error,
    signatures::{base_headers, sign_request},
    store::Store,
    types::keys::parse_private_key,
};

/// Computes the XOR-of-SHA-256 digest over `followers`, as 64 lowercase hex
/// characters. Order-independent by construction (spec §4.5).
pub fn xor_digest<'a>(followers: impl Iterator<Item = &'a Url>) -> String {
    let mut acc = [0u8; 32];
    for follower in followers {
        let hash = Sha256::digest(follower.as_str().as_bytes());
        for (a, b) in acc.iter_mut().zip(hash.iter()) {
            *a ^= b;
        }
    }
    to_hex(&acc)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        write!(out, "{byte:02x}").expect("write to String never fails");
    }
    out
}

/// Builds the `Collection-Synchronization` header value (spec §6).
pub fn header_value(collection_id: &Url, partial_collection_url: &Url, digest_hex: &str) -> String {
    format!(r#"collectionId="{collection_id}", url="{partial_collection_url}", digest="{digest_hex}""#)
}

/// Parses a received `Collection-Synchronization` header back into its parts.
pub fn parse_header(value: &str) -> Option<(Url, Url, String)> {
    let mut collection_id = None;
    let mut partial_url = None;
    let mut digest = None;
    for part in value.split(',') {
        let part = part.trim();
        let (key, raw) = part.split_once('=')?;
        let quoted = raw.strip_prefix('"')?.strip_suffix('"')?;
        match key.trim() {
            "collectionId" => collection_id = Url::parse(quoted).ok(),
            "url" => partial_url = Url::parse(quoted).ok(),
            "digest" => digest = Some(quoted.to_string()),
            _ => {}
        }
    }
    Some((collection_id?, partial_url?, digest?))
}

#[derive(Deserialize, Default)]
struct PartialCollection {
    #[serde(rename = "orderedItems", default)]
    ordered_items: Vec<Url>,
    #[serde(default)]
    items: Vec<Url>,
}

/// Periodically reconciles `follows_sync` rows against reality (spec §4.5).
pub struct FollowerSyncer<S: Store + Clone + Send + Sync + 'static> {
    data: Data<S>,
}

impl<S: Store + Clone + Send + Sync + 'static> FollowerSyncer<S> {
    /// Builds a syncer over `data`.
    pub fn new(data: Data<S>) -> Self {
        Self { data }
    }

    /// Runs the reconciliation loop forever. Intended to be spawned as its
    /// own task.
    pub async fn run(self) {
        loop {
            self.reconcile_due().await;
            tokio::time::sleep(self.data.config.followers_sync_polling_interval).await;
        }
    }

    async fn reconcile_due(&self) {
        let retry_after = self.data.config.followers_sync_retry_interval;
        let batch_size = self.data.config.followers_sync_batch_size;
        let due = match self
            .data
            .due_follow_syncs(batch_size, retry_after, Utc::now())
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!(%err, "failed to read due follower-sync rows");
                return;
            }
        };

        for row in due {
            if let Err(err) = self.reconcile_one(&row.actor, &row.partial_collection_url, &row.digest_hex).await {
                tracing::warn!(actor = %row.actor, %err, "follower-sync reconciliation failed, will retry next cycle");
            }
        }
    }

    async fn reconcile_one(&self, actor: &Url, partial_collection_url: &Url, remote_digest: &str) -> Result<(), Error> {
        let local_domain = self.data.config.domain.clone();
        let locals: Vec<Url> = self
            .data
            .all_followers(actor)
            .await?
            .into_iter()
            .filter(|follower| follower.host_str() == Some(local_domain.as_str()))
            .collect();
        let local_digest = xor_digest(locals.iter());

        if local_digest == remote_digest {
            self.data.touch_follow_sync(actor, Utc::now()).await?;
            return Ok(());
        }

        let remote_members = self.fetch_partial_collection(partial_collection_url).await?;
        for local in &locals {
            if !remote_members.contains(local) {
                self.data.delete_follow_by_pair(local, actor).await?;
                tracing::info!(follower = %local, followed = %actor, "follower-sync removed stale follow");
            }
        }
        self.data.touch_follow_sync(actor, Utc::now()).await
    }

    async fn fetch_partial_collection(&self, url: &Url) -> Result<Vec<Url>, Error> {
        let signer = self
            .data
            .get_local_actor(&self.data.config.domain)
            .await?
            .ok_or_else(|| Error::NoLocalActor(self.data.config.domain.clone()))?;
        let private_key_pem = signer
            .private_key_pem
            .as_deref()
            .ok_or_else(|| Error::Key("instance actor is missing a private key".to_string()))?;
        let private_key = parse_private_key(private_key_pem)?;

        let headers = base_headers(url, "application/activity+json");
        let mut request_builder = self.data.config.client.get(url.clone());
        for (name, value) in headers.iter() {
            request_builder = request_builder.header(name.clone(), value.clone());
        }
        let request = sign_request(
            request_builder,
            &signer.public_key_id,
            bytes::Bytes::new(),
            private_key,
            false,
        )
        .await?;

        let response = self.data.config.client.execute(request).await?;
        if response.status().as_u16() == 404 || response.status().as_u16() == 410 {
            return Err(Error::ActorGone(url.clone()));
        }
        let bytes = response.bytes().await?;
        if bytes.len() > self.data.config.max_response_body_size {
            return Err(Error::BodyTooLarge(self.data.config.max_response_body_size));
        }
        let page: PartialCollection = serde_json::from_slice(&bytes).map_err(Error::Malformed)?;
        let mut members = page.ordered_items;
        members.extend(page.items);
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_order_independent() {
        let a = Url::parse("https://bazaar.example/users/dan").expect("url");
        let b = Url::parse("https://bazaar.example/users/erin").expect("url");
        let forward = xor_digest(vec![&a, &b].into_iter());
        let backward = xor_digest(vec![&b, &a].into_iter());
        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 64);
    }

    #[test]
    fn digest_changes_when_membership_changes() {
        let a = Url::parse("https://bazaar.example/users/dan").expect("url");
        let b = Url::parse("https://bazaar.example/users/erin").expect("url");
        let with_both = xor_digest(vec![&a, &b].into_iter());
        let with_one = xor_digest(vec![&a].into_iter());
        assert_ne!(with_both, with_one);
    }

    #[test]
    fn header_roundtrip() {
        let collection_id = Url::parse("https://town.example/users/alice/followers").expect("url");
        let partial = Url::parse("https://town.example/users/alice/followers?host=bazaar.example").expect("url");
        let digest = "a".repeat(64);
        let header = header_value(&collection_id, &partial, &digest);
        let (parsed_collection, parsed_partial, parsed_digest) = parse_header(&header).expect("parse");
        assert_eq!(parsed_collection, collection_id);
        assert_eq!(parsed_partial, partial);
        assert_eq!(parsed_digest, digest);
    }
}
