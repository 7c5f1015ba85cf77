//! Recipient-set expansion: activity addressing to concrete inbox URLs
//! (spec §4.4).

use url::Url;

use crate::{
    config::Data,
    error::Error,
    resolver::{ResolveFlags, Resolver},
    store::Store,
    types::{Activity, PUBLIC_ADDRESS},
};

/// One concrete delivery target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recipient {
    /// The inbox URL to POST to.
    pub inbox: Url,
    /// True if this delivery was reached through the sender's followers
    /// collection, wide public addressing, or forwarding; governs whether a
    /// `Collection-Synchronization` header is attached (spec §4.5).
    pub wide_delivery: bool,
}

/// Expands `activity`'s addressing into deduplicated, resolved inbox URLs.
///
/// `is_forward` is true when `activity.actor` is not `sender` (the local
/// actor relaying someone else's activity rather than authoring it).
pub async fn expand<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    resolver: &Resolver<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<Vec<Recipient>, Error> {
    let is_forward = &activity.actor != sender;

    let mut direct: Vec<Url> = Vec::new();
    if !is_forward {
        for url in activity.to.iter().chain(activity.cc.iter()) {
            if !direct.contains(url) {
                direct.push(url.clone());
            }
        }
    }

    let sender_actor = resolver.resolve_id(sender, ResolveFlags::offline()).await?;
    let followers_addressed = match &sender_actor.followers {
        Some(followers_url) => direct.iter().any(|url| url == followers_url),
        None => false,
    };

    let wide_delivery = is_forward || activity.to.is_public() || activity.cc.is_public() || followers_addressed;

    direct.retain(|url| url.as_str() != PUBLIC_ADDRESS && url != sender);
    if let Some(followers_url) = &sender_actor.followers {
        direct.retain(|url| url != followers_url);
    }

    let mut actor_ids = direct;
    if wide_delivery {
        let activity_host = activity.id.host_str().unwrap_or_default();
        for follower in data.all_followers(sender).await? {
            if follower.host_str() == Some(&data.config.domain) {
                continue;
            }
            if follower.host_str() == Some(activity_host) {
                continue;
            }
            if !actor_ids.contains(&follower) {
                actor_ids.push(follower);
            }
        }
    }

    let mut recipients: Vec<Recipient> = Vec::new();
    let mut seen_inboxes = std::collections::HashSet::new();
    for actor_id in &actor_ids {
        let actor = resolver.resolve_id(actor_id, ResolveFlags::offline()).await?;

        if let Some(gateways) = portable_gateway_urls(actor.inbox.as_str(), &data.config.portable_gateways) {
            for inbox in gateways {
                if inbox.host_str() == Some(data.config.domain.as_str()) {
                    continue;
                }
                if seen_inboxes.insert(inbox.clone()) {
                    recipients.push(Recipient { inbox, wide_delivery });
                }
            }
            continue;
        }

        let inbox = if wide_delivery {
            actor.shared_inbox_or_inbox().clone()
        } else {
            actor.inbox.clone()
        };
        if inbox.host_str() == Some(data.config.domain.as_str()) {
            continue;
        }
        if seen_inboxes.insert(inbox.clone()) {
            recipients.push(Recipient { inbox, wide_delivery });
        }
    }

    Ok(recipients)
}

/// If `inbox` is a portable (`did:key`) reference, expands it to one concrete
/// gateway URL per configured gateway host (spec §3/§4.4).
fn portable_gateway_urls(inbox: &str, gateways: &[String]) -> Option<Vec<Url>> {
    let rest = inbox.strip_prefix("ap://")?;
    Some(
        gateways
            .iter()
            .filter_map(|gateway| Url::parse(&format!("https://{gateway}/.well-known/apgateway/{rest}")).ok())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::{config::EngineConfig, memory_store::MemoryStore, types::{Actor, ActorType}};

    fn actor(id: &str, host: &str, followers: Option<&str>, shared_inbox: Option<&str>) -> Actor {
        Actor {
            id: Url::parse(id).expect("url"),
            preferred_username: id.rsplit('/').next().unwrap_or(id).to_string(),
            host: host.into(),
            inbox: Url::parse(&format!("{id}/inbox")).expect("url"),
            shared_inbox: shared_inbox.and_then(|s| Url::parse(s).ok()),
            followers: followers.and_then(|s| Url::parse(s).ok()),
            public_key_id: format!("{id}#main-key"),
            public_key_pem: String::new(),
            assertion_method_id: None,
            assertion_method_key: None,
            published: Utc::now() - chrono::Duration::days(10),
            suspended: false,
            kind: ActorType::Person,
            private_key_pem: Some("pem".into()),
            assertion_private_key: None,
        }
    }

    fn activity(actor_id: &str, to: Vec<&str>, cc: Vec<&str>) -> Activity {
        serde_json::from_value(json!({
            "id": "https://town.example/activities/1",
            "actor": actor_id,
            "type": "Create",
            "to": to,
            "cc": cc,
        }))
        .expect("activity")
    }

    async fn data() -> (Data<MemoryStore>, Actor) {
        let store = MemoryStore::new();
        let sender = actor(
            "https://town.example/users/alice",
            "town.example",
            Some("https://town.example/users/alice/followers"),
            None,
        );
        store.put_local_actor(sender.clone());
        let config = EngineConfig::builder()
            .domain("town.example")
            .store(store)
            .build()
            .expect("config");
        (Data::from(config), sender)
    }

    #[tokio::test]
    async fn direct_recipients_excludes_author_and_public() {
        let (data, sender) = data().await;
        let resolver = Resolver::new(data.clone());
        let dan = actor("https://bazaar.example/users/dan", "bazaar.example", None, None);
        data.upsert_cached_actor(dan.clone(), Utc::now()).await.expect("seed");

        let act = activity(sender.id.as_str(), vec![dan.id.as_str(), PUBLIC_ADDRESS, sender.id.as_str()], vec![]);
        let recipients = expand(&data, &resolver, &act, &sender.id).await.expect("expand");
        assert_eq!(recipients, vec![Recipient { inbox: dan.inbox.clone(), wide_delivery: false }]);
    }

    #[tokio::test]
    async fn shared_inbox_collapses_wide_delivery() {
        let (data, sender) = data().await;
        let resolver = Resolver::new(data.clone());
        let dan = actor(
            "https://bazaar.example/users/dan",
            "bazaar.example",
            None,
            Some("https://bazaar.example/inbox"),
        );
        let erin = actor(
            "https://bazaar.example/users/erin",
            "bazaar.example",
            None,
            Some("https://bazaar.example/inbox"),
        );
        data.upsert_cached_actor(dan.clone(), Utc::now()).await.expect("seed");
        data.upsert_cached_actor(erin.clone(), Utc::now()).await.expect("seed");
        data.insert_follow(crate::types::Follow {
            id: Url::parse("https://bazaar.example/activities/f1").expect("url"),
            follower: dan.id.clone(),
            followed: sender.id.clone(),
            accepted: true,
            inserted_at: Utc::now(),
        })
        .await
        .expect("follow");
        data.insert_follow(crate::types::Follow {
            id: Url::parse("https://bazaar.example/activities/f2").expect("url"),
            follower: erin.id.clone(),
            followed: sender.id.clone(),
            accepted: true,
            inserted_at: Utc::now(),
        })
        .await
        .expect("follow");

        let act = activity(sender.id.as_str(), vec![PUBLIC_ADDRESS], vec![]);
        let recipients = expand(&data, &resolver, &act, &sender.id).await.expect("expand");
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].inbox.as_str(), "https://bazaar.example/inbox");
        assert!(recipients[0].wide_delivery);
    }
}
