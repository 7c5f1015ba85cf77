//! Per-type authorization and side-effect semantics (spec §4.3).

use chrono::Utc;
use serde_json::json;
use url::Url;

use crate::{
    config::Data,
    error::Error,
    resolver::{ResolveFlags, Resolver},
    store::Store,
    types::{Activity, ActivityObject, ActivityType, Follow, PUBLIC_ADDRESS},
};

/// Dispatches one parsed activity to its per-type handler.
///
/// Unknown types are logged and discarded, not an error, per spec §4.3.
pub async fn dispatch<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    resolver: &Resolver<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<(), Error> {
    match activity.kind {
        ActivityType::Create => handle_create(data, resolver, activity, sender).await,
        ActivityType::Announce => handle_announce(data, resolver, activity, sender).await,
        ActivityType::Delete => handle_delete(data, activity, sender).await,
        ActivityType::Follow => handle_follow(data, activity, sender).await,
        ActivityType::Accept => handle_accept(data, activity, sender).await,
        ActivityType::Undo => handle_undo(data, activity, sender).await,
        ActivityType::Update => handle_update(data, resolver, activity, sender).await,
        ActivityType::Like | ActivityType::Block | ActivityType::Move => {
            tracing::debug!(kind = ?activity.kind, id = %activity.id, "activity type not handled, ignoring");
            Ok(())
        }
        ActivityType::Unknown => {
            tracing::debug!(id = %activity.id, "unknown activity type, discarding");
            Ok(())
        }
    }
}

async fn handle_announce<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    resolver: &Resolver<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<(), Error> {
    match &activity.object {
        Some(ActivityObject::Activity(inner)) if inner.kind == ActivityType::Create => {
            handle_create(data, resolver, inner, sender).await
        }
        _ => {
            tracing::debug!(id = %activity.id, "announce without an embedded create, ignoring");
            Ok(())
        }
    }
}

/// Create (or the Create wrapped inside an Announce), spec §4.3.
async fn handle_create<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    resolver: &Resolver<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<(), Error> {
    let local_domain = &data.config.domain;
    if sender.host_str() == Some(local_domain.as_str())
        || activity.actor.host_str() == Some(local_domain.as_str())
    {
        return Err(Error::CrossOriginForgery);
    }

    let object = activity.object.as_ref().ok_or_else(|| missing("object"))?;
    let object_id = object.id().ok_or_else(|| missing("object.id"))?;
    if object_id.host_str() == Some(local_domain.as_str()) {
        return Err(Error::CrossOriginForgery);
    }
    let attributed_to = object.attributed_to().ok_or_else(|| missing("object.attributedTo"))?;
    if attributed_to.host_str() == Some(local_domain.as_str()) {
        return Err(Error::CrossOriginForgery);
    }

    if data.note_exists(&object_id).await? {
        tracing::debug!(id = %object_id, "duplicate create, ignoring");
        return Ok(());
    }

    let author = resolver
        .resolve_id(&attributed_to, ResolveFlags::none())
        .await?;

    let public = activity.to.is_public() || activity.cc.is_public();
    let body = object_body(object);
    data.insert_note(&object_id, &author.id, body, public).await?;

    for mentioned in activity.to.iter().chain(activity.cc.iter()) {
        if mentioned.as_str() == PUBLIC_ADDRESS {
            continue;
        }
        let _ = resolver.resolve_id(mentioned, ResolveFlags::none()).await;
    }
    Ok(())
}

/// `Delete`, spec §4.3: either deletes the sender's own actor, or a note
/// they authored.
async fn handle_delete<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<(), Error> {
    let target_id = match &activity.object {
        Some(object) => object.id().ok_or_else(|| missing("object.id"))?,
        None => activity.actor.clone(),
    };

    if &target_id == sender {
        data.delete_actor_cascade(sender).await?;
        return Ok(());
    }

    if let Some((author, _)) = data.get_note_meta(&target_id).await? {
        if &author == sender {
            data.delete_note(&target_id).await?;
        } else {
            tracing::warn!(id = %target_id, sender = %sender, "delete authorization mismatch, dropping");
        }
    }
    Ok(())
}

/// `Follow`, spec §4.3: auto-accepts inbound follows of a local actor.
async fn handle_follow<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<(), Error> {
    if &activity.actor != sender {
        return Err(Error::CrossOriginForgery);
    }
    let followed_id = activity
        .object
        .as_ref()
        .and_then(ActivityObject::id)
        .ok_or_else(|| missing("object.id"))?;
    let local_domain = &data.config.domain;
    if followed_id.host_str() != Some(local_domain.as_str()) {
        return Err(Error::CrossOriginForgery);
    }
    let name = followed_id
        .path_segments()
        .and_then(|mut segs| segs.next_back())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::NoLocalActor(followed_id.to_string()))?;
    let followed = data
        .get_local_actor(name)
        .await?
        .ok_or_else(|| Error::NoLocalActor(name.to_string()))?;

    data.insert_follow(Follow {
        id: activity.id.clone(),
        follower: activity.actor.clone(),
        followed: followed.id.clone(),
        accepted: true,
        inserted_at: Utc::now(),
    })
    .await?;

    let accept = json!({
        "id": format!("{}#accepts/follows/{}", followed.id, percent_slug(&activity.id)),
        "type": "Accept",
        "actor": followed.id,
        "object": activity.id,
        "to": [activity.actor],
    });
    data.enqueue_outbox(&followed.id, accept, Utc::now()).await?;
    Ok(())
}

/// `Accept`, spec §4.3: marks the referenced `Follow` accepted, whether the
/// object is embedded or (as this engine's own `handle_follow` emits) a bare
/// id -- both resolve through `Store::get_follow_by_id`.
async fn handle_accept<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<(), Error> {
    if &activity.actor != sender {
        return Err(Error::CrossOriginForgery);
    }
    let Some(follow_id) = activity.object.as_ref().and_then(ActivityObject::id) else {
        tracing::warn!(id = %activity.id, "accept without a resolvable follow reference, dropping");
        return Ok(());
    };
    let Some(follow) = data.get_follow_by_id(&follow_id).await? else {
        tracing::debug!(id = %follow_id, "accept for an unknown follow, ignoring");
        return Ok(());
    };
    if follow.followed.host_str() != sender.host_str() {
        return Err(Error::CrossOriginForgery);
    }
    data.accept_follow(&follow.id, &follow.follower).await
}

/// `Undo(Follow)`, spec §4.3.
async fn handle_undo<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<(), Error> {
    let follow = match &activity.object {
        Some(ActivityObject::Activity(inner)) if inner.kind == ActivityType::Follow => inner,
        _ => {
            tracing::debug!(id = %activity.id, "undo of a non-follow activity, ignoring");
            return Ok(());
        }
    };
    if &follow.actor != sender {
        return Err(Error::CrossOriginForgery);
    }
    data.delete_follow(&follow.id, &follow.actor).await
}

/// `Update`, spec §4.3/§9: falls back to `Create` for unknown local notes,
/// preserved deliberately for Mastodon interoperability.
async fn handle_update<S: Store + Clone + Send + Sync + 'static>(
    data: &Data<S>,
    resolver: &Resolver<S>,
    activity: &Activity,
    sender: &Url,
) -> Result<(), Error> {
    let object = activity.object.as_ref().ok_or_else(|| missing("object"))?;
    let object_id = object.id().ok_or_else(|| missing("object.id"))?;
    let attributed_to = object.attributed_to().ok_or_else(|| missing("object.attributedTo"))?;
    if &attributed_to != sender {
        return Err(Error::CrossOriginForgery);
    }

    match data.get_note_meta(&object_id).await? {
        None => {
            tracing::info!(id = %object_id, note = "update-as-create fallback", "update for unknown note, treating as create");
            handle_create(data, resolver, activity, sender).await
        }
        Some((_, stored_updated)) => {
            let incoming_updated = object.updated();
            let is_newer = match (incoming_updated, stored_updated) {
                (Some(incoming), Some(stored)) => incoming > stored,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if !is_newer {
                tracing::debug!(id = %object_id, "stale update, ignoring");
                return Ok(());
            }
            data.update_note(&object_id, object_body(object), incoming_updated.unwrap_or_else(Utc::now))
                .await
        }
    }
}

fn missing(field: &str) -> Error {
    Error::Other(format!("activity is missing required field: {field}"))
}

fn object_body(object: &ActivityObject) -> serde_json::Value {
    match object {
        ActivityObject::Object(value) => value.clone(),
        ActivityObject::Activity(activity) => serde_json::to_value(activity.as_ref()).unwrap_or(serde_json::Value::Null),
        ActivityObject::Reference(url) => serde_json::Value::String(url.to_string()),
    }
}

fn percent_slug(id: &Url) -> String {
    id.path_segments()
        .and_then(|mut segs| segs.next_back())
        .unwrap_or("activity")
        .to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

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

    fn accept(id: &str, actor: &str, object: serde_json::Value) -> Activity {
        serde_json::from_value(json!({
            "id": id,
            "actor": actor,
            "type": "Accept",
            "object": object,
        }))
        .expect("activity")
    }

    async fn pending_follow(data: &Data<MemoryStore>, id: &Url, follower: &Url, followed: &Url) {
        data.insert_follow(Follow {
            id: id.clone(),
            follower: follower.clone(),
            followed: followed.clone(),
            accepted: false,
            inserted_at: Utc::now(),
        })
        .await
        .expect("seed follow");
    }

    #[tokio::test]
    async fn accept_with_embedded_follow_marks_it_accepted() {
        let data = data();
        let follower = Url::parse("https://town.example/users/alice").expect("url");
        let followed = Url::parse("https://bazaar.example/users/bob").expect("url");
        let follow_id = Url::parse("https://town.example/activities/follow-1").expect("url");
        pending_follow(&data, &follow_id, &follower, &followed).await;

        let activity = accept(
            "https://bazaar.example/activities/accept-1",
            followed.as_str(),
            json!({
                "id": follow_id.as_str(),
                "actor": follower.as_str(),
                "type": "Follow",
                "object": followed.as_str(),
            }),
        );

        handle_accept(&data, &activity, &followed).await.expect("handled");

        let row = data.get_follow_by_id(&follow_id).await.expect("query").expect("row");
        assert!(row.accepted);
    }

    #[tokio::test]
    async fn accept_with_bare_id_object_marks_it_accepted() {
        let data = data();
        let follower = Url::parse("https://town.example/users/alice").expect("url");
        let followed = Url::parse("https://bazaar.example/users/bob").expect("url");
        let follow_id = Url::parse("https://town.example/activities/follow-2").expect("url");
        pending_follow(&data, &follow_id, &follower, &followed).await;

        let activity = accept(
            "https://bazaar.example/activities/accept-2",
            followed.as_str(),
            json!(follow_id.as_str()),
        );

        handle_accept(&data, &activity, &followed).await.expect("handled");

        let row = data.get_follow_by_id(&follow_id).await.expect("query").expect("row");
        assert!(row.accepted);
    }

    #[tokio::test]
    async fn accept_from_a_different_host_than_followed_is_rejected() {
        let data = data();
        let follower = Url::parse("https://town.example/users/alice").expect("url");
        let followed = Url::parse("https://bazaar.example/users/bob").expect("url");
        let follow_id = Url::parse("https://town.example/activities/follow-3").expect("url");
        pending_follow(&data, &follow_id, &follower, &followed).await;

        let impostor = Url::parse("https://market.example/users/eve").expect("url");
        let activity = accept(
            "https://market.example/activities/accept-3",
            impostor.as_str(),
            json!(follow_id.as_str()),
        );

        let err = handle_accept(&data, &activity, &impostor).await.unwrap_err();
        assert!(matches!(err, Error::CrossOriginForgery));
    }

    #[tokio::test]
    async fn accept_for_an_unknown_follow_is_a_noop() {
        let data = data();
        let followed = Url::parse("https://bazaar.example/users/bob").expect("url");
        let activity = accept(
            "https://bazaar.example/activities/accept-4",
            followed.as_str(),
            json!("https://town.example/activities/never-sent"),
        );

        handle_accept(&data, &activity, &followed).await.expect("handled");
    }
}
