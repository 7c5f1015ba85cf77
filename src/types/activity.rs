//! Activity documents and the tagged `object`/`target` variant (spec §3, §9).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// The subset of ActivityStreams activity types the engine inspects (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ActivityType {
    /// A new object was published.
    Create,
    /// An existing object was updated.
    Update,
    /// An object or actor was removed.
    Delete,
    /// A follow request.
    Follow,
    /// Acceptance of a prior activity (typically a Follow).
    Accept,
    /// Reversal of a prior activity (typically a Follow).
    Undo,
    /// A boost/repost, optionally wrapping a nested `Create`.
    Announce,
    /// A favorite/like.
    Like,
    /// An instance- or actor-level block.
    Block,
    /// An actor or object moved to a new id.
    Move,
    /// Anything not in this list; logged and discarded per spec §4.3.
    #[serde(other)]
    Unknown,
}

/// `to`/`cc` are unordered sets on the data model (spec §3) but the wire
/// serializes them as arrays; this wrapper preserves insertion order for
/// round-tripping while deduplicating, since `to`/`cc` use is set-membership
/// only (recipient expansion, "is this addressed to Public").
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressingSet(Vec<Url>);

impl AddressingSet {
    /// Builds a set from a list, deduplicating while preserving first-seen order.
    pub fn new(items: Vec<Url>) -> Self {
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if seen.insert(item.clone()) {
                out.push(item);
            }
        }
        AddressingSet(out)
    }

    /// Iterates the members in wire order.
    pub fn iter(&self) -> impl Iterator<Item = &Url> {
        self.0.iter()
    }

    /// True if `url` is a member.
    pub fn contains(&self, url: &Url) -> bool {
        self.0.iter().any(|u| u == url)
    }

    /// True if the well-known Public collection is addressed.
    pub fn is_public(&self) -> bool {
        self.0.iter().any(|u| u.as_str() == PUBLIC_ADDRESS)
    }
}

impl Serialize for AddressingSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AddressingSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = OneOrMany::deserialize(deserializer)?;
        Ok(AddressingSet::new(raw.into_vec()))
    }
}

/// Many ActivityPub fields accept either a single value or an array.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    /// A single bare value.
    One(T),
    /// An explicit array of values.
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(v) => vec![v],
            OneOrMany::Many(v) => v,
        }
    }
}

/// The well-known public addressing constant (spec §4.4).
pub static PUBLIC_ADDRESS: &str = "https://www.w3.org/ns/activitystreams#Public";

/// `object`/`target` fields are polymorphic on the wire: an embedded object,
/// an embedded nested activity (Announce wrapping Create), or a bare id
/// string. Modeled as a tagged variant with an explicit shape-inspecting
/// deserializer rather than leaning on serde's `untagged`, which cannot
/// disambiguate "object with a `type` that happens to be an activity kind"
/// from "plain object" without looking at the `type` field first.
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum ActivityObject {
    /// A bare identifier, e.g. `{"object": "https://example.com/notes/1"}`.
    Reference(Url),
    /// A nested activity, e.g. an `Announce` wrapping a `Create`.
    Activity(Box<Activity>),
    /// An embedded non-activity object (a Note, Person, Tombstone, ...).
    Object(Value),
}

impl ActivityObject {
    /// Best-effort `id` extraction regardless of which variant this is.
    pub fn id(&self) -> Option<Url> {
        match self {
            ActivityObject::Reference(url) => Some(url.clone()),
            ActivityObject::Activity(activity) => Some(activity.id.clone()),
            ActivityObject::Object(value) => value
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok()),
        }
    }

    /// Best-effort `attributedTo` extraction for embedded objects.
    pub fn attributed_to(&self) -> Option<Url> {
        match self {
            ActivityObject::Object(value) => value
                .get("attributedTo")
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok()),
            ActivityObject::Activity(activity) => Some(activity.actor.clone()),
            ActivityObject::Reference(_) => None,
        }
    }

    /// Best-effort `updated` extraction for embedded objects (used by the
    /// Update handler's stale-update check, spec §4.3/§9).
    pub fn updated(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        match self {
            ActivityObject::Object(value) => value
                .get("updated")
                .and_then(Value::as_str)
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc)),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for ActivityObject {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => {
                let url = Url::parse(&s).map_err(serde::de::Error::custom)?;
                Ok(ActivityObject::Reference(url))
            }
            Value::Object(ref map) => {
                let is_activity = map
                    .get("type")
                    .and_then(Value::as_str)
                    .map(is_activity_type_name)
                    .unwrap_or(false);
                if is_activity {
                    let activity: Activity =
                        serde_json::from_value(value).map_err(serde::de::Error::custom)?;
                    Ok(ActivityObject::Activity(Box::new(activity)))
                } else {
                    Ok(ActivityObject::Object(value))
                }
            }
            other => Err(serde::de::Error::custom(format!(
                "object/target must be a string or object, got {other}"
            ))),
        }
    }
}

fn is_activity_type_name(name: &str) -> bool {
    matches!(
        name,
        "Create"
            | "Update"
            | "Delete"
            | "Follow"
            | "Accept"
            | "Reject"
            | "Undo"
            | "Announce"
            | "Like"
            | "Block"
            | "Move"
    )
}

/// A signed JSON-LD activity document, received from another server or
/// produced locally (spec §3).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Activity {
    /// The activity's own identifier.
    pub id: Url,
    /// The authoring actor.
    pub actor: Url,
    /// ActivityStreams type tag.
    #[serde(rename = "type")]
    pub kind: ActivityType,
    /// Direct recipients.
    #[serde(default)]
    pub to: AddressingSet,
    /// Carbon-copy recipients.
    #[serde(default)]
    pub cc: AddressingSet,
    /// Optional object: embedded object, nested activity, or bare id.
    #[serde(default)]
    pub object: Option<ActivityObject>,
    /// Optional integrity proof over the canonicalized body (spec §4.2).
    #[serde(default, rename = "proof")]
    pub proof: Option<Value>,
}

impl Activity {
    /// The host component of `self.id`, used for origin checks (spec §4.3).
    pub fn id_host(&self) -> Option<&str> {
        self.id.host_str()
    }

    /// The host component of `self.actor`.
    pub fn actor_host(&self) -> Option<&str> {
        self.actor.host_str()
    }
}
