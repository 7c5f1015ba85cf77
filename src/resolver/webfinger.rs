//! WebFinger discovery (spec §4.1 step 8, §6).

use serde::{Deserialize, Serialize};
use url::Url;

use crate::{config::Data, error::Error, http::fetch_json_capped, store::Store};

/// A WebFinger response body.
#[derive(Debug, Deserialize, Serialize)]
pub struct Webfinger {
    /// Echoes the `resource` query parameter.
    pub subject: String,
    /// Candidate links; the engine only cares about `rel=self` actor links.
    #[serde(default)]
    pub links: Vec<WebfingerLink>,
}

/// One link entry in a WebFinger response.
#[derive(Debug, Deserialize, Serialize)]
pub struct WebfingerLink {
    /// Link relation, e.g. `self`.
    pub rel: Option<String>,
    /// MIME type of the target.
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// The target URL.
    pub href: Option<Url>,
}

const ACTIVITY_JSON: &str = "application/activity+json";
const AS_LD_JSON: &str =
    r#"application/ld+json; profile="https://www.w3.org/ns/activitystreams""#;

/// Issues a WebFinger GET for `acct:{name}@{host}` and returns the first
/// usable `rel=self` actor link (spec §4.1 step 8).
///
/// Returns `Ok(None)` when the response parses but carries no usable link
/// (callers fall back to any existing cache, per spec); returns `Err` for
/// transport/size/gone failures.
pub async fn discover_link<S: Store + Clone>(
    data: &Data<S>,
    host: &str,
    name: &str,
) -> Result<Option<Url>, Error> {
    let protocol = if data.config.debug { "http" } else { "https" };
    let url = Url::parse(&format!(
        "{protocol}://{host}/.well-known/webfinger?resource=acct:{name}@{host}"
    ))?;

    let response: Webfinger = fetch_json_capped(
        &data.config.client,
        &url,
        "application/jrd+json, application/json",
        data.config.max_response_body_size,
    )
    .await?;

    let link = response
        .links
        .into_iter()
        .find(|link| {
            link.rel.as_deref() == Some("self")
                && matches!(link.kind.as_deref(), Some(ACTIVITY_JSON) | Some(AS_LD_JSON))
        })
        .and_then(|link| link.href);

    Ok(link)
}
