//! Capped GET-and-deserialize, used by the resolver, webfinger client and
//! follower syncer (spec §4.1 step 8/9, §4.5 step 3). Every remote fetch in
//! this engine goes through here so the body-size cap is enforced in one
//! place.

use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::Error;

/// Performs a GET request to `url`, rejecting responses over `max_bytes`,
/// and deserializes the body as JSON.
///
/// Maps `404`/`410` to [`Error::ActorGone`] so callers can trigger
/// gone-handling uniformly, regardless of whether the missing resource is
/// an actor document or a webfinger record.
pub async fn fetch_json_capped<T: DeserializeOwned>(
    client: &ClientWithMiddleware,
    url: &Url,
    accept: &'static str,
    max_bytes: usize,
) -> Result<T, Error> {
    let response = client
        .get(url.clone())
        .header("accept", accept)
        .send()
        .await?;

    let status = response.status();
    if status.as_u16() == 404 || status.as_u16() == 410 {
        return Err(Error::ActorGone(url.clone()));
    }
    if !status.is_success() {
        return Err(Error::Other(format!("unexpected status {status} fetching {url}")));
    }

    if let Some(len) = response.content_length() {
        if len as usize > max_bytes {
            return Err(Error::BodyTooLarge(max_bytes));
        }
    }

    let bytes = response.bytes().await?;
    if bytes.len() > max_bytes {
        return Err(Error::BodyTooLarge(max_bytes));
    }

    serde_json::from_slice(&bytes).map_err(Error::Malformed)
}
