//! axum wiring for the two inbound endpoints, `POST /inbox/{name}` and the
//! shared `POST /inbox` (spec §4.3, §7 status mapping).

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{FromRequest, Path, Request, State},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::{
    config::Data,
    error::Error,
    inbox::{verify_and_enqueue, IngressOutcome},
    resolver::Resolver,
    store::Store,
};

/// Builds a router exposing `/inbox` and `/inbox/:name`, sharing `data`/`resolver` as state.
pub fn router<S: Store + Clone + Send + Sync + 'static>(data: Data<S>, resolver: Resolver<S>) -> Router {
    let state = InboxState { data, resolver: Arc::new(resolver) };
    Router::new()
        .route("/inbox", post(shared_inbox::<S>))
        .route("/inbox/:name", post(personal_inbox::<S>))
        .with_state(state)
}

#[derive(Clone)]
struct InboxState<S: Store + Clone + Send + Sync + 'static> {
    data: Data<S>,
    resolver: Arc<Resolver<S>>,
}

/// Everything a `FromRequest` extraction needs before body parsing happens.
struct ActivityRequest {
    headers: HeaderMap,
    method: Method,
    uri: Uri,
    body: Bytes,
}

#[async_trait::async_trait]
impl<S> FromRequest<S> for ActivityRequest
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let bytes = Bytes::from_request(Request::from_parts(parts.clone(), body), state)
            .await
            .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()).into_response())?;
        Ok(Self {
            headers: parts.headers,
            method: parts.method,
            uri: parts.uri,
            body: bytes,
        })
    }
}

async fn shared_inbox<S: Store + Clone + Send + Sync + 'static>(
    State(state): State<InboxState<S>>,
    request: ActivityRequest,
) -> Response {
    handle(&state, "/inbox", request).await
}

async fn personal_inbox<S: Store + Clone + Send + Sync + 'static>(
    State(state): State<InboxState<S>>,
    Path(name): Path<String>,
    request: ActivityRequest,
) -> Response {
    handle(&state, &format!("/inbox/{name}"), request).await
}

async fn handle<S: Store + Clone + Send + Sync + 'static>(
    state: &InboxState<S>,
    path: &str,
    request: ActivityRequest,
) -> Response {
    let outcome = verify_and_enqueue(
        &state.data,
        &state.resolver,
        path,
        &request.headers,
        &request.method,
        &request.uri,
        request.body,
    )
    .await;

    match outcome {
        Ok(IngressOutcome::Enqueued | IngressOutcome::Duplicate | IngressOutcome::SilentlyDropped) => {
            StatusCode::ACCEPTED.into_response()
        }
        Err(err) => status_for(&err).into_response(),
    }
}

/// Maps an [`Error`] to the response code a peer's retry logic expects
/// (spec §7): 401 bad signature, 403 policy, 404 missing/gone, 400
/// malformed, 500 integrity/internal failures.
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        Error::BlockedDomain(_) | Error::SuspendedActor(_) | Error::YoungActor(_) | Error::CrossOriginForgery => {
            StatusCode::FORBIDDEN
        }
        Error::NoLocalActor(_) | Error::ActorNotCached | Error::ActorGone(_) | Error::WebfingerResolveFailed(_) => {
            StatusCode::NOT_FOUND
        }
        Error::InvalidScheme(_) | Error::InvalidHost(_) | Error::InvalidId(_) | Error::Malformed(_) | Error::BodyTooLarge(_) | Error::Url(_) => {
            StatusCode::BAD_REQUEST
        }
        Error::InvalidProof
        | Error::Transport(_)
        | Error::Middleware(_)
        | Error::Sign(_)
        | Error::Key(_)
        | Error::Store(_)
        | Error::Timeout
        | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_spec() {
        assert_eq!(status_for(&Error::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&Error::CrossOriginForgery), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&Error::ActorNotCached), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&Error::BodyTooLarge(10)), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&Error::InvalidProof), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
