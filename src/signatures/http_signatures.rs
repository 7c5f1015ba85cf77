//! Signing and verifying HTTP Signatures over `(request-target) host date digest`
//! (spec §4.2), using the Cavage draft as the teacher does.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use http::{header::HeaderName, HeaderMap, HeaderValue, Method, Uri};
use http_signature_normalization::Config as VerifyConfig;
use http_signature_normalization_reqwest::prelude::{Config as SignConfig, SignExt};
use httpdate::fmt_http_date;
use reqwest_middleware::RequestBuilder;
use rsa::{
    pkcs1v15::{Signature, SigningKey, VerifyingKey},
    signature::{SignatureEncoding, Signer, Verifier},
    RsaPrivateKey,
    RsaPublicKey,
};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::Error;

/// A request that has been built, signed, and is ready to send.
pub struct SignedRequest(pub reqwest::Request);

/// Signs `request_builder` with `private_key`, covering
/// `(request-target) host date digest`, the header set spec §4.2 mandates.
///
/// `key_id` is the actor's published `publicKey.id`. `body` is used both as
/// the outgoing request body and to compute the `Digest` header; an empty
/// body yields the digest of the empty byte sequence.
pub async fn sign_request(
    request_builder: RequestBuilder,
    key_id: &str,
    body: Bytes,
    private_key: RsaPrivateKey,
    http_signature_compat: bool,
) -> Result<reqwest::Request, Error> {
    let config = if http_signature_compat {
        SignConfig::new().mastodon_compat()
    } else {
        SignConfig::new()
    };
    let request = request_builder
        .signature_with_digest(
            config,
            key_id.to_string(),
            Sha256::new(),
            body,
            move |signing_string| {
                let signing_key = SigningKey::<Sha256>::new(private_key.clone());
                let signature = signing_key.sign(signing_string.as_bytes());
                Ok::<_, Error>(STANDARD.encode(signature.to_bytes()))
            },
        )
        .await?;
    Ok(request)
}

/// Builds the standard header set (`Content-Type`, `Host`, `Date`) for an
/// outbound delivery to `inbox_url`, before signing is applied.
pub fn base_headers(inbox_url: &Url, content_type: &'static str) -> HeaderMap {
    let mut host = inbox_url.host_str().unwrap_or_default().to_string();
    if let Some(port) = inbox_url.port() {
        host = format!("{host}:{port}");
    }
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("content-type"),
        HeaderValue::from_static(content_type),
    );
    headers.insert(
        HeaderName::from_static("host"),
        HeaderValue::from_str(&host).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert(
        HeaderName::from_static("date"),
        HeaderValue::from_str(&fmt_http_date(std::time::SystemTime::now()))
            .expect("http-date is always a valid header value"),
    );
    headers
}

/// Verifies the `Digest` header against `body`'s SHA-256.
pub fn verify_digest(digest_header: Option<&HeaderValue>, body: &[u8]) -> Result<(), Error> {
    let header = digest_header
        .and_then(|h| h.to_str().ok())
        .ok_or(Error::Unauthorized)?;
    let (algorithm, expected) = header.split_once('=').ok_or(Error::Unauthorized)?;
    if !algorithm.eq_ignore_ascii_case("sha-256") {
        return Err(Error::Unauthorized);
    }
    let mut hasher = Sha256::new();
    hasher.update(body);
    let actual = STANDARD.encode(hasher.finalize());
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

/// Verifies the HTTP Signature on an incoming request against `public_key`.
///
/// If the request has no `Host` header, `local_domain` is substituted before
/// verification, per spec §4.2 (some clients omit it since the HTTP/1.1
/// connection already pinned it).
pub fn verify_signature<'a, H>(
    headers: H,
    method: &Method,
    uri: &Uri,
    public_key: &RsaPublicKey,
    local_domain: &str,
) -> Result<(), Error>
where
    H: IntoIterator<Item = (&'a HeaderName, &'a HeaderValue)>,
{
    let mut header_map = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.to_string(), value.to_string());
        }
    }
    header_map
        .entry("host".to_string())
        .or_insert_with(|| local_domain.to_string());

    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("");
    let config = VerifyConfig::new();
    let verified = config
        .begin_verify(method.as_str(), path_and_query, header_map)
        .map_err(|_| Error::Unauthorized)?
        .verify(|signature, signing_string| -> Result<bool, Error> {
            let decoded = STANDARD.decode(signature).map_err(|_| Error::Unauthorized)?;
            let signature = Signature::try_from(decoded.as_slice()).map_err(|_| Error::Unauthorized)?;
            let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
            Ok(verifying_key
                .verify(signing_string.as_bytes(), &signature)
                .is_ok())
        })
        .map_err(|_| Error::Unauthorized)?;

    if verified {
        Ok(())
    } else {
        Err(Error::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use crate::types::keys::{generate_actor_keypair, parse_private_key, parse_public_key};

    use super::*;

    #[test]
    fn digest_roundtrip() {
        let body = b"hello world";
        let mut hasher = Sha256::new();
        hasher.update(body);
        let expected = STANDARD.encode(hasher.finalize());
        let header = HeaderValue::from_str(&format!("sha-256={expected}")).expect("header");
        verify_signature_digest_ok(&header, body);
    }

    fn verify_signature_digest_ok(header: &HeaderValue, body: &[u8]) {
        assert!(verify_digest(Some(header), body).is_ok());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let keypair = generate_actor_keypair().expect("keypair");
        let private = parse_private_key(&keypair.private_key).expect("priv");
        let public = parse_public_key(&keypair.public_key).expect("pub");

        let signing_key = SigningKey::<Sha256>::new(private);
        let message = b"(request-target): post /inbox\nhost: example.com";
        let signature = signing_key.sign(message);

        let verifying_key = VerifyingKey::<Sha256>::new(public);
        assert!(verifying_key.verify(message, &signature).is_ok());
    }
}
