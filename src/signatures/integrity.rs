//! Optional Ed25519 integrity proofs over the activity body (spec §4.2).
//!
//! These are separate from the HTTP Signature: the HTTP Signature
//! authenticates the *request*, the integrity proof authenticates the
//! *document* itself so it remains verifiable after being relayed through a
//! shared inbox or forwarded by a third party.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde_json::{json, Value};

use crate::error::Error;

/// Canonicalizes `document` by stripping any existing `proof` field and
/// serializing with sorted keys, so signer and verifier hash the same bytes
/// regardless of field order on the wire.
fn canonicalize(document: &Value) -> Vec<u8> {
    let mut map = document
        .as_object()
        .cloned()
        .unwrap_or_default();
    map.remove("proof");
    let sorted: std::collections::BTreeMap<String, Value> = map.into_iter().collect();
    serde_json::to_vec(&sorted).unwrap_or_default()
}

/// Signs `document` with `private_key` (base64, raw 32 bytes) and returns a
/// detached proof object suitable for attaching as `document["proof"]`.
pub fn sign_proof(document: &Value, private_key_b64: &str, verification_method: &str) -> Result<Value, Error> {
    let bytes = STANDARD
        .decode(private_key_b64)
        .map_err(|e| Error::Key(e.to_string()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Key("ed25519 private key must be 32 bytes".to_string()))?;
    let signing_key = SigningKey::from_bytes(&bytes);
    let message = canonicalize(document);
    let signature = signing_key.sign(&message);
    Ok(json!({
        "type": "Ed25519Signature2020",
        "verificationMethod": verification_method,
        "proofValue": STANDARD.encode(signature.to_bytes()),
    }))
}

/// Verifies `document["proof"]` against `public_key` (base64, raw 32 bytes).
///
/// Fails closed: a missing, malformed, or non-matching proof is always an
/// error; callers decide whether proofs are mandatory for a given activity.
pub fn verify_proof(document: &Value, public_key_b64: &str) -> Result<(), Error> {
    let proof = document.get("proof").ok_or(Error::InvalidProof)?;
    let proof_value = proof
        .get("proofValue")
        .and_then(Value::as_str)
        .ok_or(Error::InvalidProof)?;
    let signature_bytes = STANDARD.decode(proof_value).map_err(|_| Error::InvalidProof)?;
    let signature_bytes: [u8; 64] = signature_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::InvalidProof)?;
    let signature = Signature::from_bytes(&signature_bytes);

    let key_bytes = STANDARD.decode(public_key_b64).map_err(|_| Error::InvalidProof)?;
    let key_bytes: [u8; 32] = key_bytes.as_slice().try_into().map_err(|_| Error::InvalidProof)?;
    let verifying_key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| Error::InvalidProof)?;

    let message = canonicalize(document);
    verifying_key
        .verify(&message, &signature)
        .map_err(|_| Error::InvalidProof)
}
