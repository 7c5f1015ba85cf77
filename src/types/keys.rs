//! Key generation and lazy, memoized PEM parsing (spec §3, §9).

use rsa::{
    pkcs1::{EncodeRsaPrivateKey, EncodeRsaPublicKey},
    RsaPrivateKey,
    RsaPublicKey,
};

use crate::error::Error;

/// A freshly generated RSA-2048 keypair in PEM form, for provisioning a new
/// local actor. Ed25519 is generated separately since not every actor needs
/// an assertion method (spec §4.2's integrity proofs are optional).
pub struct Keypair {
    /// PEM-encoded PKCS#1 private key.
    pub private_key: String,
    /// PEM-encoded PKCS#1 public key.
    pub public_key: String,
}

/// Generates a new RSA-2048 keypair suitable for HTTP Signatures.
pub fn generate_actor_keypair() -> Result<Keypair, Error> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048).map_err(|e| Error::Key(e.to_string()))?;
    let public = RsaPublicKey::from(&private);
    let private_pem = private
        .to_pkcs1_pem(Default::default())
        .map_err(|e| Error::Key(e.to_string()))?
        .to_string();
    let public_pem = public
        .to_pkcs1_pem(Default::default())
        .map_err(|e| Error::Key(e.to_string()))?;
    Ok(Keypair {
        private_key: private_pem,
        public_key: public_pem,
    })
}

/// Generates a new Ed25519 keypair for an integrity-proof assertion method.
/// Returns `(private_key_multibase, public_key_multibase)`.
pub fn generate_assertion_keypair() -> (String, String) {
    use ed25519_dalek::SigningKey;
    let mut rng = rand::rngs::OsRng;
    let signing_key = SigningKey::generate(&mut rng);
    let private = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        signing_key.to_bytes(),
    );
    let public = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        signing_key.verifying_key().to_bytes(),
    );
    (private, public)
}

/// Parses a PEM-encoded PKCS#1 RSA private key.
///
/// Parsing is the expensive part of signing (not the RSA operation itself
/// for our key sizes), which is why callers memoize the parsed key per actor
/// rather than calling this once per outbound request.
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, Error> {
    use rsa::pkcs1::DecodeRsaPrivateKey;
    RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| Error::Key(e.to_string()))
}

/// Parses a PEM-encoded PKCS#1 RSA public key.
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, Error> {
    use rsa::pkcs1::DecodeRsaPublicKey;
    RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| Error::Key(e.to_string()))
}
