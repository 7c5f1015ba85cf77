//! HTTP Signatures and optional Ed25519 integrity proofs (spec §4.2).

mod http_signatures;
mod integrity;

pub use http_signatures::{base_headers, sign_request, verify_digest, verify_signature, SignedRequest};
pub use integrity::{sign_proof, verify_proof};
