//! Authenticated dispatch: HMAC-SHA256 signatures over task bodies.
//!
//! The dispatcher signs every POST body; the orchestrator and worker
//! endpoints verify before acting, so only the queue can drive them.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex-encoded signature.
pub const SIGNATURE_HEADER: &str = "x-evosolve-signature";

/// Errors from signature verification.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("signature is not valid hex: {0}")]
    InvalidHex(String),

    #[error("signature verification failed")]
    Mismatch,

    #[error("missing dispatch secret")]
    MissingSecret,
}

/// Shared secret for signing and verifying dispatched tasks.
#[derive(Debug, Clone)]
pub struct DispatchAuth {
    secret: Vec<u8>,
}

impl DispatchAuth {
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Read the secret from `EVOSOLVE_DISPATCH_SECRET` (hex-encoded).
    pub fn from_env() -> Result<Self, AuthError> {
        let secret_hex =
            std::env::var("EVOSOLVE_DISPATCH_SECRET").map_err(|_| AuthError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| AuthError::InvalidHex(e.to_string()))?;
        Ok(Self::new(secret))
    }

    /// Sign a request body, returning the hex signature for
    /// [`SIGNATURE_HEADER`].
    pub fn sign(&self, body: &[u8]) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a body against a hex signature, in constant time.
    pub fn verify(&self, body: &[u8], signature_hex: &str) -> Result<(), AuthError> {
        let provided =
            hex::decode(signature_hex).map_err(|e| AuthError::InvalidHex(e.to_string()))?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(body);
        mac.verify_slice(&provided).map_err(|_| AuthError::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> DispatchAuth {
        DispatchAuth::new(b"dispatch-test-secret".to_vec())
    }

    #[test]
    fn sign_verify_roundtrip() {
        let auth = auth();
        let body = br#"{"jobId":"job-1","checkAttempt":0}"#;
        let sig = auth.sign(body);
        assert_eq!(sig.len(), 64);
        auth.verify(body, &sig).expect("signature should verify");
    }

    #[test]
    fn tampered_body_is_rejected() {
        let auth = auth();
        let sig = auth.sign(br#"{"jobId":"job-1"}"#);
        let result = auth.verify(br#"{"jobId":"job-2"}"#, &sig);
        assert!(matches!(result.unwrap_err(), AuthError::Mismatch));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let body = b"payload";
        let sig = auth().sign(body);
        let other = DispatchAuth::new(b"different-secret".to_vec());
        assert!(other.verify(body, &sig).is_err());
    }

    #[test]
    fn non_hex_signature_is_rejected() {
        let result = auth().verify(b"payload", "not-hex!");
        assert!(matches!(result.unwrap_err(), AuthError::InvalidHex(_)));
    }
}
