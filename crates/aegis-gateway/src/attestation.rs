//! Mobile app attestation verifier.
//!
//! The platform vendors own the real verification; this seam only carries
//! the three-way verdict. Policy (what `unsupported` means outside
//! development mode) lives with the caller, not here.

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationVerdict {
    Valid,
    Invalid,
    Unsupported,
}

#[async_trait]
pub trait AttestationVerifier: Send + Sync {
    async fn verify(&self, token: &str, platform: &str, nonce: &str) -> AttestationVerdict;
}

/// Fixed-verdict verifier for dev and scenario tests.
pub struct StaticAttestationVerifier {
    verdict: AttestationVerdict,
}

impl StaticAttestationVerifier {
    pub fn new(verdict: AttestationVerdict) -> Self {
        Self { verdict }
    }

    pub fn always_valid() -> Self {
        Self::new(AttestationVerdict::Valid)
    }
}

#[async_trait]
impl AttestationVerifier for StaticAttestationVerifier {
    async fn verify(&self, _token: &str, _platform: &str, _nonce: &str) -> AttestationVerdict {
        self.verdict
    }
}
