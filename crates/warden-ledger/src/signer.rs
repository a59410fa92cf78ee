use ed25519_dalek::{SigningKey, VerifyingKey};

use warden_security::{generate_signing_key, sign_digest, verify_digest};
use warden_types::{Digest, Result};

/// Holds the ledger's ed25519 signing key.
pub struct LedgerSigner {
    key: SigningKey,
    public_hex: String,
}

impl LedgerSigner {
    pub fn new(key: SigningKey) -> Self {
        let public_hex = hex::encode(key.verifying_key().to_bytes());
        Self { key, public_hex }
    }

    pub fn generate() -> Self {
        Self::new(generate_signing_key())
    }

    pub fn sign(&self, digest: &Digest) -> String {
        sign_digest(&self.key, digest)
    }

    pub fn verify(&self, digest: &Digest, signature_hex: &str) -> Result<()> {
        verify_digest(&self.key.verifying_key(), digest, signature_hex)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn public_hex(&self) -> &str {
        &self.public_hex
    }
}

impl std::fmt::Debug for LedgerSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerSigner")
            .field("public", &self.public_hex)
            .finish()
    }
}
