use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tracing::info;

use warden_types::{Digest, Result, WardenError};

const SIGNING_KEY_FILE: &str = "signing.key";
const VERIFYING_KEY_FILE: &str = "signing.pub";
const MASTER_KEY_FILE: &str = "master.key";

pub fn generate_signing_key() -> SigningKey {
    let mut secret = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut secret);
    SigningKey::from_bytes(&secret)
}

/// Sign the raw bytes of a digest. Returns the hex-encoded signature.
pub fn sign_digest(key: &SigningKey, digest: &Digest) -> String {
    hex::encode(key.sign(digest.as_bytes()).to_bytes())
}

pub fn verify_digest(key: &VerifyingKey, digest: &Digest, signature_hex: &str) -> Result<()> {
    let bytes = hex::decode(signature_hex)
        .map_err(|e| WardenError::SignatureInvalid(format!("signature is not hex: {e}")))?;
    let sig_bytes: [u8; 64] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| WardenError::SignatureInvalid("invalid signature length".into()))?;
    let signature = Signature::from_bytes(&sig_bytes);
    key.verify(digest.as_bytes(), &signature)
        .map_err(|e| WardenError::SignatureInvalid(e.to_string()))
}

/// Symmetric root key. Per-snapshot keys are derived from it.
#[derive(Clone)]
pub struct MasterKey([u8; 32]);

impl MasterKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// HMAC-SHA256 of `context` under the master key.
    pub fn derive(&self, context: &[u8]) -> Result<[u8; 32]> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.0)
            .map_err(|e| WardenError::Crypto(e.to_string()))?;
        mac.update(context);
        Ok(mac.finalize().into_bytes().into())
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey(..)")
    }
}

/// Key material held as hex files in one directory.
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(SIGNING_KEY_FILE).exists() && self.dir.join(MASTER_KEY_FILE).exists()
    }

    /// Create a fresh signing key pair and master key. Refuses to clobber existing keys.
    pub fn generate(&self, overwrite: bool) -> Result<VerifyingKey> {
        if self.exists() && !overwrite {
            return Err(WardenError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("keys already present in {}", self.dir.display()),
            )));
        }
        fs::create_dir_all(&self.dir)?;
        let signing = generate_signing_key();
        let master = MasterKey::generate();
        write_secret(&self.dir.join(SIGNING_KEY_FILE), &hex::encode(signing.to_bytes()))?;
        write_secret(&self.dir.join(MASTER_KEY_FILE), &hex::encode(master.0))?;
        fs::write(
            self.dir.join(VERIFYING_KEY_FILE),
            hex::encode(signing.verifying_key().to_bytes()),
        )?;
        info!(dir = %self.dir.display(), "Generated key material");
        Ok(signing.verifying_key())
    }

    pub fn load_signing_key(&self) -> Result<SigningKey> {
        let bytes = read_key_file(&self.dir.join(SIGNING_KEY_FILE))?;
        Ok(SigningKey::from_bytes(&bytes))
    }

    /// The public half. Falls back to deriving it from the signing key.
    pub fn load_verifying_key(&self) -> Result<VerifyingKey> {
        let path = self.dir.join(VERIFYING_KEY_FILE);
        if path.exists() {
            let bytes = read_key_file(&path)?;
            return VerifyingKey::from_bytes(&bytes)
                .map_err(|e| WardenError::KeyUnavailable(format!("{}: {e}", path.display())));
        }
        Ok(self.load_signing_key()?.verifying_key())
    }

    pub fn load_master_key(&self) -> Result<MasterKey> {
        Ok(MasterKey(read_key_file(&self.dir.join(MASTER_KEY_FILE))?))
    }
}

/// Parse a hex verifying key, as handed out for offline ledger checks.
pub fn parse_verifying_key(hex_str: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| WardenError::KeyUnavailable(format!("verifying key is not hex: {e}")))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| WardenError::KeyUnavailable("verifying key must be 32 bytes".into()))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| WardenError::KeyUnavailable(e.to_string()))
}

fn read_key_file(path: &Path) -> Result<[u8; 32]> {
    let text = fs::read_to_string(path)
        .map_err(|e| WardenError::KeyUnavailable(format!("{}: {e}", path.display())))?;
    let bytes = hex::decode(text.trim())
        .map_err(|e| WardenError::KeyUnavailable(format!("{}: {e}", path.display())))?;
    bytes.as_slice().try_into().map_err(|_| {
        WardenError::KeyUnavailable(format!("{}: expected 32 bytes", path.display()))
    })
}

fn write_secret(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_digest() {
        let key = generate_signing_key();
        let digest = Digest::of(b"entry");
        let sig = sign_digest(&key, &digest);
        assert!(verify_digest(&key.verifying_key(), &digest, &sig).is_ok());
        assert!(verify_digest(&key.verifying_key(), &Digest::of(b"other"), &sig).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let key = generate_signing_key();
        let other = generate_signing_key();
        let digest = Digest::of(b"entry");
        let sig = sign_digest(&key, &digest);
        assert!(matches!(
            verify_digest(&other.verifying_key(), &digest, &sig),
            Err(WardenError::SignatureInvalid(_))
        ));
        assert!(verify_digest(&key.verifying_key(), &digest, "abcd").is_err());
    }

    #[test]
    fn test_keystore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys"));
        assert!(!store.exists());
        let vk = store.generate(false).unwrap();
        assert!(store.exists());
        assert_eq!(store.load_verifying_key().unwrap(), vk);
        assert_eq!(store.load_signing_key().unwrap().verifying_key(), vk);
        assert!(store.load_master_key().is_ok());
        assert!(store.generate(false).is_err());
    }

    #[test]
    fn test_missing_keys_are_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        assert!(matches!(
            store.load_signing_key(),
            Err(WardenError::KeyUnavailable(_))
        ));
    }

    #[test]
    fn test_master_key_derivation_is_context_bound() {
        let master = MasterKey::from_bytes([7u8; 32]);
        assert_eq!(master.derive(b"a@1").unwrap(), master.derive(b"a@1").unwrap());
        assert_ne!(master.derive(b"a@1").unwrap(), master.derive(b"a@2").unwrap());
        assert_eq!(format!("{master:?}"), "MasterKey(..)");
    }

    #[test]
    fn test_parse_verifying_key() {
        let key = generate_signing_key();
        let hex_str = hex::encode(key.verifying_key().to_bytes());
        assert_eq!(parse_verifying_key(&hex_str).unwrap(), key.verifying_key());
        assert!(parse_verifying_key("00").is_err());
    }
}
