use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;

use warden_security::MasterKey;
use warden_types::{Result, WardenError};

pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// AEAD under a key scoped to one snapshot version. Each blob is
/// `nonce || ciphertext`, with the file's relative path as associated data
/// so blobs cannot be swapped between paths.
pub struct SnapshotCipher {
    cipher: ChaCha20Poly1305,
}

impl SnapshotCipher {
    pub fn for_snapshot(master: &MasterKey, snapshot_id: &str, version: u64) -> Result<Self> {
        let key = master.derive(format!("warden-snapshot:{snapshot_id}:{version}").as_bytes())?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
        })
    }

    pub fn seal(&self, rel_path: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: rel_path.as_bytes(),
                },
            )
            .map_err(|_| WardenError::Crypto(format!("encrypting {rel_path} failed")))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn open(&self, rel_path: &str, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(WardenError::SnapshotVerification(format!(
                "{rel_path}: blob truncated"
            )));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: rel_path.as_bytes(),
                },
            )
            .map_err(|_| {
                WardenError::SnapshotVerification(format!("{rel_path}: authentication failed"))
            })
    }
}
