use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use warden_types::{Digest, LedgerEvent, Result};

use crate::signer::LedgerSigner;

/// One signed, hash-linked ledger record. Serialized as a single JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub index: u64,
    pub entry_id: Uuid,
    pub prev_hash: Digest,
    pub event: LedgerEvent,
    pub timestamp: DateTime<Utc>,
    pub monotonic_counter: u64,
    pub current_hash: Digest,
    pub signature: String,
    pub signer: String,
}

/// Fields covered by `current_hash`.
#[derive(Serialize)]
struct HashedFields<'a> {
    index: u64,
    entry_id: &'a Uuid,
    prev_hash: &'a Digest,
    event: &'a LedgerEvent,
    timestamp: &'a DateTime<Utc>,
    monotonic_counter: u64,
    signer: &'a str,
}

/// Reference to an appended entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryRef {
    pub index: u64,
    pub current_hash: Digest,
    pub monotonic_counter: u64,
}

impl LedgerEntry {
    /// Build, hash and sign the entry that follows `prev_hash` at `index`.
    pub fn seal(
        index: u64,
        prev_hash: Digest,
        event: LedgerEvent,
        monotonic_counter: u64,
        signer: &LedgerSigner,
    ) -> Result<Self> {
        let mut entry = Self {
            index,
            entry_id: Uuid::new_v4(),
            prev_hash,
            event,
            timestamp: Utc::now(),
            monotonic_counter,
            current_hash: Digest::ZERO,
            signature: String::new(),
            signer: signer.public_hex().to_string(),
        };
        entry.current_hash = entry.compute_hash()?;
        entry.signature = signer.sign(&entry.current_hash);
        Ok(entry)
    }

    /// SHA-256 over the canonical JSON of every field except the hash and signature.
    pub fn compute_hash(&self) -> Result<Digest> {
        let fields = HashedFields {
            index: self.index,
            entry_id: &self.entry_id,
            prev_hash: &self.prev_hash,
            event: &self.event,
            timestamp: &self.timestamp,
            monotonic_counter: self.monotonic_counter,
            signer: &self.signer,
        };
        let value = canonicalize(serde_json::to_value(fields)?);
        Ok(Digest::of(&serde_json::to_vec(&value)?))
    }

    pub fn entry_ref(&self) -> EntryRef {
        EntryRef {
            index: self.index,
            current_hash: self.current_hash,
            monotonic_counter: self.monotonic_counter,
        }
    }

    pub fn to_line(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Rebuild every object with keys in sorted order, independent of the map backing serde_json uses.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<(String, Value)> = map.into_iter().collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in pairs {
                sorted.insert(k, canonicalize(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
