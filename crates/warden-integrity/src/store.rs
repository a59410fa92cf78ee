use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use warden_types::fsutil::write_atomic;
use warden_types::{ArtifactRecord, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    records: BTreeMap<String, ArtifactRecord>,
}

/// Persisted artifact baselines. Callers serialize access through one lock.
#[derive(Debug)]
pub struct IntegrityStore {
    path: PathBuf,
    records: BTreeMap<String, ArtifactRecord>,
}

impl IntegrityStore {
    /// Load from `path`; a missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str::<StoreFile>(&text)?.records
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, records })
    }

    pub fn save(&self) -> Result<()> {
        write_atomic(&self.path, &self.encode()?)
    }

    /// The bytes `save` writes, for callers that persist off the async runtime.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let file = StoreFile {
            records: self.records.clone(),
        };
        Ok(serde_json::to_vec_pretty(&file)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, name: &str) -> Option<&ArtifactRecord> {
        self.records.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArtifactRecord> {
        self.records.get_mut(name)
    }

    pub fn insert(&mut self, record: ArtifactRecord) {
        self.records.insert(record.name.clone(), record);
    }

    pub fn records(&self) -> impl Iterator<Item = &ArtifactRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
