use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest as _, Sha256};
use walkdir::WalkDir;

use warden_types::{Digest, Result, WardenError};

/// How an artifact is laid out on disk. Resolved once at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactKind {
    /// A directory of shards and metadata.
    Checkpoint(PathBuf),
    /// A single file.
    Blob(PathBuf),
}

impl ArtifactKind {
    pub fn resolve(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = std::fs::metadata(&path)
            .map_err(|_| WardenError::ArtifactNotFound(path.display().to_string()))?;
        if meta.is_dir() {
            Ok(ArtifactKind::Checkpoint(path))
        } else {
            Ok(ArtifactKind::Blob(path))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            ArtifactKind::Checkpoint(p) | ArtifactKind::Blob(p) => p,
        }
    }

    /// Content digest. Independent of where the artifact lives.
    pub fn digest(&self) -> Result<Digest> {
        match self {
            ArtifactKind::Blob(p) => hash_file(p),
            ArtifactKind::Checkpoint(p) => hash_directory(p),
        }
    }
}

pub fn hash_file(path: &Path) -> Result<Digest> {
    let mut file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => WardenError::ArtifactNotFound(path.display().to_string()),
        _ => WardenError::Io(e),
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Digest::from_bytes(hasher.finalize().into()))
}

/// Digest over sorted (relative path, content digest) tuples.
pub fn hash_directory(dir: &Path) -> Result<Digest> {
    if !dir.is_dir() {
        return Err(WardenError::ArtifactNotFound(dir.display().to_string()));
    }
    let mut tuples: Vec<(String, Digest)> = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| WardenError::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| WardenError::Internal(e.to_string()))?;
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        tuples.push((rel, hash_file(entry.path())?));
    }
    tuples.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (rel, digest) in &tuples {
        hasher.update((rel.len() as u64).to_be_bytes());
        hasher.update(rel.as_bytes());
        hasher.update(digest.as_bytes());
    }
    Ok(Digest::from_bytes(hasher.finalize().into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_hash_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("renamed.bin");
        std::fs::write(&a, b"weights").unwrap();
        std::fs::write(&b, b"weights").unwrap();
        assert_eq!(hash_file(&a).unwrap(), hash_file(&b).unwrap());
        assert_eq!(hash_file(&a).unwrap(), Digest::of(b"weights"));
    }

    #[test]
    fn test_directory_hash_independent_of_creation_order() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();

        std::fs::create_dir_all(one.path().join("shards")).unwrap();
        std::fs::write(one.path().join("config.json"), b"{}").unwrap();
        std::fs::write(one.path().join("shards/0"), b"zero").unwrap();
        std::fs::write(one.path().join("shards/1"), b"one").unwrap();

        std::fs::create_dir_all(two.path().join("shards")).unwrap();
        std::fs::write(two.path().join("shards/1"), b"one").unwrap();
        std::fs::write(two.path().join("shards/0"), b"zero").unwrap();
        std::fs::write(two.path().join("config.json"), b"{}").unwrap();

        assert_eq!(
            hash_directory(one.path()).unwrap(),
            hash_directory(two.path()).unwrap()
        );
    }

    #[test]
    fn test_directory_hash_covers_paths() {
        let one = tempfile::tempdir().unwrap();
        let two = tempfile::tempdir().unwrap();
        std::fs::write(one.path().join("a"), b"x").unwrap();
        std::fs::write(two.path().join("b"), b"x").unwrap();
        assert_ne!(
            hash_directory(one.path()).unwrap(),
            hash_directory(two.path()).unwrap()
        );
    }

    #[test]
    fn test_resolve_kind() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.bin");
        std::fs::write(&file, b"w").unwrap();
        assert!(matches!(ArtifactKind::resolve(&file).unwrap(), ArtifactKind::Blob(_)));
        assert!(matches!(
            ArtifactKind::resolve(dir.path()).unwrap(),
            ArtifactKind::Checkpoint(_)
        ));
        assert!(matches!(
            ArtifactKind::resolve(dir.path().join("missing")),
            Err(WardenError::ArtifactNotFound(_))
        ));
    }
}
