use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use warden_types::fsutil::write_atomic;
use warden_types::{Result, WardenError};

/// A counter that only moves forward and lives outside the ledger file,
/// so restoring an old ledger cannot rewind it.
pub trait MonotonicCounter: Send + Sync {
    fn current(&self) -> Result<u64>;

    /// Raise the counter to `value`. Lowering it is a rollback.
    fn advance_to(&self, value: u64) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCounter {
    value: AtomicU64,
}

impl InMemoryCounter {
    pub fn new(start: u64) -> Self {
        Self {
            value: AtomicU64::new(start),
        }
    }
}

impl MonotonicCounter for InMemoryCounter {
    fn current(&self) -> Result<u64> {
        Ok(self.value.load(Ordering::SeqCst))
    }

    fn advance_to(&self, value: u64) -> Result<()> {
        let prev = self.value.fetch_max(value, Ordering::SeqCst);
        if value < prev {
            return Err(WardenError::CounterRollback {
                ledger: value,
                attested: prev,
            });
        }
        Ok(())
    }
}

/// High-water counter persisted in its own file.
#[derive(Debug)]
pub struct FileCounter {
    path: PathBuf,
    value: Mutex<u64>,
}

impl FileCounter {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let value = if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            text.trim().parse::<u64>().map_err(|e| {
                WardenError::KeyUnavailable(format!("counter {}: {e}", path.display()))
            })?
        } else {
            0
        };
        Ok(Self {
            path,
            value: Mutex::new(value),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MonotonicCounter for FileCounter {
    fn current(&self) -> Result<u64> {
        self.value
            .lock()
            .map(|v| *v)
            .map_err(|_| WardenError::Internal("counter lock poisoned".into()))
    }

    fn advance_to(&self, value: u64) -> Result<()> {
        let mut guard = self
            .value
            .lock()
            .map_err(|_| WardenError::Internal("counter lock poisoned".into()))?;
        if value < *guard {
            return Err(WardenError::CounterRollback {
                ledger: value,
                attested: *guard,
            });
        }
        if value == *guard {
            return Ok(());
        }
        write_atomic(&self.path, value.to_string().as_bytes())?;
        *guard = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counter_refuses_rewind() {
        let counter = InMemoryCounter::new(0);
        counter.advance_to(5).unwrap();
        assert_eq!(counter.current().unwrap(), 5);
        assert!(matches!(
            counter.advance_to(3),
            Err(WardenError::CounterRollback { .. })
        ));
        assert_eq!(counter.current().unwrap(), 5);
    }

    #[test]
    fn test_file_counter_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.counter");
        {
            let counter = FileCounter::open(&path).unwrap();
            assert_eq!(counter.current().unwrap(), 0);
            counter.advance_to(42).unwrap();
        }
        let reopened = FileCounter::open(&path).unwrap();
        assert_eq!(reopened.current().unwrap(), 42);
        assert!(reopened.advance_to(41).is_err());
    }

    #[test]
    fn test_file_counter_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.counter");
        std::fs::write(&path, "not a number").unwrap();
        assert!(FileCounter::open(&path).is_err());
    }
}
