use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use super::IdempotentRepository;
use super::error::{RepositoryError, Result};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
struct Inner {
    keys: HashSet<String>,
    order: VecDeque<String>,
}

/// Process-local repository holding at most `capacity` keys.
///
/// When full, the oldest key is evicted first.
#[derive(Debug)]
pub struct MemoryRepository {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl MemoryRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| RepositoryError::Poisoned)
    }

    fn insert(&self, inner: &mut Inner, key: &str) {
        inner.keys.insert(key.to_string());
        inner.order.push_back(key.to_string());
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.keys.remove(&oldest);
                debug!(key = %oldest, "Evicted oldest idempotent key");
            }
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl IdempotentRepository for MemoryRepository {
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.keys.contains(key))
    }

    fn add(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        if inner.keys.contains(key) {
            return Ok(false);
        }
        self.insert(&mut inner, key);
        Ok(true)
    }

    fn confirm(&self, key: &str) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.keys.contains(key) {
            self.insert(&mut inner, key);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        let removed = inner.keys.remove(key);
        if removed {
            inner.order.retain(|k| k != key);
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        inner.keys.clear();
        inner.order.clear();
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.lock()?.keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_evicts_oldest() {
        let repo = MemoryRepository::new(2);
        repo.confirm("one").unwrap();
        repo.confirm("two").unwrap();
        repo.confirm("three").unwrap();

        assert!(!repo.contains("one").unwrap());
        assert!(repo.contains("two").unwrap());
        assert!(repo.contains("three").unwrap());
        assert_eq!(repo.len().unwrap(), 2);
    }
}
