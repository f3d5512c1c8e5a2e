//! Idempotent repositories
//!
//! A repository records the keys of files that were processed successfully so
//! they are never delivered twice. Two implementations are provided:
//!
//! - [`MemoryRepository`] - bounded, process-local; forgets on restart
//! - [`FjallRepository`] - persisted in a Fjall keyspace; survives restarts
//!
//! ## Concurrency
//!
//! [`IdempotentRepository::add`] is an atomic insert-if-absent within one
//! process. Across consumer instances the consumer re-checks membership only
//! after it holds the file's claim, so the lock marker serializes the
//! check-then-confirm sequence for a given file.

pub mod error;
pub mod memory;
pub mod store;

pub use error::{RepositoryError, Result};
pub use memory::MemoryRepository;
pub use store::{FjallRepository, RepositoryEntry};

/// Set of processed keys. Presence is the only semantic.
pub trait IdempotentRepository: Send + Sync {
    /// Whether the key has been recorded.
    fn contains(&self, key: &str) -> Result<bool>;

    /// Record the key if absent. Returns `false` when it was already present.
    fn add(&self, key: &str) -> Result<bool>;

    /// Record the key after a successful commit. Recording twice is a no-op.
    fn confirm(&self, key: &str) -> Result<()>;

    /// Evict the key. Returns whether it was present.
    fn remove(&self, key: &str) -> Result<bool>;

    /// Evict every key.
    fn clear(&self) -> Result<()>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// `true` when the key has never been confirmed.
    fn is_new(&self, key: &str) -> Result<bool> {
        Ok(!self.contains(key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn exercise(repo: &dyn IdempotentRepository) {
        assert!(repo.is_new("a.txt").unwrap());
        assert!(repo.add("a.txt").unwrap());
        assert!(!repo.add("a.txt").unwrap());
        repo.confirm("a.txt").unwrap();
        repo.confirm("b.txt").unwrap();
        assert!(repo.contains("b.txt").unwrap());
        assert_eq!(repo.len().unwrap(), 2);

        assert!(repo.remove("a.txt").unwrap());
        assert!(!repo.remove("a.txt").unwrap());
        assert!(repo.is_new("a.txt").unwrap());

        repo.clear().unwrap();
        assert!(repo.is_empty().unwrap());
    }

    #[test]
    fn test_memory_contract() {
        exercise(&MemoryRepository::new(100));
    }

    #[test]
    fn test_fjall_contract() {
        let temp_dir = TempDir::new().unwrap();
        let repo = FjallRepository::open(temp_dir.path().join("idem")).unwrap();
        exercise(&repo);
    }

    #[test]
    fn test_concurrent_add_has_single_winner() {
        let temp_dir = TempDir::new().unwrap();
        let repos: Vec<Arc<dyn IdempotentRepository>> = vec![
            Arc::new(MemoryRepository::new(100)),
            Arc::new(FjallRepository::open(temp_dir.path().join("idem")).unwrap()),
        ];

        for repo in repos {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let repo = Arc::clone(&repo);
                    thread::spawn(move || repo.add("contended").unwrap())
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1);
        }
    }
}
