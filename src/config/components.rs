//! Runtime parts assembled from configuration

use super::models::{Config, ConsumerConfig, IdempotentConfig, LockConfig, ProducerConfig, RepositoryKind};
use crate::commit::{CommitError, CommitStrategy};
use crate::consumer::{Consumer, ConsumerOptions};
use crate::done::{DoneFileError, DoneFileName};
use crate::expression::{Expression, ExpressionError};
use crate::filter::{FilterChain, FilterError};
use crate::idempotent::{FjallRepository, IdempotentRepository, MemoryRepository, RepositoryError};
use crate::lock::{ChangedCheck, LockManager};
use crate::poller::{Poller, PollerOptions};
use crate::relocate::RenameOptions;
use crate::writer::{WriteTarget, Writer, parse_chmod};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Filter: {0}")]
    Filter(#[from] FilterError),

    #[error("Commit strategy: {0}")]
    Commit(#[from] CommitError),

    #[error("Expression: {0}")]
    Expression(#[from] ExpressionError),

    #[error("Done file name: {0}")]
    DoneFile(#[from] DoneFileError),

    #[error("Idempotent repository: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Invalid chmod '{0}'")]
    InvalidChmod(String),
}

pub type Result<T> = std::result::Result<T, BuildError>;

fn done_file(pattern: &Option<String>) -> Result<Option<DoneFileName>> {
    Ok(pattern.as_deref().map(DoneFileName::new).transpose()?)
}

fn expression(source: &Option<String>) -> Result<Option<Expression>> {
    Ok(source.as_deref().map(Expression::parse).transpose()?)
}

impl IdempotentConfig {
    pub fn open_repository(&self) -> Result<Arc<dyn IdempotentRepository>> {
        let repository: Arc<dyn IdempotentRepository> = match self.kind {
            RepositoryKind::Memory => Arc::new(MemoryRepository::new(self.capacity)),
            RepositoryKind::Fjall => Arc::new(FjallRepository::open(&self.path)?),
        };
        Ok(repository)
    }
}

impl LockConfig {
    pub fn lock_manager(&self) -> LockManager {
        LockManager::new(self.strategy, self.stale_timeout.as_duration())
    }

    pub fn changed_check(&self) -> Option<ChangedCheck> {
        self.changed.then(|| ChangedCheck {
            check_interval: self.check_interval.as_duration(),
            timeout: self.changed_timeout.as_duration(),
            min_length: self.min_length.as_u64(),
            min_age: self.min_age.as_duration(),
        })
    }
}

impl ConsumerConfig {
    pub fn poller_options(&self) -> PollerOptions {
        PollerOptions {
            recursive: self.recursive,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
            auto_create: self.auto_create,
            directory_must_exist: self.directory_must_exist,
            sort_by: self.sort_by.clone(),
            shuffle: self.shuffle,
            max_messages_per_poll: self.max_messages_per_poll,
            eager_max_messages_per_poll: self.eager_max_messages_per_poll,
        }
    }

    pub fn poller(&self) -> Poller {
        Poller::new(self.directory.clone(), self.poller_options())
    }

    /// Filter chain; `repository` is attached only when the consumer is
    /// idempotent.
    pub fn filter_chain(&self, repository: Option<Arc<dyn IdempotentRepository>>) -> Result<FilterChain> {
        let mut chain = FilterChain::new();
        if let Some(pattern) = &self.include {
            chain = chain.include(pattern)?;
        }
        if let Some(pattern) = &self.exclude {
            chain = chain.exclude(pattern)?;
        }
        if let Some(list) = &self.include_ext {
            chain = chain.include_ext(list);
        }
        if let Some(list) = &self.exclude_ext {
            chain = chain.exclude_ext(list);
        }
        if let Some(list) = &self.ant_include {
            chain = chain.ant_include(list, self.ant_case_sensitive)?;
        }
        if let Some(list) = &self.ant_exclude {
            chain = chain.ant_exclude(list, self.ant_case_sensitive)?;
        }
        if let Some(done) = done_file(&self.done_file_name)? {
            chain = chain.done_file(done);
        }
        if let (true, Some(repository)) = (self.is_idempotent(), repository) {
            chain = chain.idempotent(repository, expression(&self.idempotent_key)?);
        }
        Ok(chain)
    }

    pub fn commit_strategy(&self) -> Result<CommitStrategy> {
        let mut strategy = CommitStrategy::from_options(self.delete, self.noop, self.move_to.as_deref())?
            .rename_options(RenameOptions {
                copy_and_delete_on_fail: self.copy_and_delete_on_rename_fail,
                rename_using_copy: self.rename_using_copy,
            })
            .done_file(done_file(&self.done_file_name)?)
            .existing(self.move_existing_policy, expression(&self.move_existing)?)?;
        if let Some(dir) = &self.move_failed {
            strategy = strategy.move_failed(Expression::directory_or_template(dir)?);
        }
        if let Some(dir) = &self.pre_move {
            strategy = strategy.pre_move(Expression::directory_or_template(dir)?);
        }
        Ok(strategy)
    }

    pub fn consumer_options(&self, lock: &LockConfig) -> ConsumerOptions {
        ConsumerOptions {
            initial_delay: self.initial_delay.as_duration(),
            delay: self.delay.as_duration(),
            charset: self.charset,
            buffer_size: self.buffer_size,
            release_on_failure: lock.release_on_failure,
            delete_orphan_locks: lock.delete_orphan_locks,
            changed: lock.changed_check(),
        }
    }
}

impl ProducerConfig {
    pub fn write_target(&self) -> Result<WriteTarget> {
        let chmod = match &self.chmod {
            Some(mode) => Some(parse_chmod(mode).ok_or_else(|| BuildError::InvalidChmod(mode.clone()))?),
            None => None,
        };
        Ok(WriteTarget::builder()
            .directory(self.directory.clone())
            .maybe_file_name(expression(&self.file_name)?)
            .file_exist(self.file_exist)
            .maybe_move_existing(expression(&self.move_existing)?)
            .maybe_temp_file_name(done_file(&self.temp_file_name)?)
            .use_temp_file(self.use_temp_file)
            .charset(self.charset)
            .buffer_size(self.buffer_size)
            .auto_create(self.auto_create)
            .maybe_done_file_name(done_file(&self.done_file_name)?)
            .maybe_append_chars(self.append_chars.clone())
            .lock_timeout(self.lock_timeout.as_duration())
            .maybe_chmod(chmod)
            .build())
    }
}

impl Config {
    /// Writer whose producer locks go stale after the lock section's timeout.
    pub fn writer(&self) -> Writer {
        Writer::new(self.lock.stale_timeout.as_duration())
    }

    /// Consumer over `consumer.directory`. The repository is opened only
    /// when the consumer is idempotent.
    pub fn consumer(&self) -> Result<Consumer> {
        let repository = if self.consumer.is_idempotent() {
            Some(self.idempotent.open_repository()?)
        } else {
            None
        };
        self.consumer_with(repository)
    }

    /// Consumer sharing an already opened repository.
    pub fn consumer_with(&self, repository: Option<Arc<dyn IdempotentRepository>>) -> Result<Consumer> {
        Ok(Consumer::new(
            self.consumer.poller(),
            self.consumer.filter_chain(repository)?,
            self.lock.lock_manager(),
            self.consumer.commit_strategy()?,
            self.consumer.consumer_options(&self.lock),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitPlan;
    use crate::relocate::FileExist;

    #[test]
    fn test_default_components() {
        let config = Config::default();
        let strategy = config.consumer.commit_strategy().unwrap();
        assert_eq!(strategy.plan(), &CommitPlan::Delete);

        let chain = config.consumer.filter_chain(None).unwrap();
        assert!(chain.repository().is_none());
        assert!(chain.done_file_name().is_none());
    }

    #[test]
    fn test_noop_attaches_repository() {
        let mut config = Config::default();
        config.consumer.noop = true;
        assert!(config.consumer.commit_strategy().unwrap().is_noop());

        let repository = config.idempotent.open_repository().unwrap();
        let chain = config.consumer.filter_chain(Some(repository)).unwrap();
        assert!(chain.repository().is_some());

        config.consumer.idempotent = Some(false);
        let repository = config.idempotent.open_repository().unwrap();
        let chain = config.consumer.filter_chain(Some(repository)).unwrap();
        assert!(chain.repository().is_none());
    }

    #[test]
    fn test_changed_check_only_when_enabled() {
        let mut config = Config::default();
        assert!(config.consumer.consumer_options(&config.lock).changed.is_none());

        config.lock.changed = true;
        config.lock.min_length = crate::humanize::ByteSize(0);
        let options = config.consumer.consumer_options(&config.lock);
        let check = options.changed.unwrap();
        assert_eq!(check.min_length, 0);
        assert_eq!(check.timeout, std::time::Duration::from_secs(10));
    }

    #[test]
    fn test_write_target_from_producer() {
        let mut producer = ProducerConfig::default();
        producer.file_name = Some("${header.fileName}.out".to_string());
        producer.file_exist = FileExist::Append;
        producer.done_file_name = Some("${file:name}.ready".to_string());
        producer.chmod = Some("600".to_string());

        let target = producer.write_target().unwrap();
        assert_eq!(target.file_exist, FileExist::Append);
        assert_eq!(target.chmod, Some(0o600));
        assert!(target.file_name.is_some());
        assert_eq!(
            target.done_file_name.as_ref().map(|d| d.pattern()),
            Some("${file:name}.ready")
        );

        producer.chmod = Some("9x".to_string());
        assert!(matches!(producer.write_target(), Err(BuildError::InvalidChmod(_))));
    }
}
