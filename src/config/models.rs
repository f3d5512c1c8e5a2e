use crate::filter::SortBy;
use crate::humanize::{ByteSize, HumanDuration};
use crate::lock::LockStrategy;
use crate::relocate::FileExist;
use crate::writer::Charset;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub idempotent: IdempotentConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
}

/// Consumer (polling) side
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_inbox")]
    pub directory: PathBuf,
    #[serde(default = "default_initial_delay")]
    pub initial_delay: HumanDuration,
    #[serde(default = "default_delay")]
    pub delay: HumanDuration,
    #[serde(default)]
    pub recursive: bool,
    pub min_depth: Option<usize>,
    pub max_depth: Option<usize>,

    /// Regex the whole file name must match
    pub include: Option<String>,
    /// Regex; matching names are skipped (checked before `include`)
    pub exclude: Option<String>,
    /// Comma separated extensions, e.g. `txt,tar.gz`
    pub include_ext: Option<String>,
    pub exclude_ext: Option<String>,
    /// Comma separated Ant patterns over the relative path, e.g. `**/*.csv`
    pub ant_include: Option<String>,
    /// Takes precedence over `ant_include`
    pub ant_exclude: Option<String>,
    #[serde(default = "default_true")]
    pub ant_case_sensitive: bool,

    #[serde(default)]
    pub noop: bool,
    /// Defaults to `noop`
    pub idempotent: Option<bool>,
    pub idempotent_key: Option<String>,

    #[serde(default)]
    pub delete: bool,
    /// Directory or expression for successfully processed files
    #[serde(rename = "move")]
    pub move_to: Option<String>,
    pub move_failed: Option<String>,
    pub pre_move: Option<String>,
    pub done_file_name: Option<String>,

    #[serde(default)]
    pub charset: Charset,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: ByteSize,
    #[serde(default = "default_true")]
    pub auto_create: bool,
    #[serde(default)]
    pub directory_must_exist: bool,

    pub sort_by: Option<SortBy>,
    #[serde(default)]
    pub shuffle: bool,
    pub max_messages_per_poll: Option<usize>,
    #[serde(default = "default_true")]
    pub eager_max_messages_per_poll: bool,

    #[serde(default = "default_true")]
    pub copy_and_delete_on_rename_fail: bool,
    #[serde(default)]
    pub rename_using_copy: bool,
    /// Where an occupied move destination goes under `move_existing_policy = "Move"`
    pub move_existing: Option<String>,
    #[serde(default)]
    pub move_existing_policy: FileExist,
}

impl ConsumerConfig {
    /// `noop` implies idempotent unless explicitly disabled.
    pub fn is_idempotent(&self) -> bool {
        self.idempotent.unwrap_or(self.noop)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            directory: default_inbox(),
            initial_delay: default_initial_delay(),
            delay: default_delay(),
            recursive: false,
            min_depth: None,
            max_depth: None,
            include: None,
            exclude: None,
            include_ext: None,
            exclude_ext: None,
            ant_include: None,
            ant_exclude: None,
            ant_case_sensitive: true,
            noop: false,
            idempotent: None,
            idempotent_key: None,
            delete: false,
            move_to: None,
            move_failed: None,
            pre_move: None,
            done_file_name: None,
            charset: Charset::default(),
            buffer_size: default_buffer_size(),
            auto_create: true,
            directory_must_exist: false,
            sort_by: None,
            shuffle: false,
            max_messages_per_poll: None,
            eager_max_messages_per_poll: true,
            copy_and_delete_on_rename_fail: true,
            rename_using_copy: false,
            move_existing: None,
            move_existing_policy: FileExist::Override,
        }
    }
}

/// Claim handling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    #[serde(default)]
    pub strategy: LockStrategy,
    /// Age after which a claim whose owner is gone may be released
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout: HumanDuration,
    /// Release (retry next cycle) rather than fence after a failure
    #[serde(default = "default_true")]
    pub release_on_failure: bool,
    /// Release abandoned claims when the consumer starts
    #[serde(default = "default_true")]
    pub delete_orphan_locks: bool,

    /// Only claim files whose size and modification time have settled
    #[serde(default)]
    pub changed: bool,
    #[serde(default = "default_check_interval")]
    pub check_interval: HumanDuration,
    /// How long one cycle waits for a file to settle
    #[serde(default = "default_changed_timeout")]
    pub changed_timeout: HumanDuration,
    /// Smaller files are left for a later cycle (`changed` only)
    #[serde(default = "default_min_length")]
    pub min_length: ByteSize,
    /// Settled once this old, without waiting for two equal observations
    #[serde(default = "default_min_age")]
    pub min_age: HumanDuration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: LockStrategy::Marker,
            stale_timeout: default_stale_timeout(),
            release_on_failure: true,
            delete_orphan_locks: true,
            changed: false,
            check_interval: default_check_interval(),
            changed_timeout: default_changed_timeout(),
            min_length: default_min_length(),
            min_age: default_min_age(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    #[default]
    Memory,
    Fjall,
}

/// Idempotent repository
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IdempotentConfig {
    #[serde(default)]
    pub kind: RepositoryKind,
    #[serde(default = "default_repository_path")]
    pub path: PathBuf,
    /// Memory repository only
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for IdempotentConfig {
    fn default() -> Self {
        Self {
            kind: RepositoryKind::Memory,
            path: default_repository_path(),
            capacity: default_capacity(),
        }
    }
}

/// Producer (writer) side
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_outbox")]
    pub directory: PathBuf,
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_exist: FileExist,
    pub move_existing: Option<String>,
    pub temp_file_name: Option<String>,
    #[serde(default = "default_true")]
    pub use_temp_file: bool,
    #[serde(default)]
    pub charset: Charset,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: ByteSize,
    #[serde(default = "default_true")]
    pub auto_create: bool,
    pub done_file_name: Option<String>,
    pub append_chars: Option<String>,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout: HumanDuration,
    /// Octal permission bits, e.g. `"644"`
    pub chmod: Option<String>,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            directory: default_outbox(),
            file_name: None,
            file_exist: FileExist::Override,
            move_existing: None,
            temp_file_name: None,
            use_temp_file: true,
            charset: Charset::default(),
            buffer_size: default_buffer_size(),
            auto_create: true,
            done_file_name: None,
            append_chars: None,
            lock_timeout: default_lock_timeout(),
            chmod: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_inbox() -> PathBuf {
    PathBuf::from("data/inbox")
}

fn default_outbox() -> PathBuf {
    PathBuf::from("data/outbox")
}

fn default_repository_path() -> PathBuf {
    PathBuf::from("data/idempotent")
}

fn default_initial_delay() -> HumanDuration {
    HumanDuration::from_millis(1000)
}

fn default_delay() -> HumanDuration {
    HumanDuration::from_millis(500)
}

fn default_stale_timeout() -> HumanDuration {
    HumanDuration::from_secs(300)
}

fn default_check_interval() -> HumanDuration {
    HumanDuration::from_millis(1000)
}

fn default_changed_timeout() -> HumanDuration {
    HumanDuration::from_secs(10)
}

fn default_min_length() -> ByteSize {
    ByteSize(1)
}

fn default_min_age() -> HumanDuration {
    HumanDuration::from_millis(0)
}

fn default_lock_timeout() -> HumanDuration {
    HumanDuration::from_secs(10)
}

fn default_buffer_size() -> ByteSize {
    ByteSize::kib(128)
}

fn default_capacity() -> usize {
    crate::idempotent::memory::DEFAULT_CAPACITY
}
