//! Configuration management for spoolbox
//!
//! This module provides a layered configuration system that loads settings from:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables (highest priority)
//!
//! # Usage
//!
//! ```no_run
//! use spoolbox::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Watching: {}", config.consumer.directory.display());
//! ```
//!
//! # Environment Variables
//!
//! Configuration can be overridden using environment variables with the pattern:
//! `SPOOLBOX__<section>__<key>`
//!
//! Examples:
//! - `SPOOLBOX__CONSUMER__DIRECTORY=/srv/inbox`
//! - `SPOOLBOX__CONSUMER__DELAY=2s`
//! - `SPOOLBOX__LOCK__STRATEGY=rename`
//!
//! # Configuration File
//!
//! By default, the configuration is loaded from `config/spoolbox.toml`.
//! This can be overridden using the `SPOOLBOX_CONFIG` environment variable.

mod components;
mod models;
mod sources;
mod validation;

// Re-export public types
pub use crate::humanize::{ByteSize, HumanDuration};
pub use components::BuildError;
pub use models::{
    Config, ConsumerConfig, IdempotentConfig, LockConfig, ProducerConfig, RepositoryKind,
};
pub use sources::config_path;
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load configuration from all sources (file + environment)
    ///
    /// Configuration is loaded with the following priority (highest to lowest):
    /// 1. Environment variables (`SPOOLBOX__*`)
    /// 2. TOML file (default: `config/spoolbox.toml`)
    /// 3. Default values
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file is malformed
    /// - Validation fails (contradictory options, bad patterns or expressions)
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific path
    ///
    /// Useful for testing with custom configuration files.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Check an in-memory configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validation::validate(self)
    }
}
