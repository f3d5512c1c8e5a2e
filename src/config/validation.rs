use super::models::{Config, ConsumerConfig, LockConfig, ProducerConfig};
use crate::done::DoneFileName;
use crate::expression::Expression;
use crate::filter::ant::ant_regex;
use crate::filter::full_match_regex;
use crate::relocate::FileExist;
use crate::writer::parse_chmod;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("consumer.delete and consumer.move are mutually exclusive")]
    DeleteAndMove,

    #[error("consumer.noop cannot be combined with delete or move")]
    NoopConflict,

    #[error("{section}: file exist policy Move requires move_existing")]
    MissingMoveExisting { section: &'static str },

    #[error("{section}.buffer_size must be positive")]
    ZeroBufferSize { section: &'static str },

    #[error("consumer.delay must be positive")]
    ZeroDelay,

    #[error("consumer.min_depth ({min}) exceeds max_depth ({max})")]
    InvalidDepth { min: usize, max: usize },

    #[error("Invalid pattern in {field}: {message}")]
    InvalidPattern { field: &'static str, message: String },

    #[error("Invalid expression in {field}: {message}")]
    InvalidExpression { field: &'static str, message: String },

    #[error("Invalid done file name in {field}: {message}")]
    InvalidDoneFileName { field: &'static str, message: String },

    #[error("producer.chmod '{0}' is not an octal permission")]
    InvalidChmod(String),

    #[error("idempotent.capacity must be positive")]
    ZeroCapacity,

    #[error("lock.changed_timeout ({timeout}) must exceed lock.check_interval ({interval}), which must be positive")]
    ChangedTiming { interval: String, timeout: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_commit_options(&config.consumer)?;
    validate_consumer_limits(&config.consumer)?;
    validate_consumer_expressions(&config.consumer)?;
    validate_producer(&config.producer)?;
    validate_lock(&config.lock)?;
    if config.idempotent.capacity == 0 {
        return Err(ValidationError::ZeroCapacity);
    }
    Ok(())
}

/// delete / move / noop combinations and the move-existing requirement
fn validate_commit_options(consumer: &ConsumerConfig) -> Result<(), ValidationError> {
    if consumer.delete && consumer.move_to.is_some() {
        return Err(ValidationError::DeleteAndMove);
    }
    if consumer.noop && (consumer.delete || consumer.move_to.is_some()) {
        return Err(ValidationError::NoopConflict);
    }
    if consumer.move_existing_policy == FileExist::Move && consumer.move_existing.is_none() {
        return Err(ValidationError::MissingMoveExisting { section: "consumer" });
    }
    Ok(())
}

fn validate_consumer_limits(consumer: &ConsumerConfig) -> Result<(), ValidationError> {
    if consumer.buffer_size.as_u64() == 0 {
        return Err(ValidationError::ZeroBufferSize { section: "consumer" });
    }
    if consumer.delay.is_zero() {
        return Err(ValidationError::ZeroDelay);
    }
    if let (Some(min), Some(max)) = (consumer.min_depth, consumer.max_depth) {
        if min > max {
            return Err(ValidationError::InvalidDepth { min, max });
        }
    }
    Ok(())
}

fn validate_lock(lock: &LockConfig) -> Result<(), ValidationError> {
    if lock.changed && (lock.check_interval.is_zero() || lock.changed_timeout <= lock.check_interval) {
        return Err(ValidationError::ChangedTiming {
            interval: lock.check_interval.to_string(),
            timeout: lock.changed_timeout.to_string(),
        });
    }
    Ok(())
}

fn check_pattern(field: &'static str, value: &Option<String>) -> Result<(), ValidationError> {
    if let Some(pattern) = value {
        full_match_regex(pattern).map_err(|e| ValidationError::InvalidPattern {
            field,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn check_ant(field: &'static str, value: &Option<String>) -> Result<(), ValidationError> {
    if let Some(list) = value {
        ant_regex(list, true).map_err(|e| ValidationError::InvalidPattern {
            field,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn check_expression(field: &'static str, value: &Option<String>, directory: bool) -> Result<(), ValidationError> {
    if let Some(source) = value {
        let parsed = if directory {
            Expression::directory_or_template(source)
        } else {
            Expression::parse(source)
        };
        parsed.map_err(|e| ValidationError::InvalidExpression {
            field,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn check_done_file(field: &'static str, value: &Option<String>) -> Result<(), ValidationError> {
    if let Some(pattern) = value {
        DoneFileName::new(pattern.as_str()).map_err(|e| ValidationError::InvalidDoneFileName {
            field,
            message: e.to_string(),
        })?;
    }
    Ok(())
}

fn validate_consumer_expressions(consumer: &ConsumerConfig) -> Result<(), ValidationError> {
    check_pattern("consumer.include", &consumer.include)?;
    check_pattern("consumer.exclude", &consumer.exclude)?;
    check_ant("consumer.ant_include", &consumer.ant_include)?;
    check_ant("consumer.ant_exclude", &consumer.ant_exclude)?;
    check_expression("consumer.move", &consumer.move_to, true)?;
    check_expression("consumer.move_failed", &consumer.move_failed, true)?;
    check_expression("consumer.pre_move", &consumer.pre_move, true)?;
    check_expression("consumer.move_existing", &consumer.move_existing, false)?;
    check_expression("consumer.idempotent_key", &consumer.idempotent_key, false)?;
    check_done_file("consumer.done_file_name", &consumer.done_file_name)?;
    Ok(())
}

fn validate_producer(producer: &ProducerConfig) -> Result<(), ValidationError> {
    if producer.buffer_size.as_u64() == 0 {
        return Err(ValidationError::ZeroBufferSize { section: "producer" });
    }
    if producer.file_exist == FileExist::Move && producer.move_existing.is_none() {
        return Err(ValidationError::MissingMoveExisting { section: "producer" });
    }
    check_expression("producer.file_name", &producer.file_name, false)?;
    check_expression("producer.move_existing", &producer.move_existing, false)?;
    check_done_file("producer.temp_file_name", &producer.temp_file_name)?;
    check_done_file("producer.done_file_name", &producer.done_file_name)?;
    if let Some(mode) = &producer.chmod {
        if parse_chmod(mode).is_none() {
            return Err(ValidationError::InvalidChmod(mode.clone()));
        }
    }
    Ok(())
}
