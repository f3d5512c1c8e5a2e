use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use super::exchange::Exchange;
use crate::writer::{Payload, WriteTarget, Writer};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("processing failed: {0}")]
    Failed(String),
}

/// Downstream handler for consumed files.
///
/// Returning an error routes the file to the failure branch of the commit
/// strategy; the file is never deleted on failure.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, exchange: &Exchange) -> Result<(), ProcessError>;
}

/// Logs every exchange and accepts it.
#[derive(Debug, Default, Clone)]
pub struct LoggingProcessor;

#[async_trait]
impl Processor for LoggingProcessor {
    async fn process(&self, exchange: &Exchange) -> Result<(), ProcessError> {
        info!(
            id = %exchange.id(),
            file = exchange.header(super::exchange::FILE_RELATIVE_PATH).unwrap_or_default(),
            bytes = exchange.body().len(),
            "Received file"
        );
        Ok(())
    }
}

/// Hands each exchange to a [`Writer`], keeping the relative file name.
pub struct RelayProcessor {
    writer: Arc<Writer>,
    target: Arc<WriteTarget>,
}

impl RelayProcessor {
    pub fn new(writer: Arc<Writer>, target: WriteTarget) -> Self {
        Self {
            writer,
            target: Arc::new(target),
        }
    }
}

#[async_trait]
impl Processor for RelayProcessor {
    async fn process(&self, exchange: &Exchange) -> Result<(), ProcessError> {
        let writer = Arc::clone(&self.writer);
        let target = Arc::clone(&self.target);
        let body = exchange.body().clone();
        let headers = exchange.headers().clone();

        let result = tokio::task::spawn_blocking(move || writer.write(&target, Payload::Bytes(body), &headers))
            .await
            .map_err(|e| ProcessError::Failed(e.to_string()))?
            .map_err(|e| ProcessError::Failed(e.to_string()))?;

        info!(id = %exchange.id(), path = %result.path.display(), "Relayed file");
        Ok(())
    }
}
