//! Error types for the aggwarden worker

use aggwarden_metadata::MetadataError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl AgentError {
    /// Another worker holds the lease; retry on the next scheduling tick.
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, AgentError::Metadata(e) if e.is_lease_conflict())
    }
}
