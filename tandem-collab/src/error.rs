//! Errors seen by coordinator and client-model callers.

use tandem_core::{MutationError, ProjectionError};

use crate::protocol::ProtocolError;
use crate::storage::StoreError;

/// Sync errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    Store(StoreError),
    Protocol(ProtocolError),
    Projection(ProjectionError),
    Mutation(MutationError),
    /// Message is missing a field its type requires
    InvalidMessage(String),
    /// Op refused by a validation hook or by the server
    Rejected(String),
    UnknownResolver(String),
    /// Resolver chain that reached itself, rendered `a -> b -> a`
    CyclicResolver(String),
    Resolver(String),
    /// Entity torn down while the request was being served
    Unavailable(String),
    NotConnected,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Store(e) => write!(f, "{e}"),
            SyncError::Protocol(e) => write!(f, "{e}"),
            SyncError::Projection(e) => write!(f, "{e}"),
            SyncError::Mutation(e) => write!(f, "{e}"),
            SyncError::InvalidMessage(e) => write!(f, "Invalid message: {e}"),
            SyncError::Rejected(reason) => write!(f, "{reason}"),
            SyncError::UnknownResolver(name) => write!(f, "unknown resolver: {name}"),
            SyncError::CyclicResolver(chain) => write!(f, "cyclic resolver: {chain}"),
            SyncError::Resolver(e) => write!(f, "resolver failed: {e}"),
            SyncError::Unavailable(what) => write!(f, "{what} is unavailable"),
            SyncError::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Protocol(e)
    }
}

impl From<ProjectionError> for SyncError {
    fn from(e: ProjectionError) -> Self {
        SyncError::Projection(e)
    }
}

impl From<MutationError> for SyncError {
    fn from(e: MutationError) -> Self {
        SyncError::Mutation(e)
    }
}
